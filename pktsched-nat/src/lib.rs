#![doc(issue_tracker_base_url = "https://github.com/chainbound/pktsched/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Rewriting transport payloads of IPv4 packets in place.
//!
//! [`mangle_tcp_packet`] and [`mangle_udp_packet`] replace a byte range of the payload, resizing
//! the packet and recomputing lengths and checksums. A TCP rewrite that changes the payload
//! length shifts the rest of that direction's byte stream; the shift is kept on the
//! [`NatConnection`] and [`adjust_sequence`] applies it to every later segment, in both
//! directions.

use pktsched_common::PacketError;
use thiserror::Error;

mod adjust;
pub use adjust::adjust_sequence;

mod conn;
pub use conn::{Direction, NatConnection, SequenceOffset};

mod mangle;
pub use mangle::{mangle, mangle_tcp_packet, mangle_udp_packet};

/// Why a packet could not be rewritten.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MangleError {
    #[error("Packet too short for its headers")]
    Truncated,
    #[error("Not an IPv4 packet")]
    NotIpv4,
    #[error("Expected IP protocol {expected}, found {found}")]
    Protocol { expected: u8, found: u8 },
    #[error("Match of {len} bytes at {offset} exceeds the {payload} byte payload")]
    OutOfRange { offset: usize, len: usize, payload: usize },
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("Malformed TCP options")]
    MalformedOptions,
}
