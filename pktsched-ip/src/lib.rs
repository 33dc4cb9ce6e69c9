#![doc(issue_tracker_base_url = "https://github.com/chainbound/pktsched/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! The IPv4 receive path in front of the transport handlers.
//!
//! [`IpReceiver::receive`] validates the header and its options, drops link layer padding,
//! reassembles fragmented datagrams and hands each complete datagram to the
//! [`ProtocolHandler`] registered for its protocol number.

use thiserror::Error;

mod header;
pub use header::{Ipv4Header, IPV4_MIN_HLEN};

mod options;
pub use options::{parse_options, IpOption};

mod reassembly;
pub use reassembly::{Reassembler, ReassemblyOptions, DEFAULT_REASM_TIMEOUT};

mod receiver;
pub use receiver::{Delivery, IpReceiver, ProtocolHandler};

mod stats;
pub use stats::IpCounters;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpError {
    #[error("Truncated header: {0} bytes")]
    Truncated(usize),
    #[error("Unsupported IP version {0}")]
    Version(u8),
    #[error("Invalid header length {0}")]
    HeaderLength(usize),
    #[error("Bad header checksum")]
    Checksum,
    #[error("Total length {total} does not fit the {buffer} byte buffer")]
    TotalLength { total: usize, buffer: usize },
    #[error("Malformed option at offset {offset}")]
    BadOption { offset: usize },
    #[error("Invalid fragment: {0}")]
    Fragment(&'static str),
    #[error("Fragment at {offset} overlaps received data")]
    Overlap { offset: usize },
    #[error("Reassembled datagram of {0} bytes is too large")]
    TooLarge(usize),
    #[error("Protocol {0} already has a handler")]
    HandlerExists(u8),
}
