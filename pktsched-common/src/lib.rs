#![doc(issue_tracker_base_url = "https://github.com/chainbound/pktsched/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod checksum;
pub mod packet;
pub mod seq;
pub mod time;

pub use packet::{Packet, PacketError};
pub use time::{Clock, ManualClock, MonotonicClock, PschedTime, TickBase, TokioClock};

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;

    /// Largest IPv4 datagram, in bytes.
    pub const IP_MAX_DATAGRAM: usize = 65_535;

    /// Standard Ethernet MTU in bytes.
    pub const MTU_ETHERNET: u32 = 1_500;

    /// IP protocol numbers used across the crates.
    pub const IPPROTO_ICMP: u8 = 1;
    pub const IPPROTO_TCP: u8 = 6;
    pub const IPPROTO_UDP: u8 = 17;
}
