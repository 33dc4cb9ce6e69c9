use std::net::Ipv4Addr;

use pnet::packet::ipv4::Ipv4Packet;
use pktsched_common::checksum;

use crate::IpError;

/// Minimum IPv4 header length.
pub const IPV4_MIN_HLEN: usize = 20;

const IP_MF: u8 = 0b001;

/// The fields of a validated IPv4 header the receive path acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes, options included.
    pub ihl: usize,
    pub total_len: usize,
    pub id: u16,
    pub more_fragments: bool,
    /// Fragment offset in bytes.
    pub frag_offset: usize,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Validates the header at the start of `data`.
    ///
    /// Checks, in order: minimum length, version, header length, header checksum, total length
    /// against the buffer. Options are not looked at.
    pub fn parse(data: &[u8]) -> Result<Self, IpError> {
        let ip = Ipv4Packet::new(data).ok_or(IpError::Truncated(data.len()))?;

        if ip.get_version() != 4 {
            return Err(IpError::Version(ip.get_version()));
        }

        let ihl = ip.get_header_length() as usize * 4;
        if ihl < IPV4_MIN_HLEN || ihl > data.len() {
            return Err(IpError::HeaderLength(ihl));
        }

        if !checksum::verify(&data[..ihl]) {
            return Err(IpError::Checksum);
        }

        let total_len = ip.get_total_length() as usize;
        if total_len > data.len() || total_len < ihl {
            return Err(IpError::TotalLength { total: total_len, buffer: data.len() });
        }

        Ok(Self {
            ihl,
            total_len,
            id: ip.get_identification(),
            more_fragments: ip.get_flags() & IP_MF != 0,
            frag_offset: ip.get_fragment_offset() as usize * 8,
            protocol: ip.get_next_level_protocol().0,
            source: ip.get_source(),
            destination: ip.get_destination(),
        })
    }

    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.frag_offset != 0
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.total_len - self.ihl
    }
}
