//! In-place payload rewriting.
//!
//! A rewrite replaces `match_len` bytes at `match_offset` into the transport payload with a
//! replacement of any length, moving the rest of the payload to close or open the gap. The IP
//! total length and header checksum follow, then the transport length and checksum. Every check
//! happens before the first byte is written, so a failed rewrite leaves the packet as it was.

use std::net::Ipv4Addr;

use pnet::packet::{
    ipv4::{self, MutableIpv4Packet},
    tcp::MutableTcpPacket,
    udp::MutableUdpPacket,
    Packet as _,
};
use pktsched_common::{
    checksum,
    constants::{IPPROTO_TCP, IPPROTO_UDP, IP_MAX_DATAGRAM},
    Packet, PacketError,
};

use crate::{Direction, MangleError, NatConnection};

/// UDP header length.
const UDP_HLEN: usize = 8;
/// TCP header length without options.
pub(crate) const TCP_HLEN: usize = 20;
/// Checksum value sent on the wire when a UDP checksum computes to zero.
const CSUM_MANGLED_0: u16 = 0xFFFF;

/// The parts of the IPv4 header the mangler works with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IpLayout {
    /// Header length in bytes.
    pub(crate) ihl: usize,
    pub(crate) protocol: u8,
    pub(crate) source: Ipv4Addr,
    pub(crate) destination: Ipv4Addr,
}

impl IpLayout {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, MangleError> {
        let ip = ipv4::Ipv4Packet::new(data).ok_or(MangleError::Truncated)?;
        if ip.get_version() != 4 {
            return Err(MangleError::NotIpv4);
        }

        let ihl = ip.get_header_length() as usize * 4;
        if ihl < 20 || ihl > data.len() {
            return Err(MangleError::Truncated);
        }

        Ok(Self {
            ihl,
            protocol: ip.get_next_level_protocol().0,
            source: ip.get_source(),
            destination: ip.get_destination(),
        })
    }

    pub(crate) fn require_protocol(self, protocol: u8) -> Result<Self, MangleError> {
        if self.protocol != protocol {
            return Err(MangleError::Protocol { expected: protocol, found: self.protocol });
        }
        Ok(self)
    }

    /// Length of the TCP header, options included, of the segment following this header.
    pub(crate) fn tcp_header_len(&self, data: &[u8]) -> Result<usize, MangleError> {
        if data.len() < self.ihl + TCP_HLEN {
            return Err(MangleError::Truncated);
        }
        let doff = (data[self.ihl + 12] >> 4) as usize * 4;
        if doff < TCP_HLEN || self.ihl + doff > data.len() {
            return Err(MangleError::Truncated);
        }
        Ok(doff)
    }
}

/// Replaces `match_len` bytes at `data_offset + match_offset` (both counted from the start of the
/// IP header) with `replacement`, and fixes up the IP total length and header checksum.
///
/// Transport headers are not touched.
pub fn mangle(
    packet: &mut Packet,
    data_offset: usize,
    match_offset: usize,
    match_len: usize,
    replacement: &[u8],
) -> Result<(), MangleError> {
    let len = packet.len();
    let start = data_offset + match_offset;
    let end = start + match_len;
    if data_offset > len || end > len {
        let payload = len.saturating_sub(data_offset);
        return Err(MangleError::OutOfRange { offset: match_offset, len: match_len, payload });
    }

    // Make sure the IP header is there before moving anything.
    IpLayout::parse(packet.data())?;

    let new_len = len - match_len + replacement.len();
    if new_len > IP_MAX_DATAGRAM {
        return Err(PacketError::TooLarge(new_len).into());
    }

    if replacement.len() > match_len {
        let grow = replacement.len() - match_len;
        packet.ensure_tailroom(grow)?;
        packet.put_zeroed(grow);
        packet.data_mut().copy_within(end..len, start + replacement.len());
    } else {
        packet.data_mut().copy_within(end..len, start + replacement.len());
        packet.truncate(new_len);
    }
    packet.data_mut()[start..start + replacement.len()].copy_from_slice(replacement);

    let mut ip = MutableIpv4Packet::new(packet.data_mut()).ok_or(MangleError::Truncated)?;
    ip.set_total_length(new_len as u16);
    ip.set_checksum(0);
    let check = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(check);

    Ok(())
}

/// Rewrites part of a TCP payload and records the length change against the sender's
/// direction of `conn`.
///
/// `match_offset` is counted from the start of the TCP payload.
pub fn mangle_tcp_packet(
    packet: &mut Packet,
    conn: &NatConnection,
    dir: Direction,
    match_offset: usize,
    match_len: usize,
    replacement: &[u8],
) -> Result<(), MangleError> {
    let ip = IpLayout::parse(packet.data())?.require_protocol(IPPROTO_TCP)?;
    let doff = ip.tcp_header_len(packet.data())?;

    if let Err(e) = mangle(packet, ip.ihl + doff, match_offset, match_len, replacement) {
        let rep_len = replacement.len();
        tracing::debug!(?dir, match_offset, match_len, rep_len, "tcp mangle failed: {e}");
        return Err(e);
    }

    let mut tcp =
        MutableTcpPacket::new(&mut packet.data_mut()[ip.ihl..]).ok_or(MangleError::Truncated)?;
    tcp.set_checksum(0);
    let check = checksum::transport_checksum(ip.source, ip.destination, IPPROTO_TCP, tcp.packet());
    tcp.set_checksum(check);

    if replacement.len() != match_len {
        let delta = replacement.len() as i32 - match_len as i32;
        let seq = tcp.get_sequence();
        if conn.record(dir, seq, delta) {
            tracing::trace!(?dir, seq, delta, "recorded sequence offset");
        }
    }

    Ok(())
}

/// Rewrites part of a UDP payload.
///
/// `match_offset` is counted from the start of the UDP payload. A zero checksum (none computed
/// by the sender) stays zero.
pub fn mangle_udp_packet(
    packet: &mut Packet,
    match_offset: usize,
    match_len: usize,
    replacement: &[u8],
) -> Result<(), MangleError> {
    let ip = IpLayout::parse(packet.data())?.require_protocol(IPPROTO_UDP)?;
    if packet.len() < ip.ihl + UDP_HLEN + match_offset + match_len {
        return Err(MangleError::OutOfRange {
            offset: match_offset,
            len: match_len,
            payload: packet.len().saturating_sub(ip.ihl + UDP_HLEN),
        });
    }

    if let Err(e) = mangle(packet, ip.ihl + UDP_HLEN, match_offset, match_len, replacement) {
        let rep_len = replacement.len();
        tracing::debug!(match_offset, match_len, rep_len, "udp mangle failed: {e}");
        return Err(e);
    }

    let datalen = packet.len() - ip.ihl;
    let mut udp =
        MutableUdpPacket::new(&mut packet.data_mut()[ip.ihl..]).ok_or(MangleError::Truncated)?;
    udp.set_length(datalen as u16);

    if udp.get_checksum() == 0 {
        return Ok(());
    }

    udp.set_checksum(0);
    let check = checksum::transport_checksum(ip.source, ip.destination, IPPROTO_UDP, udp.packet());
    udp.set_checksum(if check == 0 { CSUM_MANGLED_0 } else { check });

    Ok(())
}
