//! Internet checksum (RFC 1071) with incremental update (RFC 1624).
//!
//! [`internet_checksum`] and [`transport_checksum`] recompute from scratch and are the reference.
//! [`update16`] and [`update32`] patch an existing checksum after a field rewrite without
//! touching the rest of the packet.

use std::net::Ipv4Addr;

/// One's complement sum of `data` read as big-endian 16-bit words, starting from `initial`.
///
/// An odd trailing byte is padded with a zero byte. The result is partially folded: it fits in
/// 32 bits but may still carry above bit 15.
pub fn sum(data: &[u8], initial: u32) -> u32 {
    let mut acc = initial as u64;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u64) << 8;
    }

    while acc >> 32 != 0 {
        acc = (acc & 0xFFFF_FFFF) + (acc >> 32);
    }
    acc as u32
}

/// Folds a 32-bit partial sum down to 16 bits with end-around carry.
#[inline]
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// The checksum of `data`, ready to be stored in a header.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum(data, 0))
}

/// Returns `true` if `data`, including its stored checksum, sums to the all-ones value.
pub fn verify(data: &[u8]) -> bool {
    fold(sum(data, 0)) == 0xFFFF
}

/// Partial sum of the IPv4 pseudo header used by TCP and UDP.
pub fn pseudo_header_sum(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&source.octets());
    pseudo[4..8].copy_from_slice(&destination.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&len.to_be_bytes());
    sum(&pseudo, 0)
}

/// TCP/UDP checksum of `segment` (header and payload) over the IPv4 pseudo header.
///
/// The segment's own checksum field must be zero when this is called.
pub fn transport_checksum(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let pseudo = pseudo_header_sum(source, destination, protocol, segment.len() as u16);
    !fold(sum(segment, pseudo))
}

/// Patch `check` after a 16-bit field changed from `old` to `new`.
///
/// `HC' = ~(~HC + ~m + m')`, eqn. 3 of RFC 1624.
#[inline]
pub fn update16(check: u16, old: u16, new: u16) -> u16 {
    let acc = (!check) as u32 + (!old) as u32 + new as u32;
    !fold(acc)
}

/// Patch `check` after a 32-bit field changed from `old` to `new`.
#[inline]
pub fn update32(check: u16, old: u32, new: u32) -> u16 {
    let acc = (!check) as u32
        + (!(old >> 16) as u16) as u32
        + (!(old as u16)) as u32
        + (new >> 16)
        + (new & 0xFFFF);
    !fold(acc)
}
