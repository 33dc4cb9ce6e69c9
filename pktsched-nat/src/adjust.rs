//! Renumbering TCP segments of a connection whose stream lengths were changed by mangling.

use pnet::packet::tcp::MutableTcpPacket;
use pktsched_common::{checksum, constants::IPPROTO_TCP, Packet};

use crate::{
    mangle::{IpLayout, TCP_HLEN},
    Direction, MangleError, NatConnection, SequenceOffset,
};

const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_SACK: u8 = 5;
const TCPOLEN_SACK_PERBLOCK: usize = 8;

/// Rewrites `seq`, `ack_seq` and SACK blocks of a TCP segment travelling in `dir`, patching the
/// checksum incrementally.
///
/// Returns `false` without touching the packet if no rewrite on the connection changed a stream
/// length. Option lists are validated before anything is written.
pub fn adjust_sequence(
    packet: &mut Packet,
    conn: &NatConnection,
    dir: Direction,
) -> Result<bool, MangleError> {
    let (this_way, other_way) = conn.offsets(dir);
    if this_way.is_zero() && other_way.is_zero() {
        return Ok(false);
    }

    let ip = IpLayout::parse(packet.data())?.require_protocol(IPPROTO_TCP)?;
    let doff = ip.tcp_header_len(packet.data())?;

    let options = ip.ihl + TCP_HLEN..ip.ihl + doff;
    let blocks = sack_blocks(&packet.data()[options.clone()])?;

    let segment = &mut packet.data_mut()[ip.ihl..];
    let mut tcp = MutableTcpPacket::new(segment).ok_or(MangleError::Truncated)?;

    let (seq, ack) = (tcp.get_sequence(), tcp.get_acknowledgement());
    let new_seq = this_way.map_seq(seq);
    let new_ack = other_way.map_ack(ack);

    let mut check = tcp.get_checksum();
    check = checksum::update32(check, seq, new_seq);
    check = checksum::update32(check, ack, new_ack);
    tcp.set_sequence(new_seq);
    tcp.set_acknowledgement(new_ack);

    let data = packet.data_mut();
    for block in blocks {
        let at = options.start + block;
        let odd = (at - ip.ihl) % 2 == 1;
        let edges = &mut data[at..at + TCPOLEN_SACK_PERBLOCK];
        check = sack_adjust(edges, &other_way, check, odd);
    }
    data[ip.ihl + 16..ip.ihl + 18].copy_from_slice(&check.to_be_bytes());

    tracing::trace!(?dir, seq, new_seq, ack, new_ack, "adjusted sequence numbers");
    Ok(true)
}

/// Offsets, relative to the start of `options`, of every SACK block present.
fn sack_blocks(options: &[u8]) -> Result<Vec<usize>, MangleError> {
    let mut blocks = Vec::new();
    let mut off = 0;

    while off < options.len() {
        match options[off] {
            TCPOPT_EOL => break,
            TCPOPT_NOP => off += 1,
            kind => {
                // No partial options.
                let Some(&len) = options.get(off + 1) else {
                    return Err(MangleError::MalformedOptions);
                };
                let len = len as usize;
                if len < 2 || off + len > options.len() {
                    return Err(MangleError::MalformedOptions);
                }

                if kind == TCPOPT_SACK
                    && len >= 2 + TCPOLEN_SACK_PERBLOCK
                    && (len - 2) % TCPOLEN_SACK_PERBLOCK == 0
                {
                    blocks.extend((off + 2..off + len).step_by(TCPOLEN_SACK_PERBLOCK));
                }
                off += len;
            }
        }
    }

    Ok(blocks)
}

/// Maps one SACK block back through the reverse direction's offsets. Returns the patched
/// checksum.
///
/// A block at an odd segment offset straddles checksum words, so its edges are summed in
/// swapped byte lanes.
fn sack_adjust(block: &mut [u8], offset: &SequenceOffset, check: u16, odd: bool) -> u16 {
    let start = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let end = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
    let new_start = offset.map_ack(start);
    let new_end = offset.map_ack(end);

    block[0..4].copy_from_slice(&new_start.to_be_bytes());
    block[4..8].copy_from_slice(&new_end.to_be_bytes());

    if odd {
        let check = check.swap_bytes();
        let check = checksum::update32(checksum::update32(check, start, new_start), end, new_end);
        return check.swap_bytes();
    }
    checksum::update32(checksum::update32(check, start, new_start), end, new_end)
}
