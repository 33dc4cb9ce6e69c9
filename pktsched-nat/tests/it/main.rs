use std::net::Ipv4Addr;

use pnet::packet::{
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::{self, MutableIpv4Packet},
    tcp::{self, MutableTcpPacket, TcpPacket},
    udp::{self, MutableUdpPacket},
};
use pktsched_common::Packet;
use pktsched_nat::{
    adjust_sequence, mangle_tcp_packet, mangle_udp_packet, Direction, NatConnection,
};
use rand::{distributions::Alphanumeric, Rng};

const SRC: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 4);
const DST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);

fn ip_header(buf: &mut [u8], protocol: IpNextHeaderProtocol) {
    let total = buf.len() as u16;
    let mut ip = MutableIpv4Packet::new(buf).unwrap();
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(total);
    ip.set_ttl(64);
    ip.set_next_level_protocol(protocol);
    ip.set_source(SRC);
    ip.set_destination(DST);
    let check = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(check);
}

fn tcp_packet(seq: u32, payload: &[u8]) -> Packet {
    let mut buf = vec![0; 40 + payload.len()];
    ip_header(&mut buf, IpNextHeaderProtocols::Tcp);
    let mut tcp = MutableTcpPacket::new(&mut buf[20..]).unwrap();
    tcp.set_source(40_000);
    tcp.set_destination(21);
    tcp.set_sequence(seq);
    tcp.set_data_offset(5);
    tcp.set_payload(payload);
    let check = tcp::ipv4_checksum(&tcp.to_immutable(), &SRC, &DST);
    tcp.set_checksum(check);
    Packet::from_slice(&buf)
}

fn udp_packet(payload: &[u8]) -> Packet {
    let mut buf = vec![0; 28 + payload.len()];
    ip_header(&mut buf, IpNextHeaderProtocols::Udp);
    let mut udp = MutableUdpPacket::new(&mut buf[20..]).unwrap();
    udp.set_source(5_000);
    udp.set_destination(5_001);
    udp.set_length(8 + payload.len() as u16);
    udp.set_payload(payload);
    let check = udp::ipv4_checksum(&udp.to_immutable(), &SRC, &DST);
    udp.set_checksum(check);
    Packet::from_slice(&buf)
}

fn random_bytes(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    rng.sample_iter(&Alphanumeric).take(len).collect()
}

fn sequence(packet: &Packet) -> u32 {
    TcpPacket::new(&packet.data()[20..]).unwrap().get_sequence()
}

#[test]
fn rewrite_and_restore_is_identity() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let payload_len = rng.gen_range(1..300);
        let payload = random_bytes(&mut rng, payload_len);
        let offset = rng.gen_range(0..payload.len());
        let len = rng.gen_range(0..=payload.len() - offset);
        let original = payload[offset..offset + len].to_vec();
        let replacement_len = rng.gen_range(0..100);
        let replacement = random_bytes(&mut rng, replacement_len);

        let packet = udp_packet(&payload);
        let mut mangled = packet.clone();
        mangle_udp_packet(&mut mangled, offset, len, &replacement).unwrap();
        assert_eq!(mangled.len(), packet.len() - len + replacement.len());
        mangle_udp_packet(&mut mangled, offset, replacement.len(), &original).unwrap();
        assert_eq!(mangled, packet);

        // The connection only sees the first change; the restoring rewrite is a retransmit.
        let conn = NatConnection::new();
        let packet = tcp_packet(rng.gen(), &payload);
        let mut mangled = packet.clone();
        mangle_tcp_packet(&mut mangled, &conn, Direction::Original, offset, len, &replacement)
            .unwrap();
        mangle_tcp_packet(
            &mut mangled,
            &conn,
            Direction::Original,
            offset,
            replacement.len(),
            &original,
        )
        .unwrap();
        assert_eq!(mangled, packet);
        let delta = replacement.len() as i32 - len as i32;
        assert_eq!(conn.offset(Direction::Original).offset_after, delta);
    }
}

#[test]
fn later_segments_shift_by_the_sum_of_changes() {
    let mut rng = rand::thread_rng();
    let conn = NatConnection::new();

    let mut seq: u32 = rng.gen();
    let mut total = 0i32;
    let mut last = None;

    for _ in 0..50 {
        let payload_len = rng.gen_range(10..100);
        let payload = random_bytes(&mut rng, payload_len);
        let len = rng.gen_range(1..payload.len());
        let replacement_len = rng.gen_range(0..40);
        let replacement = random_bytes(&mut rng, replacement_len);

        let mut packet = tcp_packet(seq, &payload);
        mangle_tcp_packet(&mut packet, &conn, Direction::Original, 0, len, &replacement).unwrap();
        adjust_sequence(&mut packet, &conn, Direction::Original).unwrap();

        // The mangled segment moves by everything before it.
        assert_eq!(sequence(&packet), seq.wrapping_add_signed(total));

        last = Some((seq, payload.clone(), total));
        total += replacement.len() as i32 - len as i32;
        seq = seq.wrapping_add(payload.len() as u32);

        let mut next = tcp_packet(seq, b"next");
        adjust_sequence(&mut next, &conn, Direction::Original).unwrap();
        assert_eq!(sequence(&next), seq.wrapping_add_signed(total));
    }

    // A retransmit of the last rewritten segment keeps the offset from before its rewrite.
    let (seq, payload, before) = last.unwrap();
    let mut retransmit = tcp_packet(seq, &payload);
    adjust_sequence(&mut retransmit, &conn, Direction::Original).unwrap();
    assert_eq!(sequence(&retransmit), seq.wrapping_add_signed(before));
}
