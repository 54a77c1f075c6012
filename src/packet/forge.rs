//! In-place header rewriting and packet synthesis
//!
//! `forge_tcp` is the NAT hot path: it swaps the addressing of a validated
//! IPv4+TCP packet and repairs both checksums incrementally. `reset` and
//! `datagram` build whole packets from scratch for the failure path and for
//! UDP re-encapsulation.

use crate::common::Socket;
use crate::packet::{checksum, TCP_FLAG_ACK, TCP_FLAG_RST};

const IPV4_CHECK: usize = 10;
const IPV4_SADDR: usize = 12;
const IPV4_DADDR: usize = 16;
const TCP_CHECK: usize = 16;

fn word(packet: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([packet[offset], packet[offset + 1]])
}

fn set_word(packet: &mut [u8], offset: usize, value: u16) {
    packet[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Replace the 16-bit word at `offset`, delta-updating every checksum field
/// listed in `checks`.
fn splice_word(packet: &mut [u8], offset: usize, value: u16, checks: &[usize]) {
    let old = word(packet, offset);
    if old == value {
        return;
    }
    set_word(packet, offset, value);
    for &check in checks {
        let repaired = checksum::adjust(word(packet, check), old, value);
        set_word(packet, check, repaired);
    }
}

/// Rewrite the source and target sockets of a validated IPv4+TCP packet.
///
/// Both the IPv4 header checksum and the TCP checksum are repaired by
/// incremental update, so the cost is constant regardless of payload size.
/// The caller must own the buffer uniquely and have validated it with
/// `Ipv4View`/`TcpView`.
pub fn forge_tcp(packet: &mut [u8], source: Socket, target: Socket) {
    let header_len = ((packet[0] & 0x0f) as usize) * 4;
    let tcp_check = header_len + TCP_CHECK;

    let source_host = u32::from(source.host);
    let target_host = u32::from(target.host);

    // Addresses sit in the IPv4 header and in the TCP pseudoheader, so a
    // change touches both checksums.
    splice_word(packet, IPV4_SADDR, (source_host >> 16) as u16, &[IPV4_CHECK, tcp_check]);
    splice_word(packet, IPV4_SADDR + 2, source_host as u16, &[IPV4_CHECK, tcp_check]);
    splice_word(packet, IPV4_DADDR, (target_host >> 16) as u16, &[IPV4_CHECK, tcp_check]);
    splice_word(packet, IPV4_DADDR + 2, target_host as u16, &[IPV4_CHECK, tcp_check]);

    splice_word(packet, header_len, source.port, &[tcp_check]);
    splice_word(packet, header_len + 2, target.port, &[tcp_check]);
}

fn ipv4_header(packet: &mut [u8], protocol: u8, source: Socket, target: Socket) {
    packet[0] = 0x45;
    packet[1] = 0;
    set_word(packet, 2, packet.len() as u16);
    set_word(packet, 4, 0); // id
    set_word(packet, 6, 0); // flags / fragment offset
    packet[8] = 64; // ttl
    packet[9] = protocol;
    set_word(packet, IPV4_CHECK, 0);
    packet[IPV4_SADDR..IPV4_SADDR + 4].copy_from_slice(&source.host.octets());
    packet[IPV4_DADDR..IPV4_DADDR + 4].copy_from_slice(&target.host.octets());
    let check = checksum::sum(&packet[..20]);
    set_word(packet, IPV4_CHECK, check);
}

/// Synthesise a TCP `RST|ACK` segment from `source` to `target`, used to
/// refuse a flow whose upstream connect failed.
pub fn reset(source: Socket, target: Socket, sequence: u32, acknowledge: u32) -> Vec<u8> {
    let mut packet = vec![0u8; 40];
    ipv4_header(&mut packet, 6, source, target);

    set_word(&mut packet, 20, source.port);
    set_word(&mut packet, 22, target.port);
    packet[24..28].copy_from_slice(&sequence.to_be_bytes());
    packet[28..32].copy_from_slice(&acknowledge.to_be_bytes());
    packet[32] = 5 << 4; // data offset, no options
    packet[33] = TCP_FLAG_RST | TCP_FLAG_ACK;
    set_word(&mut packet, 34, 0); // window
    set_word(&mut packet, 36, 0);
    set_word(&mut packet, 38, 0); // urgent pointer

    let check = checksum::transport(source.host, target.host, 6, &packet[20..]);
    set_word(&mut packet, 36, check);
    packet
}

/// Encapsulate a UDP payload in a fresh IPv4 datagram, used to hand punch
/// returns back to the host.
pub fn datagram(source: Socket, target: Socket, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 28 + payload.len()];
    ipv4_header(&mut packet, 17, source, target);

    set_word(&mut packet, 20, source.port);
    set_word(&mut packet, 22, target.port);
    set_word(&mut packet, 24, (8 + payload.len()) as u16);
    set_word(&mut packet, 26, 0);
    packet[28..].copy_from_slice(payload);

    // A computed zero means "no checksum" for UDP, so it is sent as all-ones.
    let check = match checksum::transport(source.host, target.host, 17, &packet[20..]) {
        0 => 0xffff,
        check => check,
    };
    set_word(&mut packet, 26, check);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Ipv4View, TcpView, UdpView, TCP_FLAG_SYN};
    use std::net::Ipv4Addr;

    fn socket(host: [u8; 4], port: u16) -> Socket {
        Socket::new(Ipv4Addr::from(host), port)
    }

    /// Build a syntactically valid IPv4+TCP packet with correct checksums.
    fn tcp_packet(source: Socket, target: Socket, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 40 + payload.len()];
        ipv4_header(&mut packet, 6, source, target);
        set_word(&mut packet, 20, source.port);
        set_word(&mut packet, 22, target.port);
        packet[24..28].copy_from_slice(&0x1000u32.to_be_bytes());
        packet[32] = 5 << 4;
        packet[33] = TCP_FLAG_SYN;
        set_word(&mut packet, 34, 0xffff);
        packet[40..].copy_from_slice(payload);
        let check = checksum::transport(source.host, target.host, 6, &packet[20..]);
        set_word(&mut packet, 36, check);
        packet
    }

    fn verify_closure(packet: &[u8]) {
        let ip4 = Ipv4View::new(packet).unwrap();
        let mut header = packet[..ip4.header_len()].to_vec();
        let stored_ip = ip4.checksum();
        header[IPV4_CHECK] = 0;
        header[IPV4_CHECK + 1] = 0;
        assert_eq!(checksum::sum(&header), stored_ip, "ipv4 checksum drifted");

        let mut transport = packet[ip4.header_len()..].to_vec();
        let check_offset = match ip4.protocol() {
            6 => TCP_CHECK,
            17 => 6,
            other => panic!("unexpected protocol {}", other),
        };
        let stored = u16::from_be_bytes([transport[check_offset], transport[check_offset + 1]]);
        transport[check_offset] = 0;
        transport[check_offset + 1] = 0;
        let mut computed =
            checksum::transport(ip4.source(), ip4.target(), ip4.protocol(), &transport);
        if ip4.protocol() == 17 && computed == 0 {
            computed = 0xffff;
        }
        assert_eq!(computed, stored, "transport checksum drifted");
    }

    #[test]
    fn test_forge_tcp_checksum_closure() {
        let mut packet = tcp_packet(
            socket([10, 7, 0, 1], 43210),
            socket([93, 184, 216, 34], 80),
            b"GET / HTTP/1.1\r\n\r\n",
        );
        verify_closure(&packet);

        forge_tcp(
            &mut packet,
            socket([10, 7, 0, 2], 17),
            socket([10, 7, 0, 1], 9999),
        );
        verify_closure(&packet);

        let ip4 = Ipv4View::new(&packet).unwrap();
        assert_eq!(ip4.source(), Ipv4Addr::new(10, 7, 0, 2));
        assert_eq!(ip4.target(), Ipv4Addr::new(10, 7, 0, 1));
        let tcp = TcpView::new(ip4.payload()).unwrap();
        assert_eq!(tcp.source_port(), 17);
        assert_eq!(tcp.target_port(), 9999);
        assert_eq!(tcp.payload(), b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_forge_tcp_identity() {
        let source = socket([192, 168, 0, 4], 50000);
        let target = socket([1, 1, 1, 1], 443);
        let mut packet = tcp_packet(source, target, b"payload");
        let before = packet.clone();
        forge_tcp(&mut packet, source, target);
        assert_eq!(packet, before);
    }

    #[test]
    fn test_reset_shape() {
        let packet = reset(
            socket([93, 184, 216, 34], 80),
            socket([10, 7, 0, 1], 43210),
            0,
            0x1001,
        );
        assert_eq!(packet.len(), 40);
        verify_closure(&packet);

        let ip4 = Ipv4View::new(&packet).unwrap();
        let tcp = TcpView::new(ip4.payload()).unwrap();
        assert_eq!(tcp.flags(), TCP_FLAG_RST | TCP_FLAG_ACK);
        assert_eq!(tcp.sequence(), 0);
        assert_eq!(word(ip4.payload(), 8), 0x0000); // ack high word
        assert_eq!(word(ip4.payload(), 10), 0x1001); // ack low word
        assert_eq!(word(ip4.payload(), 14), 0); // window
    }

    #[test]
    fn test_datagram_round_trip() {
        let source = socket([8, 8, 8, 8], 53);
        let target = socket([192, 168, 1, 2], 55555);
        let packet = datagram(source, target, b"answer bytes");
        verify_closure(&packet);

        let ip4 = Ipv4View::new(&packet).unwrap();
        assert_eq!(ip4.protocol(), 17);
        let udp = UdpView::new(ip4.payload()).unwrap();
        assert_eq!(udp.source_port(), 53);
        assert_eq!(udp.target_port(), 55555);
        assert_eq!(udp.payload(), b"answer bytes");
    }

    #[test]
    fn test_datagram_empty_payload() {
        let packet = datagram(socket([1, 2, 3, 4], 1), socket([5, 6, 7, 8], 2), b"");
        assert_eq!(packet.len(), 28);
        verify_closure(&packet);
    }
}
