//! Live traffic analysis
//!
//! The logger sees every packet crossing the capture boundary: outbound
//! packets exactly as the host emitted them (pre-NAT) and inbound packets
//! after NAT reversal. From that vantage point it journals five-tuples,
//! snoops DNS answers to name the addresses flows later dial, and sniffs
//! the first payload of each TCP flow for a protocol classification.

mod journal;

pub use journal::Journal;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::{debug, warn};

use crate::common::{Five, Four, Layer4, Socket};
use crate::error::Result;
use crate::packet::{dns, Ipv4View, TcpView, UdpView};

const DNS_PORT: u16 = 53;

pub struct Logger {
    journal: Journal,
    /// ip -> hostname, most recent answer wins
    dns: HashMap<Ipv4Addr, String>,
    /// flows whose first payload has already been sniffed
    sniffed: HashSet<Four>,
}

impl Logger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            journal: Journal::open(path)?,
            dns: HashMap::new(),
            sniffed: HashSet::new(),
        })
    }

    /// Outbound packet, exactly as the host emitted it.
    pub fn analyze(&mut self, packet: &[u8]) {
        let Some(ip4) = Ipv4View::new(packet) else {
            return;
        };
        match Layer4::from_number(ip4.protocol()) {
            Some(Layer4::Tcp) => {
                let Some(tcp) = TcpView::new(ip4.payload()) else {
                    return;
                };
                let five = Five::new(
                    Layer4::Tcp,
                    Socket::new(ip4.source(), tcp.source_port()),
                    Socket::new(ip4.target(), tcp.target_port()),
                );
                self.add_flow(five);

                let payload = tcp.payload();
                if !payload.is_empty() && self.sniffed.insert(five.four) {
                    self.sniff(five, payload);
                }
            }
            Some(Layer4::Udp) => {
                let Some(udp) = UdpView::new(ip4.payload()) else {
                    return;
                };
                let five = Five::new(
                    Layer4::Udp,
                    Socket::new(ip4.source(), udp.source_port()),
                    Socket::new(ip4.target(), udp.target_port()),
                );
                self.add_flow(five);
                if five.target().port == DNS_PORT {
                    self.got_protocol(five, "dns", "udp:dns");
                }
            }
            _ => {}
        }
    }

    /// Inbound packet, after NAT reversal. DNS responses feed the ip ->
    /// hostname log consulted when new flows are journaled.
    pub fn analyze_incoming(&mut self, packet: &[u8]) {
        let Some(ip4) = Ipv4View::new(packet) else {
            return;
        };
        if ip4.protocol() != Layer4::Udp.number() {
            return;
        }
        let Some(udp) = UdpView::new(ip4.payload()) else {
            return;
        };
        if udp.source_port() != DNS_PORT {
            return;
        }
        let Some(answers) = dns::answers(udp.payload()) else {
            return;
        };
        for address in answers.addresses {
            debug!("dns {} {}", answers.name, address);
            self.dns.insert(address, answers.name.clone());
        }
    }

    fn add_flow(&mut self, five: Five) {
        match self.journal.add_flow(five) {
            Ok(true) => {
                if let Some(hostname) = self.dns.get(&five.target().host).cloned() {
                    self.got_hostname(five, &hostname);
                }
            }
            Ok(false) => {}
            Err(error) => warn!("journal insert failed for {}: {}", five, error),
        }
    }

    fn got_hostname(&mut self, five: Five, hostname: &str) {
        if let Err(error) = self.journal.got_hostname(five, hostname) {
            warn!("hostname update failed for {}: {}", five, error);
        }
    }

    fn got_protocol(&mut self, five: Five, protocol: &str, chain: &str) {
        if let Err(error) = self.journal.got_protocol(five, protocol, chain) {
            warn!("protocol update failed for {}: {}", five, error);
        }
    }

    /// Classify the first payload of a flow.
    fn sniff(&mut self, five: Five, payload: &[u8]) {
        if let Some(name) = sniff_tls_sni(payload) {
            self.got_protocol(five, "tls", "tcp:tls");
            self.got_hostname(five, &name);
        } else if let Some(host) = sniff_http_host(payload) {
            self.got_protocol(five, "http", "tcp:http");
            self.got_hostname(five, &host);
        }
    }

    #[cfg(test)]
    pub(crate) fn journal(&self) -> &Journal {
        &self.journal
    }

    #[cfg(test)]
    pub(crate) fn hostname_for(&self, address: Ipv4Addr) -> Option<&str> {
        self.dns.get(&address).map(String::as_str)
    }
}

/// Extract the SNI hostname from a TLS ClientHello, if this payload is one.
fn sniff_tls_sni(payload: &[u8]) -> Option<String> {
    // record: type 0x16 (handshake), version, length
    if payload.len() < 5 || payload[0] != 0x16 {
        return None;
    }
    let record = payload.get(5..5 + u16::from_be_bytes([payload[3], payload[4]]) as usize)?;

    // handshake: type 0x01 (client hello), 24-bit length
    if record.len() < 4 || record[0] != 0x01 {
        return None;
    }
    let hello = record.get(4..)?;

    // fixed fields: version (2) + random (32)
    let mut offset = 34;
    let session_len = *hello.get(offset)? as usize;
    offset += 1 + session_len;
    let ciphers_len = u16::from_be_bytes([*hello.get(offset)?, *hello.get(offset + 1)?]) as usize;
    offset += 2 + ciphers_len;
    let compressions_len = *hello.get(offset)? as usize;
    offset += 1 + compressions_len;

    let extensions_len =
        u16::from_be_bytes([*hello.get(offset)?, *hello.get(offset + 1)?]) as usize;
    offset += 2;
    let mut extensions = hello.get(offset..offset + extensions_len)?;

    while extensions.len() >= 4 {
        let kind = u16::from_be_bytes([extensions[0], extensions[1]]);
        let length = u16::from_be_bytes([extensions[2], extensions[3]]) as usize;
        let body = extensions.get(4..4 + length)?;
        if kind == 0 {
            // server_name list: length (2), entry type (1), name length (2)
            if body.len() < 5 || body[2] != 0 {
                return None;
            }
            let name_len = u16::from_be_bytes([body[3], body[4]]) as usize;
            let name = body.get(5..5 + name_len)?;
            return String::from_utf8(name.to_vec()).ok();
        }
        extensions = &extensions[4 + length..];
    }
    None
}

/// Extract the Host header from a plaintext HTTP/1.x request, if this
/// payload starts one.
fn sniff_http_host(payload: &[u8]) -> Option<String> {
    const METHODS: [&[u8]; 7] = [
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"CONNECT ",
    ];
    if !METHODS.iter().any(|method| payload.starts_with(method)) {
        return None;
    }
    let text = std::str::from_utf8(&payload[..payload.len().min(2048)]).ok()?;
    for line in text.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("host") {
            let host = value.trim();
            // strip a port suffix if present
            let host = host.split(':').next().unwrap_or(host);
            return (!host.is_empty()).then(|| host.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::forge;

    fn logger() -> (tempfile::TempDir, Logger) {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::open(dir.path().join("analysis.db")).unwrap();
        (dir, logger)
    }

    fn socket(host: [u8; 4], port: u16) -> Socket {
        Socket::new(Ipv4Addr::from(host), port)
    }

    /// Minimal TLS ClientHello with an SNI extension.
    fn client_hello(name: &str) -> Vec<u8> {
        let sni_entry = {
            let mut entry = Vec::new();
            entry.extend_from_slice(&(name.len() as u16 + 3).to_be_bytes()); // list length
            entry.push(0); // host_name
            entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
            entry.extend_from_slice(name.as_bytes());
            entry
        };

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name
        extensions.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_entry);

        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // client version
        hello.extend_from_slice(&[0u8; 32]); // random
        hello.push(0); // session id
        hello.extend_from_slice(&2u16.to_be_bytes());
        hello.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        hello.push(1);
        hello.push(0); // null compression
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    /// IPv4+TCP packet carrying `payload`; checksums are irrelevant to the
    /// analyzer, which never verifies them.
    fn tcp_packet(source: Socket, target: Socket, payload: &[u8]) -> Vec<u8> {
        let mut packet = forge::reset(source, target, 0, 0);
        packet.extend_from_slice(payload);
        let total = packet.len() as u16;
        packet[2..4].copy_from_slice(&total.to_be_bytes());
        packet
    }

    fn dns_response(name: &str, address: Ipv4Addr) -> Vec<u8> {
        let mut payload = vec![
            0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            payload.push(label.len() as u8);
            payload.extend_from_slice(label.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        payload.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
        payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c, 0x00, 0x04]);
        payload.extend_from_slice(&address.octets());
        forge::datagram(socket([8, 8, 8, 8], 53), socket([10, 7, 0, 1], 55555), &payload)
    }

    #[test]
    fn test_incoming_dns_fills_log() {
        let (_dir, mut logger) = logger();
        logger.analyze_incoming(&dns_response("foo.example", Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(
            logger.hostname_for(Ipv4Addr::new(10, 0, 0, 7)),
            Some("foo.example")
        );
    }

    #[test]
    fn test_flow_annotated_at_insert() {
        let (_dir, mut logger) = logger();
        logger.analyze_incoming(&dns_response("foo.example", Ipv4Addr::new(10, 0, 0, 7)));

        let syn = tcp_packet(socket([10, 7, 0, 1], 40000), socket([10, 0, 0, 7], 443), b"");
        logger.analyze(&syn);

        let five = Five::new(
            Layer4::Tcp,
            socket([10, 7, 0, 1], 40000),
            socket([10, 0, 0, 7], 443),
        );
        let (_, hostname) = logger.journal().row(&five).unwrap();
        assert_eq!(hostname.as_deref(), Some("foo.example"));
    }

    #[test]
    fn test_tls_sni_sniffed_once() {
        let (_dir, mut logger) = logger();
        let source = socket([10, 7, 0, 1], 40001);
        let target = socket([93, 184, 216, 34], 443);

        logger.analyze(&tcp_packet(source, target, b""));
        logger.analyze(&tcp_packet(source, target, &client_hello("example.com")));

        let five = Five::new(Layer4::Tcp, source, target);
        let (protocol, hostname) = logger.journal().row(&five).unwrap();
        assert_eq!(protocol.as_deref(), Some("tls"));
        assert_eq!(hostname.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_http_host_sniffed() {
        let (_dir, mut logger) = logger();
        let source = socket([10, 7, 0, 1], 40002);
        let target = socket([93, 184, 216, 34], 80);

        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com:80\r\nAccept: */*\r\n\r\n";
        logger.analyze(&tcp_packet(source, target, request));

        let five = Five::new(Layer4::Tcp, source, target);
        let (protocol, hostname) = logger.journal().row(&five).unwrap();
        assert_eq!(protocol.as_deref(), Some("http"));
        assert_eq!(hostname.as_deref(), Some("example.com"));
    }

    #[test]
    fn test_udp_dns_flow_tagged() {
        let (_dir, mut logger) = logger();
        let packet = forge::datagram(socket([10, 7, 0, 1], 55555), socket([8, 8, 8, 8], 53), b"q");
        logger.analyze(&packet);

        let five = Five::new(Layer4::Udp, socket([10, 7, 0, 1], 55555), socket([8, 8, 8, 8], 53));
        let (protocol, _) = logger.journal().row(&five).unwrap();
        assert_eq!(protocol.as_deref(), Some("dns"));
    }

    #[test]
    fn test_sniffers_reject_noise() {
        assert!(sniff_tls_sni(b"\x17\x03\x03\x00\x10garbage").is_none());
        assert!(sniff_http_host(b"random bytes, not a request").is_none());
        assert!(sniff_http_host(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").is_none());
    }
}
