//! Addressing tuples used as flow keys
//!
//! These types identify traffic at increasing levels of precision:
//! a `Socket` is one endpoint, a `Four` is a directed endpoint pair,
//! and a `Five` adds the layer-4 protocol. All of them are small `Copy`
//! values with structural equality so they can be used as map keys.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 endpoint: host address plus TCP/UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Socket {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Socket {
    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }

    /// Build from a big-endian-decoded host word, as read out of an IPv4
    /// header.
    pub fn from_u32(host: u32, port: u16) -> Self {
        Self {
            host: Ipv4Addr::from(host),
            port,
        }
    }

    pub fn host_u32(&self) -> u32 {
        u32::from(self.host)
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddrV4> for Socket {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Socket> for SocketAddr {
    fn from(socket: Socket) -> Self {
        SocketAddr::V4(SocketAddrV4::new(socket.host, socket.port))
    }
}

/// An ordered (source, target) pair identifying one direction of a TCP
/// connection or UDP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Four {
    pub source: Socket,
    pub target: Socket,
}

impl Four {
    pub fn new(source: Socket, target: Socket) -> Self {
        Self { source, target }
    }
}

impl fmt::Display for Four {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

/// Layer-4 protocol tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer4 {
    Tcp,
    Udp,
    Icmp,
}

impl Layer4 {
    /// The IPv4 protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Layer4::Tcp => 6,
            Layer4::Udp => 17,
            Layer4::Icmp => 1,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Layer4::Tcp),
            17 => Some(Layer4::Udp),
            1 => Some(Layer4::Icmp),
            _ => None,
        }
    }
}

impl fmt::Display for Layer4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer4::Tcp => write!(f, "tcp"),
            Layer4::Udp => write!(f, "udp"),
            Layer4::Icmp => write!(f, "icmp"),
        }
    }
}

/// A `Four` plus its layer-4 protocol: the canonical flow key used by the
/// analyzer and the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Five {
    pub protocol: Layer4,
    pub four: Four,
}

impl Five {
    pub fn new(protocol: Layer4, source: Socket, target: Socket) -> Self {
        Self {
            protocol,
            four: Four::new(source, target),
        }
    }

    pub fn source(&self) -> Socket {
        self.four.source
    }

    pub fn target(&self) -> Socket {
        self.four.target
    }
}

impl fmt::Display for Five {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.four)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn socket(last: u8, port: u16) -> Socket {
        Socket::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_socket_display() {
        assert_eq!(socket(7, 443).to_string(), "10.0.0.7:443");
    }

    #[test]
    fn test_socket_u32_round_trip() {
        let original = socket(9, 53);
        assert_eq!(Socket::from_u32(original.host_u32(), original.port), original);
    }

    #[test]
    fn test_four_as_map_key() {
        let four = Four::new(socket(1, 55555), socket(2, 80));
        let mut map = HashMap::new();
        map.insert(four, "flow");
        assert_eq!(map.get(&Four::new(socket(1, 55555), socket(2, 80))), Some(&"flow"));
        assert_eq!(map.get(&Four::new(socket(2, 80), socket(1, 55555))), None);
    }

    #[test]
    fn test_layer4_numbers() {
        for protocol in [Layer4::Tcp, Layer4::Udp, Layer4::Icmp] {
            assert_eq!(Layer4::from_number(protocol.number()), Some(protocol));
        }
        assert_eq!(Layer4::from_number(47), None);
    }

    #[test]
    fn test_five_accessors() {
        let five = Five::new(Layer4::Udp, socket(1, 55555), socket(8, 53));
        assert_eq!(five.source(), socket(1, 55555));
        assert_eq!(five.target(), socket(8, 53));
        assert_eq!(five.to_string(), "udp 10.0.0.1:55555 -> 10.0.0.8:53");
    }
}
