//! Split engine - per-packet flow demultiplexing under NAT
//!
//! Outbound packets from the host are classified per-packet: TCP flows are
//! re-addressed onto synthesised ephemeral sockets and bridged through the
//! origin, UDP datagrams are hole-punched, ICMP is swallowed. A local
//! acceptor receives the host kernel's reciprocating TCP connections.
//!
//! Routing precondition: the host must route the synthesised remote address
//! (local + 1) back at the tun interface, typically via a /31 covering
//! both. The acceptor then sees connections arriving from
//! `(remote, ephemeral)`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::common::{Four, IntoStream, Socket};
use crate::error::Result;
use crate::origin::Origin;
use crate::packet::{forge, Ipv4View, TcpView, UdpView, TCP_FLAG_SYN};

use super::flow::{Flow, Plant};
use super::punch::Punch;
use super::Hole;

/// NAT state: both directions of the table, the ephemeral port counter and
/// the punch table, guarded together.
#[derive(Default)]
struct Meta {
    /// original four-tuple -> synthesised local socket
    ephemerals: HashMap<Four, Socket>,
    /// synthesised local socket -> flow
    flows: HashMap<Socket, Arc<Flow>>,
    ephemeral: u16,
    /// host-side source socket -> punch
    udp: HashMap<Socket, Arc<Punch>>,
}

pub struct Split {
    hole: Arc<dyn Hole>,
    origin: Arc<dyn Origin>,
    /// The acceptor's bound socket; destination of every forged packet.
    local: Socket,
    /// Synthesised peer address the host kernel dials back from.
    remote: Ipv4Addr,
    meta: Mutex<Meta>,
}

impl Split {
    /// Open the acceptor on `local` (kernel-chosen port) and start its
    /// accept loop.
    pub async fn connect(
        hole: Arc<dyn Hole>,
        origin: Arc<dyn Origin>,
        local: Ipv4Addr,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((local, 0)).await?;
        let port = listener.local_addr()?.port();

        let split = Arc::new(Self {
            hole,
            origin,
            local: Socket::new(local, port),
            remote: Ipv4Addr::from(u32::from(local).wrapping_add(1)),
            meta: Mutex::new(Meta::default()),
        });

        tokio::spawn(Arc::clone(&split).accept(listener));
        Ok(split)
    }

    pub fn local(&self) -> Socket {
        self.local
    }

    /// Accept loop: the host kernel dialing a synthesised ephemeral socket
    /// completes the downstream half of its flow. Survives individual
    /// failures.
    async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((connection, peer)) => {
                    let SocketAddr::V4(peer) = peer else {
                        continue;
                    };
                    let socket = Socket::from(peer);
                    let flow = self.meta.lock().await.flows.get(&socket).cloned();
                    let Some(flow) = flow else {
                        debug!("accepted stray connection from {}", socket);
                        continue;
                    };
                    let _ = connection.set_nodelay(true);
                    if !flow.open(
                        Arc::clone(&self) as Arc<dyn Plant>,
                        connection.into_stream(),
                    ) {
                        debug!("flow {} accepted without upstream", socket);
                    }
                }
                Err(error) => {
                    warn!("accept failed: {}", error);
                }
            }
        }
    }

    /// Process one outbound packet from the host. Returns whether the
    /// packet was consumed by the tunnel.
    pub async fn send(self: &Arc<Self>, mut packet: Vec<u8>) -> Result<bool> {
        let Some(ip4) = Ipv4View::new(&packet) else {
            return Ok(false);
        };
        let header_len = ip4.header_len();
        let protocol = ip4.protocol();
        let source_host = ip4.source();
        let target_host = ip4.target();

        match protocol {
            6 => {
                let Some(tcp) = TcpView::new(&packet[header_len..]) else {
                    return Ok(false);
                };
                let four = Four::new(
                    Socket::new(source_host, tcp.source_port()),
                    Socket::new(target_host, tcp.target_port()),
                );
                let flags = tcp.flags();
                let sequence = tcp.sequence();
                trace!("tcp {} flags {:#04x}", four, flags);

                // Return direction: produced by the local acceptor on behalf
                // of an upstream connection. Reverse the NAT and hand the
                // packet back to the host.
                if four.source == self.local {
                    let original = {
                        let meta = self.meta.lock().await;
                        match meta.flows.get(&four.target) {
                            Some(flow) => flow.four(),
                            None => return Ok(false),
                        }
                    };
                    forge::forge_tcp(&mut packet, original.target, original.source);
                    self.hole.land(packet, true);
                    return Ok(false);
                }

                let mut meta = self.meta.lock().await;
                if flags & TCP_FLAG_SYN == 0 {
                    // Mid-flow segment: rewrite onto the ephemeral socket,
                    // or drop if the flow is unknown.
                    let Some(&ephemeral) = meta.ephemerals.get(&four) else {
                        return Ok(false);
                    };
                    drop(meta);
                    forge::forge_tcp(&mut packet, ephemeral, self.local);
                    self.hole.land(packet, false);
                } else if !meta.ephemerals.contains_key(&four) {
                    let Some(socket) = self.allocate(&mut meta) else {
                        warn!("ephemeral ports exhausted, dropping syn for {}", four);
                        return Ok(true);
                    };
                    let flow = Arc::new(Flow::new(four));
                    meta.ephemerals.insert(four, socket);
                    meta.flows.insert(socket, Arc::clone(&flow));
                    drop(meta);

                    // The mapping is in place before this task first awaits,
                    // so later segments of the same flow order behind it.
                    let split = Arc::clone(self);
                    tokio::spawn(async move {
                        let connected = split
                            .origin
                            .connect(&four.target.host.to_string(), four.target.port)
                            .await;
                        match connected {
                            Ok(up) => {
                                flow.set_up(up);
                                forge::forge_tcp(&mut packet, socket, split.local);
                                split.hole.land(packet, false);
                            }
                            Err(error) => {
                                warn!("connect {} failed: {}", four.target, error);
                                split.pull(&four).await;
                                let reset = forge::reset(
                                    four.target,
                                    four.source,
                                    0,
                                    sequence.wrapping_add(1),
                                );
                                split.hole.land(reset, true);
                            }
                        }
                    });
                }
                // A duplicate SYN while the mapping lives is consumed
                // silently; the pending connect finishes the handshake.
                Ok(true)
            }

            17 => {
                let Some(udp) = UdpView::new(&packet[header_len..]) else {
                    return Ok(false);
                };
                let source = Socket::new(source_host, udp.source_port());
                let target = Socket::new(target_host, udp.target_port());

                let punch = {
                    let mut meta = self.meta.lock().await;
                    match meta.udp.get(&source) {
                        Some(punch) => Arc::clone(punch),
                        None => {
                            let punch = match Punch::open(
                                &*self.origin,
                                Arc::clone(&self.hole),
                                source,
                            )
                            .await
                            {
                                Ok(punch) => punch,
                                Err(error) => {
                                    warn!("punch for {} failed: {}", source, error);
                                    return Ok(true);
                                }
                            };
                            meta.udp.insert(source, Arc::clone(&punch));
                            punch
                        }
                    }
                };

                let offset = header_len + 8;
                let size = (udp.length() as usize).saturating_sub(8);
                if packet.len() < offset + size {
                    return Ok(false);
                }
                if let Err(error) = punch.send(&packet[offset..offset + size], target).await {
                    warn!("udp send from {} to {} failed: {}", source, target, error);
                }
                Ok(true)
            }

            1 => Ok(true),

            _ => Ok(false),
        }
    }

    /// Allocate a synthesised socket on the remote address, skipping ports
    /// still held by live flows. The counter is 16-bit and wraps.
    fn allocate(&self, meta: &mut Meta) -> Option<Socket> {
        for _ in 0..usize::from(u16::MAX) {
            meta.ephemeral = meta.ephemeral.wrapping_add(1);
            if meta.ephemeral == 0 {
                continue;
            }
            let socket = Socket::new(self.remote, meta.ephemeral);
            if !meta.flows.contains_key(&socket) {
                return Some(socket);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) async fn tables(&self) -> (HashMap<Four, Socket>, Vec<Socket>, usize) {
        let meta = self.meta.lock().await;
        (
            meta.ephemerals.clone(),
            meta.flows.keys().copied().collect(),
            meta.udp.len(),
        )
    }
}

#[async_trait]
impl Plant for Split {
    async fn pull(&self, four: &Four) {
        let mut meta = self.meta.lock().await;
        let Some(socket) = meta.ephemerals.remove(four) else {
            panic!("pull of unmapped flow {}", four);
        };
        assert!(
            meta.flows.remove(&socket).is_some(),
            "nat tables out of step for {}",
            four
        );
        trace!("pulled {} from {}", four, socket);
    }
}
