//! Capture facade
//!
//! Owns the analyzer and a single internal engine, and bridges the host tun
//! device: outbound packets go to the internal engine (and to analysis when
//! consumed), inbound packets are written back to the device (and analyzed
//! when they came off the wire rather than out of the NAT fast path).

pub mod flow;
pub mod punch;
pub mod split;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;

use crate::analysis::Logger;
use crate::error::Result;
use crate::origin::Origin;

use split::Split;

/// Writes one IPv4 packet toward the host.
#[async_trait]
pub trait Device: Send + Sync {
    async fn send(&self, packet: &[u8]) -> Result<()>;
}

/// Inbound injector: ships a packet back toward the host tun device,
/// optionally through incoming analysis. Fire-and-forget, usable from
/// synchronous contexts.
pub trait Hole: Send + Sync {
    fn land(&self, packet: Vec<u8>, analyze: bool);
}

/// Shared half of the capture: the device writer and the analyzer.
pub(crate) struct CaptureInner {
    device: Arc<dyn Device>,
    analyzer: Mutex<Logger>,
}

impl CaptureInner {
    async fn land_incoming(&self, packet: Vec<u8>, analyze: bool) {
        if let Err(error) = self.device.send(&packet).await {
            warn!("device write failed: {}", error);
            return;
        }
        if analyze {
            self.analyzer.lock().unwrap().analyze_incoming(&packet);
        }
    }
}

/// `Hole` handle over the capture's shared half.
struct Injector(Arc<CaptureInner>);

impl Hole for Injector {
    fn land(&self, packet: Vec<u8>, analyze: bool) {
        let inner = Arc::clone(&self.0);
        tokio::spawn(async move {
            inner.land_incoming(packet, analyze).await;
        });
    }
}

/// Which engine handles outbound packets.
enum Internal {
    /// Full per-flow demultiplexing.
    Split(Arc<Split>),
    /// Identity: the upstream terminates flows itself.
    Pass(Pass),
}

/// Identity engine: every outbound packet is shipped to the upstream sink
/// unchanged and reported consumed.
struct Pass {
    upstream: Arc<dyn Device>,
}

pub struct Capture {
    inner: Arc<CaptureInner>,
    internal: Internal,
}

impl Capture {
    /// Start a capture with a split engine connected to `origin`. The
    /// acceptor binds to `local` on a kernel-chosen port.
    pub async fn start(
        device: Arc<dyn Device>,
        logger: Logger,
        origin: Arc<dyn Origin>,
        local: Ipv4Addr,
    ) -> Result<Arc<Self>> {
        let inner = Arc::new(CaptureInner {
            device,
            analyzer: Mutex::new(logger),
        });
        let hole: Arc<dyn Hole> = Arc::new(Injector(Arc::clone(&inner)));
        let split = Split::connect(hole, origin, local).await?;
        Ok(Arc::new(Self {
            inner,
            internal: Internal::Split(split),
        }))
    }

    /// Start a pass-through capture whose upstream terminates flows itself.
    /// Returns the capture plus the injector the upstream's receive side
    /// feeds inbound packets into.
    pub fn start_pass(
        device: Arc<dyn Device>,
        logger: Logger,
        upstream: Arc<dyn Device>,
    ) -> (Arc<Self>, Arc<dyn Hole>) {
        let inner = Arc::new(CaptureInner {
            device,
            analyzer: Mutex::new(logger),
        });
        let capture = Arc::new(Self {
            inner: Arc::clone(&inner),
            internal: Internal::Pass(Pass { upstream }),
        });
        (capture, Arc::new(Injector(inner)))
    }

    /// One packet read from the host tun device. The internal engine works
    /// on its own copy; analysis sees the packet exactly as the host
    /// emitted it.
    pub async fn land(&self, packet: Vec<u8>) {
        let consumed = match &self.internal {
            Internal::Split(split) => match split.send(packet.clone()).await {
                Ok(consumed) => consumed,
                Err(error) => {
                    warn!("split engine failed: {}", error);
                    false
                }
            },
            Internal::Pass(pass) => match pass.upstream.send(&packet).await {
                Ok(()) => true,
                Err(error) => {
                    warn!("upstream send failed: {}", error);
                    false
                }
            },
        };
        if consumed {
            self.inner.analyzer.lock().unwrap().analyze(&packet);
        }
    }

    /// The acceptor socket of the split engine, if one is running.
    pub fn local(&self) -> Option<crate::common::Socket> {
        match &self.internal {
            Internal::Split(split) => Some(split.local()),
            Internal::Pass(_) => None,
        }
    }
}
