//! Upstream packet egress
//!
//! The egress is the node's bulk-traffic sink: forwarded IPv4 packets go in,
//! response packets come back. The reference deployment wires an OpenVPN
//! session to an exit here; that handshake lives outside this crate, so the
//! seam is a trait plus a drain used until an upstream is attached.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// Sink for bulk traffic leaving the node toward the exit.
#[async_trait]
pub trait Egress: Send + Sync {
    async fn send(&self, packet: &[u8]) -> Result<()>;
}

/// Egress with no upstream attached: counts and drops.
#[derive(Default)]
pub struct Drain {
    dropped: std::sync::atomic::AtomicU64,
}

impl Drain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl Egress for Drain {
    async fn send(&self, packet: &[u8]) -> Result<()> {
        let dropped = self
            .dropped
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if dropped == 0 {
            debug!("no upstream egress attached, dropping {} bytes", packet.len());
        }
        Ok(())
    }
}
