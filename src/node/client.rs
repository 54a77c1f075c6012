//! Per-peer signalling session
//!
//! A `Client` is the node-side state for one peer fingerprint: its payment
//! wiring (locator and lottery address) and its path into the shared
//! egress. The WebRTC side of the negotiation (DTLS pinning, SCTP) is
//! supplied by the embedder through the `Negotiator` capability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::origin::Locator;

use super::egress::Egress;

/// Produces an SDP answer for an SDP offer.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn respond(&self, offer: &str, ice: &[String]) -> Result<String>;
}

/// Bridges one client's traffic into the shared egress.
pub struct Translator {
    egress: Arc<dyn Egress>,
}

impl Translator {
    pub fn new(egress: Arc<dyn Egress>) -> Self {
        Self { egress }
    }

    pub async fn send(&self, packet: &[u8]) -> Result<()> {
        self.egress.send(packet).await
    }
}

pub struct Client {
    fingerprint: String,
    locator: Locator,
    lottery: String,
    negotiator: Arc<dyn Negotiator>,
    translator: Translator,
}

impl Client {
    pub(crate) fn new(
        fingerprint: &str,
        locator: Locator,
        lottery: String,
        negotiator: Arc<dyn Negotiator>,
        translator: Translator,
    ) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            locator,
            lottery,
            negotiator,
            translator,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn lottery(&self) -> &str {
        &self.lottery
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// Negotiate: hand the peer's offer to the embedded WebRTC stack and
    /// return its answer.
    pub async fn respond(&self, offer: &str, ice: &[String]) -> Result<String> {
        self.negotiator.respond(offer, ice).await
    }
}
