//! UDP hole punching
//!
//! One punch per host-side source socket: it owns an outbound datagram
//! opening and remembers the source address, so datagrams coming back can
//! be re-encapsulated as IPv4 and injected toward the host. Entries are
//! created lazily on first outbound datagram and retained for the capture
//! lifetime.

use std::sync::Arc;

use crate::common::Socket;
use crate::error::Result;
use crate::origin::{Opening, Origin, Sewer};
use crate::packet::forge;

use super::Hole;

pub struct Punch {
    opening: Arc<dyn Opening>,
    source: Socket,
}

impl Punch {
    /// Bind a new opening through `origin` for datagrams from `source`.
    pub async fn open(origin: &dyn Origin, hole: Arc<dyn Hole>, source: Socket) -> Result<Arc<Self>> {
        let sewer = Arc::new(PunchSewer { hole, source });
        let opening = origin.unlid(sewer).await?;
        Ok(Arc::new(Self { opening, source }))
    }

    pub fn source(&self) -> Socket {
        self.source
    }

    /// Forward a decapsulated payload to `target` on the wire.
    pub async fn send(&self, payload: &[u8], target: Socket) -> Result<()> {
        self.opening.send(payload, target).await
    }
}

/// Receive side of a punch: wraps returned datagrams back into IPv4 headed
/// for the remembered source and lands them toward the host.
struct PunchSewer {
    hole: Arc<dyn Hole>,
    source: Socket,
}

impl Sewer for PunchSewer {
    fn land(&self, payload: &[u8], from: Socket) {
        let packet = forge::datagram(from, self.source, payload);
        self.hole.land(packet, true);
    }
}
