//! Trellis - peer-to-peer VPN capture engine and provider node
//!
//! # Architecture
//!
//! ```text
//! client side                        server side
//!
//! host tun device                    signalling HTTPS endpoint
//!      |                                  |
//!   Capture ── Analyzer ── Journal      Node ── Client ── Translator
//!      |                                  |
//!    Split ── Flow / Punch             Egress
//!      |
//!    Origin (local or tunnelled)
//! ```
//!
//! The capture engine intercepts host IPv4 packets, splits TCP flows from
//! UDP datagrams, NATs them onto synthesised sockets and bridges them
//! through an origin; the node answers SDP offers keyed by peer fingerprint
//! and wires accepted sessions into a shared egress.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Socket/Four/Five keys, Stream, Latch
//! ├── packet/          # Header views, checksums, forge, DNS decode
//! ├── analysis/        # DNS snooping and the SQLite flow journal
//! ├── capture/         # Capture facade, Split engine, Flow, Punch
//! ├── origin/          # Outbound capability: connect, unlid, fetch
//! ├── node/            # Server node, clients, egress
//! └── tun.rs           # Host tun device plumbing
//! ```

pub mod common;
pub mod error;

pub mod analysis;
pub mod capture;
pub mod node;
pub mod origin;
pub mod packet;
pub mod tun;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Five, Four, Latch, Socket, Stream};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use analysis::Logger;
pub use capture::{Capture, Device};
pub use node::{Egress, Node};
pub use origin::{Local, Locator, Origin};
