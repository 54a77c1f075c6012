//! Error types for trellis

use thiserror::Error;

/// Main error type for trellis
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed packet: {0}")]
    Packet(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Journal error: {0}")]
    Journal(#[from] rusqlite::Error),

    #[error("Signalling error: {0}")]
    Signalling(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Result type alias for trellis
pub type Result<T> = std::result::Result<T, Error>;
