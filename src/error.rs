//! Crate-level error type

use thiserror::Error;

/// Errors surfaced by the gateway's public API
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or process I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The gateway control task is no longer running
    #[error("gateway has shut down")]
    GatewayClosed,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
