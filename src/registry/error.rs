//! Registry error types
//!
//! Request-level failures. None of these are fatal to the gateway; the
//! registry logs them and drops or closes the offending subscriber.

use thiserror::Error;

/// Error type for subscriber requests
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The locator parameter is absent or blank
    #[error("missing source locator parameter")]
    MissingLocator,
    /// The locator parameter could not be decoded
    #[error("source locator could not be decoded: {0}")]
    LocatorDecode(String),
}
