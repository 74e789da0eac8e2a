//! Error handling for the link layer and transaction engine.
//!
//! Runtime protocol failures (CRC mismatches, timeouts, exception responses)
//! are counted and logged where they occur and surfaced to callers as empty
//! results, not as errors. `LinkError` covers the remaining hard failures:
//! configuration problems, transport I/O, and cipher construction.

use thiserror::Error;

/// Link layer error type
#[derive(Error, Debug, Clone)]
pub enum LinkError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Cipher construction or block operation failed
    #[error("Cipher error: {0}")]
    CipherError(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;
