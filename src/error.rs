//! # Error Types
//!
//! Comprehensive error handling for the peer protocol engine.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level socket failures to high-level protocol
//! violations.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket read/write and bind failures
//! - **Framing Errors**: Oversized or malformed wire frames
//! - **Protocol Errors**: State violations, unknown correlation ids, id-space
//!   exhaustion
//! - **Cryptographic Errors**: Key material and transform failures
//!
//! Protocol-level anomalies (an unknown response id, a malformed sub-message)
//! are recovered locally by the multiplexer; transport-level failures and
//! framing desynchronization are fatal to the owning connection.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Framing errors
    pub const ERR_FRAME_DESYNC: &str = "Frame stream desynchronized";
    pub const ERR_INVALID_WIDTH: &str = "Length-header width out of range (1..=8)";

    /// Connection errors
    pub const ERR_LEASE_EXPIRED: &str = "Heartbeat lease expired";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_KEY_NOT_SET: &str = "No key material installed";
    pub const ERR_BAD_KEY_MATERIAL: &str = "Malformed key material";

    /// Worker pool errors
    pub const ERR_WORKERS_STOPPED: &str = "Worker pool already shut down";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialized bulk of {size} bytes exceeds frame limit of {limit} bytes")]
    Oversize { size: usize, limit: u128 },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Connection is not open (state: {0:?})")]
    SendWhileNotOpen(ConnectionState),

    #[error("Response references unknown request id {0}")]
    MissingCorrelation(u32),

    #[error("All {0} request ids are outstanding")]
    IdSpaceExhausted(u32),

    #[error("Cryptographic failure: {0}")]
    CryptoFailure(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error must terminate the owning connection.
    ///
    /// Fatal errors close the socket; everything else is recovered locally
    /// (logged, counted, skipped).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Framing(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::CryptoFailure(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ProtocolError::Framing("desync".into()).is_fatal());
        assert!(ProtocolError::ConnectionClosed.is_fatal());
        assert!(!ProtocolError::MissingCorrelation(104).is_fatal());
        assert!(!ProtocolError::IdSpaceExhausted(899).is_fatal());
        assert!(!ProtocolError::SendWhileNotOpen(ConnectionState::Paused).is_fatal());
    }
}
