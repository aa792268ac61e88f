//! # Protocol Error Types
//!
//! Every failure inside the handshake or the secure channel is fatal for the
//! connection it happened on. Callers get a tagged error, never a partial result.

use std::path::PathBuf;

use thiserror::Error;

use crate::wire::MessageType;

/// Main error type for protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Underlying stream failed
    #[error("Transport error: {0}")]
    TransportError(#[from] std::io::Error),

    /// Timeout
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Connection closed
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// Structurally invalid message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Length-prefixed field over the configured bound
    #[error("Field exceeds maximum length: {size} > {max}")]
    FieldTooLarge { size: usize, max: usize },

    /// Well-formed message of the wrong type for the current step
    #[error("Unexpected message: expected {expected:?}, got {actual:?}")]
    UnexpectedMessage {
        expected: MessageType,
        actual: MessageType,
    },

    /// Unknown type tag
    #[error("Unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    /// Claimed username is not registered
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Peer key material could not be used for key agreement
    #[error("Key agreement failed: {0}")]
    KeyAgreementError(String),

    /// Signing failed or no private key available
    #[error("Signing failed: {0}")]
    SigningError(String),

    /// Signature or certificate did not verify
    #[error("Verification failed: {0}")]
    VerificationFailure(String),

    /// AEAD tag mismatch
    #[error("Authentication failure: frame tag did not verify")]
    AuthenticationFailure,

    /// Sequence number is not the expected next value
    #[error("Replay or reorder detected: expected sequence {expected}, got {received}")]
    ReplayOrReorder { expected: u64, received: u64 },

    /// Counter would wrap
    #[error("Sequence number space exhausted")]
    SequenceExhausted,

    /// Trust configuration missing or unparseable
    #[error("Identity load failed for {}: {reason}", path.display())]
    IdentityLoadError { path: PathBuf, reason: String },

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Server refused an application command
    #[error("Command rejected by server: {0}")]
    CommandRejected(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::SerializationError(e.to_string())
    }
}

impl ProtocolError {
    /// Shorthand for identity store failures
    pub fn identity_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ProtocolError::IdentityLoadError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures of the peer's cryptographic proof, as opposed to
    /// transport or framing problems.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ProtocolError::VerificationFailure(_)
                | ProtocolError::AuthenticationFailure
                | ProtocolError::UnknownUser(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_load_display() {
        let err = ProtocolError::identity_load("certificates/alice.pub", "missing");
        assert_eq!(
            err.to_string(),
            "Identity load failed for certificates/alice.pub: missing"
        );
    }

    #[test]
    fn test_authentication_classification() {
        assert!(ProtocolError::AuthenticationFailure.is_authentication());
        assert!(ProtocolError::UnknownUser("mallory".into()).is_authentication());
        assert!(!ProtocolError::ConnectionClosed.is_authentication());
    }
}
