//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while building, encoding or decoding signaling messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wire value is not a JSON object of the envelope shape.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong with the wire value
        reason: String,
    },

    /// Envelope has no recipient.
    #[error("envelope target is empty")]
    EmptyTarget,

    /// Envelope is addressed to its own sender.
    #[error("envelope is addressed to its own sender: {address}")]
    SelfAddressed {
        /// The address used as both sender and target
        address: String,
    },

    /// Envelope payload is not a serialized path candidate.
    #[error("malformed candidate: {reason}")]
    MalformedCandidate {
        /// What was wrong with the payload
        reason: String,
    },
}
