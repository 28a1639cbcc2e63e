//! Signaling error types.

use callframe_proto::ProtocolError;
use thiserror::Error;

/// Errors reported by a relay backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Relay could not be reached
    #[error("relay unavailable: {reason}")]
    Unavailable {
        /// Backend-provided reason
        reason: String,
    },
}

/// Errors raised by a [`SignalingChannel`](crate::SignalingChannel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Target address is not registered with the relay
    #[error("target {target} is not registered")]
    TargetUnreachable {
        /// Unregistered address
        target: String,
    },

    /// Envelope failed validation or encoding
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Relay backend failure
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Channel already has a live subscription
    #[error("channel for {address} is already subscribed")]
    AlreadySubscribed {
        /// Local address of the channel
        address: String,
    },
}
