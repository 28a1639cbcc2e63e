//! Error types for the call core.
//!
//! [`ErrorKind`] is the coarse taxonomy reported upward to observers. The
//! strongly-typed errors ([`MediaError`], [`SessionError`]) each map onto one
//! kind. Nothing in the core retries automatically: a failed negotiation ends
//! the session.

use std::fmt;

use callframe_proto::ProtocolError;
use thiserror::Error;

use crate::session::CallState;

/// Failure category reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Inbound value could not be decoded as an envelope
    MalformedEnvelope,
    /// Envelope target is not registered with the relay
    TargetUnreachable,
    /// No capture device could be opened
    DeviceUnavailable,
    /// Session description or candidate rejected by the media transport
    NegotiationError,
    /// Media transport reported a failed path
    TransportDisconnected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedEnvelope => "malformed envelope",
            Self::TargetUnreachable => "target unreachable",
            Self::DeviceUnavailable => "device unavailable",
            Self::NegotiationError => "negotiation error",
            Self::TransportDisconnected => "transport disconnected",
        };
        f.write_str(name)
    }
}

/// Errors raised by the media engine and the connection controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No front-facing (or any) capture device
    #[error("no capture device available")]
    DeviceUnavailable,

    /// Operation needs local media that was never acquired
    #[error("local media has not been acquired")]
    NoLocalMedia,

    /// Negotiation object is absent (never created or already torn down)
    #[error("negotiation object is absent")]
    NoTransport,

    /// Media transport rejected a description or candidate
    #[error("negotiation failed: {detail}")]
    Negotiation {
        /// Transport-provided reason
        detail: String,
    },
}

impl MediaError {
    /// Observer-facing category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable | Self::NoLocalMedia => ErrorKind::DeviceUnavailable,
            Self::NoTransport | Self::Negotiation { .. } => ErrorKind::NegotiationError,
        }
    }
}

/// Errors raised by the call state machine for local intents.
///
/// Inbound envelopes never produce these: an envelope that is invalid for the
/// current state is ignored, not reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Intent not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// State when the intent arrived
        state: CallState,
        /// Intent that was attempted
        operation: String,
    },

    /// Intent needs a session and there is none
    #[error("no call session to {operation}")]
    NoSession {
        /// Intent that was attempted
        operation: String,
    },

    /// Peer address rejected
    #[error("invalid peer address: {0}")]
    InvalidPeer(#[from] ProtocolError),
}

impl SessionError {
    /// Observer-facing category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPeer(_) => ErrorKind::TargetUnreachable,
            Self::InvalidState { .. } | Self::NoSession { .. } => ErrorKind::NegotiationError,
        }
    }
}
