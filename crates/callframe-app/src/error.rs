//! Agent error types.

use callframe_core::{CallState, ErrorKind, MediaError, SessionError};
use callframe_signaling::SignalingError;
use thiserror::Error;

/// Errors returned by [`CallAgent`](crate::CallAgent) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// A call is already in progress
    #[error("a call is already in progress ({state:?})")]
    Busy {
        /// State of the current call
        state: CallState,
    },

    /// Accept or reject without a pending incoming call
    #[error("no incoming call to answer")]
    NoIncomingCall,

    /// Media control without an active call
    #[error("no active call")]
    NoActiveCall,

    /// Configuration rejected
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong
        reason: String,
    },

    /// Call state machine refused the intent
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Relay or envelope failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Device or negotiation failure
    #[error(transparent)]
    Media(#[from] MediaError),
}

impl AgentError {
    /// Observer-facing category, if the error has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Session(e) => Some(e.kind()),
            Self::Signaling(e) => Some(signaling_error_kind(e)),
            Self::Media(e) => Some(e.kind()),
            Self::Busy { .. } | Self::NoIncomingCall | Self::NoActiveCall | Self::InvalidConfig { .. } => {
                None
            },
        }
    }
}

/// Category of a signaling failure.
pub fn signaling_error_kind(error: &SignalingError) -> ErrorKind {
    match error {
        SignalingError::Protocol(_) => ErrorKind::MalformedEnvelope,
        SignalingError::TargetUnreachable { .. }
        | SignalingError::Relay(_)
        | SignalingError::AlreadySubscribed { .. } => ErrorKind::TargetUnreachable,
    }
}

#[cfg(test)]
mod tests {
    use callframe_proto::ProtocolError;

    use super::*;

    #[test]
    fn unreachable_target_kind() {
        let err = AgentError::from(SignalingError::TargetUnreachable { target: "bob".to_string() });
        assert_eq!(err.kind(), Some(ErrorKind::TargetUnreachable));
    }

    #[test]
    fn protocol_failure_is_malformed_envelope() {
        let err = AgentError::from(SignalingError::from(ProtocolError::EmptyTarget));
        assert_eq!(err.kind(), Some(ErrorKind::MalformedEnvelope));
    }

    #[test]
    fn busy_has_no_kind() {
        assert_eq!(AgentError::Busy { state: CallState::OfferSent }.kind(), None);
    }
}
