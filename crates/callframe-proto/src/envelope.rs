//! Signaling envelope.
//!
//! An [`Envelope`] is what one peer writes into another peer's relay mailbox.
//! The relay treats it as an opaque string; only the two endpoints interpret
//! the payload.
//!
//! # Invariants
//!
//! - `target` is never empty.
//! - `target != sender` (no self-addressed envelopes).
//!
//! Both are checked by [`Envelope::validate`], which the codec runs on every
//! encode and decode.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Kind of signaling message.
///
/// Serialized as the upper-case `type` tag used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Caller's session description
    #[serde(rename = "OFFER")]
    Offer,
    /// Callee's session description
    #[serde(rename = "ANSWER")]
    Answer,
    /// Network path candidate discovered by the sender
    #[serde(rename = "ICE")]
    IceCandidate,
    /// Sender is leaving the call (hang-up, rejection, or busy)
    #[serde(rename = "END")]
    EndCall,
}

impl EnvelopeKind {
    /// Wire tag for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "OFFER",
            Self::Answer => "ANSWER",
            Self::IceCandidate => "ICE",
            Self::EndCall => "END",
        }
    }
}

/// Signaling message exchanged between two peer addresses.
///
/// Wire shape: `{"target": str, "sender": str, "data": str, "type": str}`.
/// `target` and `type` are required; a missing `sender` or `data` decodes as
/// an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical address of the recipient
    pub target: String,

    /// Logical address of the originating peer
    #[serde(default)]
    pub sender: String,

    /// Opaque payload: SDP text or a serialized candidate
    #[serde(rename = "data", default)]
    pub payload: String,

    /// Message kind
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
}

impl Envelope {
    /// Build a validated envelope.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::EmptyTarget` if `target` is empty
    /// - `ProtocolError::SelfAddressed` if `target == sender`
    pub fn new(
        target: impl Into<String>,
        sender: impl Into<String>,
        kind: EnvelopeKind,
        payload: impl Into<String>,
    ) -> Result<Self> {
        let envelope =
            Self { target: target.into(), sender: sender.into(), payload: payload.into(), kind };
        envelope.validate()?;
        Ok(envelope)
    }

    /// `EndCall` envelope carrying a short reason.
    pub fn end_call(
        target: impl Into<String>,
        sender: impl Into<String>,
        reason: &str,
    ) -> Result<Self> {
        Self::new(target, sender, EnvelopeKind::EndCall, reason)
    }

    /// Check the addressing invariants.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::EmptyTarget` if `target` is empty
    /// - `ProtocolError::SelfAddressed` if `target == sender`
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(ProtocolError::EmptyTarget);
        }
        if self.target == self.sender {
            return Err(ProtocolError::SelfAddressed { address: self.target.clone() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_target() {
        let result = Envelope::new("", "alice", EnvelopeKind::Offer, "v=0");
        assert_eq!(result, Err(ProtocolError::EmptyTarget));
    }

    #[test]
    fn new_rejects_self_addressed() {
        let result = Envelope::new("alice", "alice", EnvelopeKind::Answer, "v=0");
        assert!(matches!(result, Err(ProtocolError::SelfAddressed { .. })));
    }

    #[test]
    fn end_call_carries_reason() {
        let envelope = Envelope::end_call("bob", "alice", "busy").unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::EndCall);
        assert_eq!(envelope.payload, "busy");
    }

    #[test]
    fn kind_tags_match_wire() {
        assert_eq!(EnvelopeKind::Offer.as_str(), "OFFER");
        assert_eq!(EnvelopeKind::Answer.as_str(), "ANSWER");
        assert_eq!(EnvelopeKind::IceCandidate.as_str(), "ICE");
        assert_eq!(EnvelopeKind::EndCall.as_str(), "END");
    }
}
