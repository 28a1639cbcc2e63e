//! Typed envelope payloads.
//!
//! The envelope payload is an opaque string. For `Offer`/`Answer` it is the
//! raw SDP text; for `IceCandidate` it is a JSON object describing one
//! network path candidate.

use serde::{Deserialize, Serialize};

use crate::{
    envelope::EnvelopeKind,
    errors::{ProtocolError, Result},
};

/// Which half of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    /// Produced by the caller
    Offer,
    /// Produced by the callee in response to an offer
    Answer,
}

impl SdpKind {
    /// Envelope kind that carries this description.
    pub fn envelope_kind(self) -> EnvelopeKind {
        match self {
            Self::Offer => EnvelopeKind::Offer,
            Self::Answer => EnvelopeKind::Answer,
        }
    }
}

/// Media and network parameters proposed (offer) or accepted (answer) by a
/// peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    /// Answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// A network path candidate.
///
/// Serialized field names follow the shape peers already exchange:
/// `{"sdpMid": .., "sdpMLineIndex": .., "sdp": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    /// Index of the media description this candidate belongs to
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,

    /// Candidate attribute line
    #[serde(rename = "sdp")]
    pub sdp: String,
}

impl IceCandidate {
    /// Serialize into an envelope payload.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ProtocolError::MalformedCandidate { reason: e.to_string() })
    }

    /// Parse an envelope payload.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedCandidate` if the payload is not a candidate
    ///   object or the candidate line is empty
    pub fn from_payload(payload: &str) -> Result<Self> {
        let candidate: Self = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::MalformedCandidate { reason: e.to_string() })?;

        if candidate.sdp.is_empty() {
            return Err(ProtocolError::MalformedCandidate {
                reason: "empty candidate line".to_string(),
            });
        }

        Ok(candidate)
    }
}
