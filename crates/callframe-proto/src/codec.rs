//! Envelope wire codec.
//!
//! The relay stores one string per mailbox. [`encode`] turns an [`Envelope`]
//! into that string and [`decode`] turns it back.
//!
//! An empty mailbox is reported by the relay as an absent or empty value (a
//! fresh registration writes `""`). That is "no message", not a decode
//! failure, so [`decode`] returns `Ok(None)` for it.

use crate::{
    envelope::Envelope,
    errors::{ProtocolError, Result},
};

/// Encode an envelope into the relay's wire string.
///
/// # Errors
///
/// - `ProtocolError::EmptyTarget` / `ProtocolError::SelfAddressed` if the
///   envelope violates its addressing invariants. Nothing is produced for an
///   invalid envelope, so it can never reach the relay.
pub fn encode(envelope: &Envelope) -> Result<String> {
    envelope.validate()?;

    serde_json::to_string(envelope)
        .map_err(|e| ProtocolError::MalformedEnvelope { reason: e.to_string() })
}

/// Decode a relay value into an envelope.
///
/// Returns `Ok(None)` when the slot is absent, empty, blank, or holds a JSON
/// `null`.
///
/// # Errors
///
/// - `ProtocolError::MalformedEnvelope` if the value is not a JSON object,
///   misses `target` or `type`, carries an unknown `type`, or has an empty
///   `target`
/// - `ProtocolError::SelfAddressed` if `target == sender`
pub fn decode(wire: Option<&str>) -> Result<Option<Envelope>> {
    let Some(wire) = wire.map(str::trim) else {
        return Ok(None);
    };

    if wire.is_empty() || wire == "null" {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(wire)
        .map_err(|e| ProtocolError::MalformedEnvelope { reason: e.to_string() })?;

    match envelope.validate() {
        Ok(()) => Ok(Some(envelope)),
        Err(ProtocolError::EmptyTarget) => {
            Err(ProtocolError::MalformedEnvelope { reason: "empty target".to_string() })
        },
        Err(e) => Err(e),
    }
}
