//! Callframe signaling protocol.
//!
//! The unit of signaling is the [`Envelope`]: a small JSON object addressed
//! from one peer to another and carried by a key-value relay. Its payload is
//! either a session description ([`SessionDescription`]) or a serialized
//! network path candidate ([`IceCandidate`]).
//!
//! # Components
//!
//! - [`Envelope`] / [`EnvelopeKind`]: the signaling message and its type tag
//! - [`codec`]: envelope to/from the relay's wire string
//! - [`SessionDescription`] / [`IceCandidate`]: typed views over the payload

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod payloads;

pub use codec::{decode, encode};
pub use envelope::{Envelope, EnvelopeKind};
pub use errors::{ProtocolError, Result};
pub use payloads::{IceCandidate, SdpKind, SessionDescription};
