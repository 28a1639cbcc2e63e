//! Callframe signaling.
//!
//! Moves [`Envelope`](callframe_proto::Envelope)s between two named peers
//! through a key-value relay with one "latest value" mailbox per address.
//!
//! # Delivery model
//!
//! The mailbox is a single slot: last write wins. If two envelopes are written
//! to the same address before the first is read, the first is lost. Both peers
//! rely on this model, so it is kept as is rather than upgraded to a queue.
//!
//! # Components
//!
//! - [`Relay`]: the relay boundary
//! - [`MemoryRelay`]: in-process relay over `tokio::sync::watch`
//! - [`SignalingChannel`]: one peer's view: presence, send, subscribe

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel;
pub mod error;
pub mod relay;

pub use channel::{EnvelopeHandler, SignalingChannel};
pub use error::{RelayError, SignalingError};
pub use relay::{Mailbox, MemoryRelay, Relay};
