//! Callframe call core.
//!
//! Sans-IO call logic for a two-party audio/video call negotiated over an
//! unreliable single-slot relay.
//!
//! # Components
//!
//! - [`CallMachine`]: sequences the offer/answer exchange; events in, actions
//!   out
//! - [`ConnectionController`]: owns local media and the negotiation object,
//!   buffers early remote candidates, tears everything down in order
//! - [`media`]: traits a platform media backend implements
//! - [`Environment`]: time and randomness, swappable for simulation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod controller;
pub mod env;
pub mod error;
pub mod media;
pub mod session;

pub use controller::{ConnectionController, MediaBundle, MediaConfig};
pub use env::Environment;
pub use error::{ErrorKind, MediaError, SessionError};
pub use media::{
    CaptureConstraints, IceServer, MediaEngine, PeerTransport, RemoteStream, TrackKind,
    TransportConfig, TransportEvent, TransportObserver, TransportState,
};
pub use session::{
    CallAction, CallEvent, CallMachine, CallNotification, CallSession, CallState, EndReason, Role,
    SessionId,
};
