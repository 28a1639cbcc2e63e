//! Deterministic simulation harness for Callframe call flows.
//!
//! Fake implementations of the Environment, media and relay boundaries so
//! complete two-peer calls run in-process and replay identically for a seed.
//!
//! # Components
//!
//! - [`SimEnv`]: tokio clock and a seeded `ChaCha8Rng`
//! - [`SimMediaEngine`]: fake capture devices and negotiation objects that
//!   record every resource release in a [`ResourceLog`]
//! - [`SimRelay`]: in-memory relay that records writes and can inject
//!   failures
//! - [`SimCall`]: two agents (caller and callee) wired over one relay

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_call;
pub mod sim_env;
pub mod sim_media;
pub mod sim_relay;

pub use sim_call::{SimCall, SimPeer};
pub use sim_env::SimEnv;
pub use sim_media::{
    ResourceEvent, ResourceLog, SimMediaEngine, SimMediaOptions, SimTransportHandle,
};
pub use sim_relay::SimRelay;
