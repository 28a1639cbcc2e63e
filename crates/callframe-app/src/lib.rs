//! Callframe application layer.
//!
//! [`CallAgent`] is the runtime for one peer: it registers with the relay,
//! routes inbound envelopes and local intents through the call state machine,
//! executes the resulting actions against the signaling channel and the
//! connection controller, and publishes [`CallNotification`]s to observers.
//!
//! # Components
//!
//! - [`CallAgent`]: the runtime and its public call API
//! - [`AgentConfig`]: address, ICE servers, capture format, ids
//! - [`NotificationHub`]: typed broadcast of call notifications
//! - [`SystemEnv`]: production time and randomness

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod agent;
pub mod config;
pub mod error;
pub mod observer;
pub mod system_env;

pub use agent::CallAgent;
pub use callframe_core::CallNotification;
pub use config::AgentConfig;
pub use error::AgentError;
pub use observer::NotificationHub;
pub use system_env::SystemEnv;
