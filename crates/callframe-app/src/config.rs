//! Agent configuration.

use callframe_core::{
    CaptureConstraints, MediaConfig, TransportConfig,
    controller::{DEFAULT_STREAM_ID, DEFAULT_TRACK_ID},
};

use crate::error::AgentError;

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// Configuration for a [`CallAgent`](crate::CallAgent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Address this agent registers with the relay
    pub local_address: String,
    /// ICE servers and gathering policy
    pub transport: TransportConfig,
    /// Camera format
    pub capture: CaptureConstraints,
    /// Outbound stream id
    pub local_stream_id: String,
    /// Outbound track id prefix
    pub local_track_id: String,
    /// Notifications buffered per subscriber before it lags
    pub notification_capacity: usize,
}

impl AgentConfig {
    /// Default configuration for `local_address`.
    pub fn new(local_address: impl Into<String>) -> Self {
        Self { local_address: local_address.into(), ..Self::default() }
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// - `AgentError::InvalidConfig` for an empty address, empty ids, or a
    ///   zero notification capacity
    pub fn validate(&self) -> Result<(), AgentError> {
        let problem = if self.local_address.is_empty() {
            "local address is empty"
        } else if self.local_stream_id.is_empty() || self.local_track_id.is_empty() {
            "stream and track ids must be set"
        } else if self.notification_capacity == 0 {
            "notification capacity must be positive"
        } else {
            return Ok(());
        };

        Err(AgentError::InvalidConfig { reason: problem.to_string() })
    }

    /// Media settings handed to each connection controller.
    pub fn media_config(&self) -> MediaConfig {
        MediaConfig {
            transport: self.transport.clone(),
            capture: self.capture,
            stream_id: self.local_stream_id.clone(),
            track_id: self.local_track_id.clone(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_address: String::new(),
            transport: TransportConfig::default(),
            capture: CaptureConstraints::default(),
            local_stream_id: DEFAULT_STREAM_ID.to_string(),
            local_track_id: DEFAULT_TRACK_ID.to_string(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}
