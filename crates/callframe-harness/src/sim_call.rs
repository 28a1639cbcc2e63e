//! Two-peer call fixture.
//!
//! Wires a caller and a callee agent over one [`SimRelay`], each with its own
//! [`SimMediaEngine`] and seeded [`SimEnv`].

use std::{sync::Arc, time::Duration};

use callframe_app::{AgentConfig, AgentError, CallAgent};
use callframe_core::{CallNotification, CallState, MediaEngine, SessionId};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::{SimEnv, SimMediaEngine, SimMediaOptions, SimRelay};

/// Agent type used throughout the simulation.
pub type SimAgent = CallAgent<SimEnv, SimRelay>;

/// How long the wait helpers poll before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One simulated peer.
pub struct SimPeer {
    /// The agent under test
    pub agent: SimAgent,
    /// Its media engine, for resource log and transport inspection
    pub engine: Arc<SimMediaEngine>,
    /// Notifications published since the peer connected
    pub notifications: broadcast::Receiver<CallNotification>,
}

impl SimPeer {
    /// Connect `address` to `relay`.
    ///
    /// # Errors
    ///
    /// - whatever [`CallAgent::connect`] reports
    pub async fn connect(
        relay: Arc<SimRelay>,
        address: &str,
        seed: u64,
        options: SimMediaOptions,
    ) -> Result<Self, AgentError> {
        let engine = Arc::new(SimMediaEngine::new(options));
        let media: Arc<dyn MediaEngine> = Arc::clone(&engine) as Arc<dyn MediaEngine>;

        let agent =
            CallAgent::connect(AgentConfig::new(address), relay, media, SimEnv::with_seed(seed))
                .await?;
        let notifications = agent.subscribe();

        Ok(Self { agent, engine, notifications })
    }

    /// Poll until the call state satisfies `predicate`. `false` on timeout.
    pub async fn wait_until(&self, predicate: impl Fn(CallState) -> bool) -> bool {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while !predicate(self.agent.state()) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Poll until the call state equals `expected`. `false` on timeout.
    pub async fn wait_for_state(&self, expected: CallState) -> bool {
        self.wait_until(|state| state == expected).await
    }

    /// Notifications received so far, without waiting.
    pub fn drain_notifications(&mut self) -> Vec<CallNotification> {
        let mut drained = Vec::new();
        loop {
            match self.notifications.try_recv() {
                Ok(notification) => drained.push(notification),
                Err(TryRecvError::Lagged(_)) => {},
                Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
            }
        }
    }
}

/// Caller and callee over one relay.
pub struct SimCall {
    /// Shared relay
    pub relay: Arc<SimRelay>,
    /// Peer that places the call
    pub caller: SimPeer,
    /// Peer that receives the call
    pub callee: SimPeer,
}

impl SimCall {
    /// Caller address.
    pub const CALLER: &'static str = "alice";

    /// Callee address.
    pub const CALLEE: &'static str = "bob";

    /// Both peers with default media.
    ///
    /// # Errors
    ///
    /// - whatever [`CallAgent::connect`] reports
    pub async fn new(seed: u64) -> Result<Self, AgentError> {
        Self::with_options(seed, SimMediaOptions::default(), SimMediaOptions::default()).await
    }

    /// Peers with custom media behavior.
    ///
    /// # Errors
    ///
    /// - whatever [`CallAgent::connect`] reports
    pub async fn with_options(
        seed: u64,
        caller: SimMediaOptions,
        callee: SimMediaOptions,
    ) -> Result<Self, AgentError> {
        let relay = Arc::new(SimRelay::with_seed(seed));
        let caller = SimPeer::connect(Arc::clone(&relay), Self::CALLER, seed, caller).await?;
        let callee =
            SimPeer::connect(Arc::clone(&relay), Self::CALLEE, seed.wrapping_add(1), callee)
                .await?;

        Ok(Self { relay, caller, callee })
    }

    /// Place the call, accept it, and wait for both sides to connect.
    ///
    /// Returns the caller's session id, or `None` if either side did not
    /// reach `Connected` in time.
    ///
    /// # Errors
    ///
    /// - whatever `start_call` or `accept_incoming_call` reports
    pub async fn establish(&self) -> Result<Option<SessionId>, AgentError> {
        let session = self.caller.agent.start_call(Self::CALLEE).await?;

        if !self.callee.wait_for_state(CallState::OfferReceived).await {
            return Ok(None);
        }
        self.callee.agent.accept_incoming_call().await?;

        let connected = self.caller.wait_for_state(CallState::Connected).await
            && self.callee.wait_for_state(CallState::Connected).await;
        Ok(connected.then_some(session))
    }
}
