//! Signaling channel.
//!
//! One peer's handle on the relay: announce presence, send envelopes to other
//! peers, and receive envelopes written to its own mailbox.

use std::sync::Arc;

use async_trait::async_trait;
use callframe_proto::{Envelope, decode, encode};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{error::SignalingError, relay::Relay};

/// Receiver of inbound envelopes.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Called once per distinct envelope written to the local mailbox.
    async fn on_envelope(&self, envelope: Envelope);
}

struct Subscription {
    task: JoinHandle<()>,
    gate: Arc<Mutex<bool>>,
}

/// Signaling channel bound to one local address.
pub struct SignalingChannel<R: Relay> {
    relay: Arc<R>,
    address: String,
    subscription: Mutex<Option<Subscription>>,
}

impl<R: Relay> SignalingChannel<R> {
    /// Channel for `address` over `relay`.
    pub fn new(relay: Arc<R>, address: impl Into<String>) -> Self {
        Self { relay, address: address.into(), subscription: Mutex::new(None) }
    }

    /// Local address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Underlying relay.
    pub fn relay(&self) -> &Arc<R> {
        &self.relay
    }

    /// Register the local address with the relay.
    ///
    /// Safe to repeat. Each call clears the local mailbox, like a fresh login.
    pub async fn announce_presence(&self) -> Result<(), SignalingError> {
        self.relay.register(&self.address).await?;
        info!(address = %self.address, "presence announced");
        Ok(())
    }

    /// Remove the local address from the relay.
    pub async fn withdraw_presence(&self) -> Result<(), SignalingError> {
        self.relay.deregister(&self.address).await?;
        info!(address = %self.address, "presence withdrawn");
        Ok(())
    }

    /// Whether `address` is registered with the relay.
    pub async fn is_reachable(&self, address: &str) -> Result<bool, SignalingError> {
        Ok(self.relay.is_registered(address).await?)
    }

    /// Write `envelope` to its target's mailbox.
    ///
    /// The presence check and the write are two relay operations. A target
    /// that goes away between them still gets the write.
    ///
    /// # Errors
    ///
    /// - `SignalingError::Protocol` if the envelope is invalid
    /// - `SignalingError::TargetUnreachable` if the target is not registered
    /// - `SignalingError::Relay` if the relay fails
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SignalingError> {
        let wire = encode(envelope)?;

        if !self.relay.is_registered(&envelope.target).await? {
            return Err(SignalingError::TargetUnreachable { target: envelope.target.clone() });
        }

        self.relay.publish(&envelope.target, wire).await?;
        debug!(to = %envelope.target, kind = envelope.kind.as_str(), "envelope sent");
        Ok(())
    }

    /// Start delivering inbound envelopes to `handler`.
    ///
    /// The value already in the mailbox is delivered first. Values that fail
    /// to decode, and envelopes addressed to someone else, are dropped.
    ///
    /// # Errors
    ///
    /// - `SignalingError::AlreadySubscribed` if a subscription is live
    /// - `SignalingError::Relay` if the relay fails
    pub async fn subscribe(&self, handler: Arc<dyn EnvelopeHandler>) -> Result<(), SignalingError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(SignalingError::AlreadySubscribed { address: self.address.clone() });
        }

        let mut mailbox = self.relay.subscribe(&self.address).await?;
        mailbox.mark_changed();

        let gate = Arc::new(Mutex::new(true));
        let task_gate = Arc::clone(&gate);
        let address = self.address.clone();

        let task = tokio::spawn(async move {
            while mailbox.changed().await.is_ok() {
                let value = mailbox.borrow_and_update().clone();

                let envelope = match decode(value.as_deref()) {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%address, error = %e, "dropping undecodable mailbox value");
                        continue;
                    },
                };

                if envelope.target != address {
                    debug!(%address, to = %envelope.target, "dropping envelope for another address");
                    continue;
                }

                let active = task_gate.lock().await;
                if !*active {
                    break;
                }
                debug!(%address, from = %envelope.sender, kind = envelope.kind.as_str(), "envelope received");
                handler.on_envelope(envelope).await;
            }
        });

        *subscription = Some(Subscription { task, gate });
        info!(address = %self.address, "subscribed to mailbox");
        Ok(())
    }

    /// Stop deliveries.
    ///
    /// Waits for an in-flight delivery to finish; nothing is delivered after
    /// this returns. Must not be called from inside the handler.
    pub async fn unsubscribe(&self) {
        let Some(subscription) = self.subscription.lock().await.take() else {
            return;
        };

        *subscription.gate.lock().await = false;
        subscription.task.abort();
        info!(address = %self.address, "unsubscribed from mailbox");
    }
}

impl<R: Relay> Drop for SignalingChannel<R> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.task.abort();
        }
    }
}
