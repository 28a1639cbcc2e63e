//! Upward notification fan-out.
//!
//! Observers subscribe to a typed broadcast channel instead of registering a
//! callback. A slow observer lags and skips notifications; it never blocks the
//! call flow.

use callframe_core::CallNotification;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast hub for [`CallNotification`]s.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<CallNotification>,
}

impl NotificationHub {
    /// Hub buffering `capacity` notifications per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// New subscriber. Sees notifications published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to every subscriber. Dropped when nobody listens.
    pub fn publish(&self, notification: CallNotification) {
        trace!(?notification, "notify");
        let _ = self.sender.send(notification);
    }
}
