//! Relay boundary.
//!
//! A relay stores one string per address and notifies watchers when it
//! changes. Presence is a separate registered/unregistered flag per address.

use std::{
    collections::HashMap,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::RelayError;

/// Watch handle on one address's mailbox slot. `None` means empty.
pub type Mailbox = watch::Receiver<Option<String>>;

/// Key-value relay with one single-value mailbox per address.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Mark `address` present and clear its mailbox.
    async fn register(&self, address: &str) -> Result<(), RelayError>;

    /// Mark `address` absent. The mailbox keeps its last value.
    async fn deregister(&self, address: &str) -> Result<(), RelayError>;

    /// Whether `address` is present.
    async fn is_registered(&self, address: &str) -> Result<bool, RelayError>;

    /// Overwrite the mailbox of `address`.
    async fn publish(&self, address: &str, value: String) -> Result<(), RelayError>;

    /// Watch the mailbox of `address`.
    async fn subscribe(&self, address: &str) -> Result<Mailbox, RelayError>;
}

struct Slot {
    registered: bool,
    value: watch::Sender<Option<String>>,
}

impl Slot {
    fn empty() -> Self {
        let (value, _) = watch::channel(None);
        Self { registered: false, value }
    }
}

/// In-process relay.
///
/// Each address owns a `watch` slot. Writing the value already in the slot is
/// coalesced, so watchers are not woken for duplicates.
pub struct MemoryRelay {
    slots: RwLock<HashMap<String, Slot>>,
    offline: AtomicBool,
}

impl MemoryRelay {
    /// Empty relay.
    pub fn new() -> Self {
        Self { slots: RwLock::new(HashMap::new()), offline: AtomicBool::new(false) }
    }

    /// Make every operation fail with `RelayError::Unavailable` until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Current mailbox content of `address`.
    pub fn peek(&self, address: &str) -> Option<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(address).and_then(|slot| slot.value.borrow().clone())
    }

    fn check_online(&self) -> Result<(), RelayError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RelayError::Unavailable { reason: "relay is offline".to_string() })
        } else {
            Ok(())
        }
    }

    fn with_slot<T>(&self, address: &str, f: impl FnOnce(&mut Slot) -> T) -> T {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        f(slots.entry(address.to_string()).or_insert_with(Slot::empty))
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn register(&self, address: &str) -> Result<(), RelayError> {
        self.check_online()?;
        self.with_slot(address, |slot| {
            slot.registered = true;
            slot.value.send_if_modified(|value| value.take().is_some());
        });
        debug!(%address, "address registered");
        Ok(())
    }

    async fn deregister(&self, address: &str) -> Result<(), RelayError> {
        self.check_online()?;
        self.with_slot(address, |slot| slot.registered = false);
        debug!(%address, "address deregistered");
        Ok(())
    }

    async fn is_registered(&self, address: &str) -> Result<bool, RelayError> {
        self.check_online()?;
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(address).is_some_and(|slot| slot.registered))
    }

    async fn publish(&self, address: &str, value: String) -> Result<(), RelayError> {
        self.check_online()?;
        let changed = self.with_slot(address, |slot| {
            slot.value.send_if_modified(|current| {
                if current.as_deref() == Some(value.as_str()) {
                    false
                } else {
                    *current = Some(value);
                    true
                }
            })
        });
        trace!(%address, changed, "mailbox written");
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> Result<Mailbox, RelayError> {
        self.check_online()?;
        Ok(self.with_slot(address, |slot| slot.value.subscribe()))
    }
}
