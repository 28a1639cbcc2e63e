//! Recording relay with fault injection.
//!
//! Delegates to a [`MemoryRelay`] and records every accepted write, so tests
//! can count envelopes even though the mailbox itself only keeps the latest.
//! Writes can be made to fail at a seeded rate to exercise send failures.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use callframe_proto::{Envelope, decode};
use callframe_signaling::{Mailbox, MemoryRelay, Relay, RelayError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory relay that records writes and can drop them.
pub struct SimRelay {
    inner: MemoryRelay,
    published: Mutex<Vec<(String, String)>>,
    failure_rate: Mutex<f64>,
    rng: Mutex<ChaCha8Rng>,
}

impl SimRelay {
    /// Reliable relay.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Relay whose write failures are drawn from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: MemoryRelay::new(),
            published: Mutex::new(Vec::new()),
            failure_rate: Mutex::new(0.0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Fail each write with probability `rate` (clamped to `0.0..=1.0`).
    pub fn set_failure_rate(&self, rate: f64) {
        *lock(&self.failure_rate) = rate.clamp(0.0, 1.0);
    }

    /// Underlying relay.
    pub fn inner(&self) -> &MemoryRelay {
        &self.inner
    }

    /// Every accepted write as `(address, value)`, oldest first.
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }

    /// Decoded envelopes written to `address`, oldest first.
    pub fn envelopes_to(&self, address: &str) -> Vec<Envelope> {
        lock(&self.published)
            .iter()
            .filter(|(to, _)| to == address)
            .filter_map(|(_, value)| decode(Some(value.as_str())).ok().flatten())
            .collect()
    }

    fn should_fail(&self) -> bool {
        let rate = *lock(&self.failure_rate);
        rate > 0.0 && lock(&self.rng).gen_bool(rate)
    }
}

impl Default for SimRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for SimRelay {
    async fn register(&self, address: &str) -> Result<(), RelayError> {
        self.inner.register(address).await
    }

    async fn deregister(&self, address: &str) -> Result<(), RelayError> {
        self.inner.deregister(address).await
    }

    async fn is_registered(&self, address: &str) -> Result<bool, RelayError> {
        self.inner.is_registered(address).await
    }

    async fn publish(&self, address: &str, value: String) -> Result<(), RelayError> {
        if self.should_fail() {
            debug!(%address, "injected relay write failure");
            return Err(RelayError::Unavailable { reason: "injected write failure".to_string() });
        }

        lock(&self.published).push((address.to_string(), value.clone()));
        self.inner.publish(address, value).await
    }

    async fn subscribe(&self, address: &str) -> Result<Mailbox, RelayError> {
        self.inner.subscribe(address).await
    }
}
