//! Process-local record of message ids whose side effect was already applied
//!
//! Entries expire a fixed TTL after they were recorded. Expired entries are
//! evicted lazily on lookup and by a periodic sweep. The store is not shared
//! across processes and does not survive restarts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How long a processed message id suppresses redeliveries (24 hours)
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of trying to take ownership of a message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Caller owns the id until it calls `mark_processed` or `release`
    Claimed,
    /// Already processed within the TTL
    Duplicate,
    /// Another handler is processing the same id right now
    InFlight,
}

#[derive(Default)]
struct Entries {
    processed: HashMap<String, Instant>,
    in_flight: HashSet<String>,
}

impl Entries {
    fn is_fresh(&mut self, message_id: &str, ttl: Duration) -> bool {
        let Some(processed_at) = self.processed.get(message_id) else {
            return false;
        };

        if processed_at.elapsed() > ttl {
            self.processed.remove(message_id);
            return false;
        }

        true
    }
}

pub struct IdempotencyStore {
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(DEFAULT_IDEMPOTENCY_TTL)
    }
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True if `message_id` was processed less than one TTL ago
    pub fn is_processed(&self, message_id: &str) -> bool {
        self.lock().is_fresh(message_id, self.ttl)
    }

    /// Record `message_id` as processed now, overwriting any older record
    pub fn mark_processed(&self, message_id: &str) {
        let mut entries = self.lock();
        entries.in_flight.remove(message_id);
        entries
            .processed
            .insert(message_id.to_string(), Instant::now());
    }

    /// Check-then-claim as one critical section
    ///
    /// Concurrent handlers of the same id cannot both get `Claimed`.
    pub fn try_claim(&self, message_id: &str) -> Claim {
        let mut entries = self.lock();

        if entries.is_fresh(message_id, self.ttl) {
            return Claim::Duplicate;
        }
        if !entries.in_flight.insert(message_id.to_string()) {
            return Claim::InFlight;
        }

        Claim::Claimed
    }

    /// Give up a claim without recording the id (processing failed)
    pub fn release(&self, message_id: &str) {
        self.lock().in_flight.remove(message_id);
    }

    /// Evict every expired record; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.processed.len();
        entries
            .processed
            .retain(|_, processed_at| processed_at.elapsed() <= ttl);
        before - entries.processed.len()
    }

    /// Number of processed records currently held (fresh or not yet evicted)
    pub fn len(&self) -> usize {
        self.lock().processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a background task that sweeps expired records every `interval`
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let evicted = self.sweep_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = self.len(), "Swept expired idempotency records");
                }
            }
        })
    }
}
