//! In-process store for tests, the CLI's dry-run mode, and single-node use.
//!
//! Atomicity comes from holding the `dashmap` entry lock for the whole
//! read-modify-write.

use async_trait::async_trait;
use dashmap::DashMap;
use errors::StorageError;
use gen_core::traits::{CounterStore, KeyValueStore};
use gen_core::types::SlidingWindowOutcome;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Expired counters are swept once every this many increments.
const SWEEP_EVERY: u64 = 256;

struct ValueEntry {
    value: String,
    expires_at: Instant
}

struct CounterEntry {
    count: u64,
    expires_at: Instant
}

#[derive(Default)]
pub struct InMemoryStore {
    values: DashMap<String, ValueEntry>,
    counters: DashMap<String, CounterEntry>,
    logs: DashMap<String, VecDeque<(i64, String)>>,
    increments: AtomicU64
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values.iter().filter(|e| e.expires_at > now).count()
    }

    /// Drops expired values and counters, and empty window logs.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.values.len() + self.counters.len() + self.logs.len();
        self.values.retain(|_, entry| entry.expires_at > now);
        self.counters.retain(|_, entry| entry.expires_at > now);
        self.logs.retain(|_, log| !log.is_empty());
        before - (self.values.len() + self.counters.len() + self.logs.len())
    }

    fn sweep_counters(&self, now: Instant) {
        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.counters.retain(|_, entry| entry.expires_at > now);
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let value = match self.values.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => None,
            None => return Ok(None)
        };
        self.values.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(value)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration
    ) -> Result<(), StorageError> {
        if ttl.is_zero() {
            return Err(StorageError::InvalidArgument {
                reason: "TTL must be at least one millisecond".to_string()
            });
        }
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl
            }
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        Ok(self
            .values
            .remove(key)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn increment_and_expire_on_first_write(
        &self,
        key: &str,
        window: Duration
    ) -> Result<u64, StorageError> {
        let now = Instant::now();
        self.sweep_counters(now);
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: now + window
            });

        if entry.expires_at <= now {
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count == 1 {
            entry.expires_at = now + window;
        }
        Ok(entry.count)
    }

    async fn sliding_window_acquire(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        now_ms: i64,
        member: &str
    ) -> Result<SlidingWindowOutcome, StorageError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        let mut log = self.logs.entry(key.to_string()).or_default();

        let cutoff = now_ms - window_ms;
        while log.front().is_some_and(|(ts, _)| *ts <= cutoff) {
            log.pop_front();
        }

        let allowed = (log.len() as u64) < limit;
        if allowed {
            log.push_back((now_ms, member.to_string()));
        }

        let outcome = SlidingWindowOutcome {
            count: log.len() as u64,
            allowed,
            oldest_ms: log.front().map(|(ts, _)| *ts)
        };
        drop(log);
        if outcome.count == 0 {
            self.logs.remove_if(key, |_, log| log.is_empty());
        }
        Ok(outcome)
    }
}
