//! Counter store abstraction for shared rate limiting
//!
//! A [`CounterStore`] holds integer counters with optional expiry, the way a
//! key/value server such as Redis does. [`SharedRateLimiter`](crate::shared_rate_limiter::SharedRateLimiter)
//! keeps one counter per resource in it so that several processes share a
//! quota.
//!
//! [`InMemoryCounterStore`] is a process-local implementation used in tests
//! and single-node deployments.

use crate::error::ResilienceError;
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Integer counters with expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to `key`, creating it at zero; returns the new value
    async fn increment(&self, key: &str, by: u64) -> Result<u64, ResilienceError>;

    /// Set `key` to expire after `ttl`; false if the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ResilienceError>;

    /// Remaining lifetime of `key`, `None` if missing or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, ResilienceError>;

    /// Current value of `key`
    async fn get(&self, key: &str) -> Result<Option<u64>, ResilienceError>;

    async fn delete(&self, key: &str) -> Result<(), ResilienceError>;

    /// Increment `key` and start its expiry on the first increment
    ///
    /// The default runs [`increment`](Self::increment) then
    /// [`expire`](Self::expire) as two separate calls. This is not atomic:
    /// if the process dies, or `expire` fails, between the two, the counter
    /// is left without an expiry and the resource stays rejected until the
    /// key is deleted. Stores that can do both in one step should override
    /// this.
    async fn increment_with_ttl(
        &self,
        key: &str,
        by: u64,
        ttl: Duration,
    ) -> Result<u64, ResilienceError> {
        let count = self.increment(key, by).await?;
        if count == by {
            self.expire(key, ttl).await?;
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local [`CounterStore`]
///
/// `increment_with_ttl` is atomic here unless the store is built with
/// [`with_split_ttl`](Self::with_split_ttl), which replays the two-call
/// sequence of a plain key/value server.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    fail_expire: AtomicBool,
    split_ttl: bool,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use separate increment and expire steps
    pub fn with_split_ttl(mut self) -> Self {
        self.split_ttl = true;
        self
    }

    /// Make every operation fail with [`ResilienceError::Store`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `expire` fail while leaving `increment` working
    pub fn set_fail_expire(&self, fail: bool) {
        self.fail_expire.store(fail, Ordering::SeqCst);
    }

    /// Number of live keys; expired keys are dropped on the way
    pub fn len(&self) -> usize {
        let mut entries = lock(&self.entries);
        Self::purge_expired(&mut entries, Instant::now());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), ResilienceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ResilienceError::Store("counter store unavailable".to_string()));
        }
        Ok(())
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, entry| entry.is_live(now));
    }

    /// Writes purge every expired key, so dead windows never accumulate
    fn bump(entries: &mut HashMap<String, Entry>, key: &str, by: u64, now: Instant) -> u64 {
        Self::purge_expired(entries, now);
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }
        entry.value = entry.value.saturating_add(by);
        entry.value
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, by: u64) -> Result<u64, ResilienceError> {
        self.ensure_available()?;
        let mut entries = lock(&self.entries);
        Ok(Self::bump(&mut entries, key, by, Instant::now()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ResilienceError> {
        self.ensure_available()?;
        if self.fail_expire.load(Ordering::SeqCst) {
            return Err(ResilienceError::Store("expire failed".to_string()));
        }
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, ResilienceError> {
        self.ensure_available()?;
        let now = Instant::now();
        let entries = lock(&self.entries);
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, ResilienceError> {
        self.ensure_available()?;
        let now = Instant::now();
        let entries = lock(&self.entries);
        Ok(entries.get(key).filter(|e| e.is_live(now)).map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> Result<(), ResilienceError> {
        self.ensure_available()?;
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        by: u64,
        ttl: Duration,
    ) -> Result<u64, ResilienceError> {
        if self.split_ttl {
            let count = self.increment(key, by).await?;
            if count == by {
                self.expire(key, ttl).await?;
            }
            return Ok(count);
        }

        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let count = Self::bump(&mut entries, key, by, now);
        if count == by {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(count)
    }
}
