// src/store/mod.rs
// Shared key-value store abstraction. Everything the orchestration core
// shares across workers (locks, job handles, rate-limit counters) lives here,
// and every mutation is a single-key atomic operation — no multi-key
// transactions required of any backend.

#[cfg(feature = "redis-store")]
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Unconditional write, with optional expiry.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomic set-if-absent with expiry. Returns whether the write happened.
    /// This is the primitive both locking and rate limiting are built on, so
    /// it must never be implemented as a separate check-then-set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete only if the current value equals `value` (owner-checked
    /// release). Returns whether a deletion happened.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// Reset the expiry only if the current value equals `value` (owner-checked
    /// lease renewal). Returns whether the expiry was reset.
    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time-to-live, if the key exists and has an expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory store for tests and single-process deployments. Expired entries
/// are dropped lazily on access, so the map never needs a reaper task.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(value: &str, ttl: Option<Duration>) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut map = self.inner.write().await;
        map.insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        match map.get(key) {
            Some(existing) if !existing.is_expired(now) => Ok(false),
            _ => {
                map.insert(key.to_string(), Self::entry(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let map = self.inner.read().await;
            match map.get(key) {
                Some(e) if !e.is_expired(now) => return Ok(Some(e.value.clone())),
                None => return Ok(None),
                Some(_) => {} // expired, fall through to purge
            }
        }
        let mut map = self.inner.write().await;
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.inner.write().await;
        map.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        match map.get(key) {
            Some(e) if !e.is_expired(now) && e.value == value => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut map = self.inner.write().await;
        match map.get_mut(key) {
            Some(e) if !e.is_expired(now) && e.value == value => {
                e.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let map = self.inner.read().await;
        Ok(map.get(key).and_then(|e| {
            e.expires_at
                .map(|at| at.saturating_duration_since(now))
                .filter(|d| !d.is_zero())
        }))
    }
}
