// src/lock.rs
// TTL-bounded mutual-exclusion leases over the shared store. Multiple workers
// may pull the same conceptually-singleton job; only the one that wins the
// set-if-absent proceeds. The TTL bounds the blast radius of a crashed holder
// — the lease self-expires instead of requiring a heartbeat protocol.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::store::KvStore;

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Try to take the lease for `resource`. Non-blocking: a failed
    /// acquisition is an immediate rejection, never a spin-wait.
    pub async fn acquire(&self, resource: &str, ttl: Duration, owner: &str) -> Result<bool> {
        let acquired = self
            .store
            .set_if_absent(&lock_key(resource), owner, ttl)
            .await?;
        if acquired {
            tracing::debug!(resource, owner, ttl_secs = ttl.as_secs(), "lock acquired");
        }
        Ok(acquired)
    }

    /// Release the lease, but only if `owner` still holds it. A no-op when the
    /// key is absent or held by someone else — a slow holder whose lease
    /// expired must not release a later run's lease that reused the key.
    pub async fn release(&self, resource: &str, owner: &str) -> Result<()> {
        let released = self
            .store
            .delete_if_equals(&lock_key(resource), owner)
            .await?;
        if !released {
            tracing::debug!(resource, owner, "lock already gone or re-owned; release skipped");
        }
        Ok(())
    }

    /// Owner-checked lease renewal. Returns false if the lease was lost
    /// (expired and possibly re-acquired), in which case the caller must stop
    /// assuming exclusivity.
    pub async fn extend(&self, resource: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.store
            .expire_if_equals(&lock_key(resource), owner, ttl)
            .await
    }

    /// Remaining lease time, for diagnostics and backoff hints.
    pub async fn remaining_ttl(&self, resource: &str) -> Result<Option<Duration>> {
        self.store.remaining_ttl(&lock_key(resource)).await
    }

    /// Unconditional removal, used by cleanup when the resource itself is
    /// being deleted and any in-flight holder will self-terminate anyway.
    pub async fn force_clear(&self, resource: &str) -> Result<()> {
        self.store.delete(&lock_key(resource)).await
    }
}
