//! Distributed per-resource lock.
//!
//! A lock is a store key set only-if-absent with a TTL. The stored value is a
//! token unique to one acquisition, and release deletes the key only while it
//! still holds that token, so a holder whose lock expired cannot remove a lock
//! taken since by another worker.

use chrono::Utc;
use enrich_core::{Result, TaskKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::QuotaStore;

/// Proof of a held lock. Pass it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct DistributedLock {
    store: Arc<dyn QuotaStore>,
    service_id: String,
    holder: String,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("service_id", &self.service_id)
            .field("holder", &self.holder)
            .finish()
    }
}

impl DistributedLock {
    /// `holder` names the worker in lock tokens, for operators reading the store.
    pub fn new(
        store: Arc<dyn QuotaStore>,
        service_id: impl Into<String>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            service_id: service_id.into(),
            holder: holder.into(),
        }
    }

    pub fn lock_key(&self, kind: TaskKind, resource: &str) -> String {
        format!("lock:{}:{}:{}", self.service_id, kind, resource)
    }

    /// Takes the lock for `(kind, resource)` if nobody holds it.
    ///
    /// `Ok(None)` means another holder has it. The lock lapses after `ttl`
    /// whether or not it is released.
    pub async fn acquire(
        &self,
        kind: TaskKind,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>> {
        let key = self.lock_key(kind, resource);
        let token = format!("{}|{}|{}", self.holder, Uuid::new_v4(), Utc::now().to_rfc3339());

        if self.store.set_nx_px(&key, &token, ttl).await? {
            debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lock acquired");
            Ok(Some(LockGuard { key, token }))
        } else {
            debug!(key = %key, "Lock held elsewhere");
            Ok(None)
        }
    }

    /// Releases a lock this worker acquired. Returns false when the lock had
    /// already expired (and may now belong to someone else).
    pub async fn release(&self, guard: LockGuard) -> Result<bool> {
        let released = self.store.delete_if_eq(&guard.key, &guard.token).await?;
        if !released {
            warn!(key = %guard.key, "Lock expired before release");
        }
        Ok(released)
    }

    /// Deletes the lock regardless of holder. Operator use only.
    pub async fn force_release(&self, kind: TaskKind, resource: &str) -> Result<bool> {
        let key = self.lock_key(kind, resource);
        let removed = self.store.delete(&key).await?;
        warn!(key = %key, removed, "Lock force-released");
        Ok(removed)
    }
}
