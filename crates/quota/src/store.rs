//! Quota store interface.
//!
//! Every operation is a single atomic round trip against the shared store.
//! Callers never get a read-then-write pair: conditional logic (expire only on
//! the creating increment, delete only if we still own the lock, prune then
//! count then insert) runs store-side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrich_core::Result;
use std::time::Duration;

/// Outcome of a sliding-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub admitted: bool,
    /// Entries in the window before this call.
    pub count: u64,
}

/// Shared low-latency key-value store backing quotas, locks, and results.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Current counter value, 0 when absent.
    async fn get_count(&self, key: &str) -> Result<u64>;

    /// Increments the counter and, when this increment created the key, sets it
    /// to expire at `expire_at`. Returns the new count.
    async fn incr_expire_at(&self, key: &str, expire_at: DateTime<Utc>) -> Result<u64>;

    /// Sets `key` to `value` with a TTL only if it does not exist.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Deletes unconditionally. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes only if the stored value equals `value`.
    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    /// Prunes entries at or before `now - window`, counts the rest, and when the
    /// count is below `limit` inserts `member` at `now` and refreshes the
    /// window's TTL to twice its length.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> Result<WindowDecision>;

    /// Idempotent upsert. With a `ttl` the key expires after it; without one
    /// any previous expiry is cleared.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Window scores are fractional epoch seconds.
pub(crate) fn epoch_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}
