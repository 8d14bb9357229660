//! Provider result cache.
//!
//! Outputs of successful executions are kept in the shared store under
//! `cache:{kind}:{resource_key}` for the kind's `cache_ttl`. A cached output
//! is served to later tasks for the same resource without spending quota or
//! calling the provider. Cache failures are logged and read as misses.

use enrich_core::{Result, TaskKind};
use quota::QuotaStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct ResultCache {
    store: Arc<dyn QuotaStore>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    pub fn key(kind: TaskKind, resource_key: &str) -> String {
        format!("cache:{}:{}", kind, resource_key)
    }

    /// The cached output, if any.
    pub async fn get(&self, kind: TaskKind, resource_key: &str) -> Option<Value> {
        match self.try_get(kind, resource_key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(kind = %kind, resource_key, error = %e, "Result cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, kind: TaskKind, resource_key: &str, output: &Value, ttl: Duration) {
        if let Err(e) = self.try_put(kind, resource_key, output, ttl).await {
            warn!(kind = %kind, resource_key, error = %e, "Result cache write failed");
        }
    }

    async fn try_get(&self, kind: TaskKind, resource_key: &str) -> Result<Option<Value>> {
        match self.store.get(&Self::key(kind, resource_key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn try_put(
        &self,
        kind: TaskKind,
        resource_key: &str,
        output: &Value,
        ttl: Duration,
    ) -> Result<()> {
        let raw = serde_json::to_string(output)?;
        self.store
            .put(&Self::key(kind, resource_key), &raw, Some(ttl))
            .await
    }
}
