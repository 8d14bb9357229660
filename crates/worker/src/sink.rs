//! Result sinks.

use async_trait::async_trait;
use enrich_core::{Error, Result, TaskKind, TaskResult};
use quota::QuotaStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Where successful results go. `store` must be an idempotent upsert keyed by
/// task kind and resource key: a message may run more than once.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, result: &TaskResult) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackend {
    /// Upsert into the shared store under `result:{kind}:{resource_key}`.
    #[default]
    Store,
    /// Log only (development).
    Log,
}

/// Upserts results into the shared key-value store.
pub struct StoreSink {
    store: Arc<dyn QuotaStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    pub fn result_key(kind: TaskKind, resource_key: &str) -> String {
        format!("result:{}:{}", kind, resource_key)
    }

    /// Reads a stored result back.
    pub async fn load(&self, kind: TaskKind, resource_key: &str) -> Result<Option<TaskResult>> {
        match self.store.get(&Self::result_key(kind, resource_key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResultSink for StoreSink {
    async fn store(&self, result: &TaskResult) -> Result<()> {
        let value = serde_json::to_string(result)?;
        self.store
            .put(&Self::result_key(result.kind, &result.resource_key), &value, None)
            .await
            .map_err(|e| Error::sink(e.to_string()))
    }
}

/// Logs each result.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn store(&self, result: &TaskResult) -> Result<()> {
        info!(
            task_id = %result.task_id,
            kind = %result.kind,
            resource_key = %result.resource_key,
            attempts = result.attempts,
            output = %result.output,
            "Task result"
        );
        Ok(())
    }
}

pub fn build_sink(backend: SinkBackend, store: Arc<dyn QuotaStore>) -> Arc<dyn ResultSink> {
    match backend {
        SinkBackend::Store => Arc::new(StoreSink::new(store)),
        SinkBackend::Log => Arc::new(LogSink),
    }
}
