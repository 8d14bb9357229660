//! Worker and per-kind pipeline configuration.

use enrich_core::limits::{DEFAULT_LOCK_TTL_SECS, DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS};
use enrich_core::{Error, Result, TaskKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use validator::Validate;

use crate::executor::HttpExecutor;
use crate::policy::RetryPolicy;
use crate::registry::{PipelineRegistry, PipelineSpec};
use crate::sink::SinkBackend;

/// Process-wide worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Period of the metrics log line
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// Period of the broker and store health checks
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default)]
    pub sink: SinkBackend,
}

fn default_reconnect_base_ms() -> u64 {
    DEFAULT_RECONNECT_BASE_MS
}

fn default_reconnect_max_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_MS
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_health_interval_secs() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            sink: SinkBackend::default(),
        }
    }
}

impl WorkerConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

/// One task kind's pipeline as configured.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KindConfig {
    pub kind: TaskKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Queue name; `<kind>_queue` when unset
    #[serde(default)]
    pub queue: Option<String>,
    #[validate(range(min = 1))]
    pub daily_limit: u64,
    /// Optional sliding-window ceiling, `window_limit` per `window_secs`
    #[serde(default)]
    pub window_limit: Option<u64>,
    #[serde(default = "default_window_secs")]
    #[validate(range(min = 1))]
    pub window_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    #[validate(range(min = 1))]
    pub lock_ttl_secs: u64,
    #[serde(default)]
    pub execute_timeout_secs: Option<u64>,
    /// Serve a resource's last result for this long instead of calling the
    /// provider again
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Provider endpoint the task payload is POSTed to
    #[validate(url)]
    pub endpoint: String,
    /// Name of the environment variable holding the provider API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_window_secs() -> u64 {
    1
}

fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl KindConfig {
    /// Builds the pipeline spec, wiring an HTTP executor for the endpoint.
    pub fn to_spec(&self) -> Result<PipelineSpec> {
        self.validate()
            .map_err(|e| Error::config(format!("{} pipeline: {}", self.kind, e)))?;

        let api_key = match &self.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::config(format!("{} pipeline: {} is not set", self.kind, var))
            })?),
            None => None,
        };
        let executor = HttpExecutor::new(
            self.endpoint.clone(),
            api_key,
            Duration::from_secs(self.request_timeout_secs),
        )?;

        let mut builder = PipelineSpec::builder(self.kind)
            .daily_limit(self.daily_limit)
            .lock_ttl(Duration::from_secs(self.lock_ttl_secs))
            .executor(Arc::new(executor));
        if let Some(queue) = &self.queue {
            builder = builder.queue(queue.clone());
        }
        if let Some(limit) = self.window_limit {
            builder = builder.window_limit(limit, Duration::from_secs(self.window_secs));
        }
        if let Some(secs) = self.execute_timeout_secs {
            builder = builder.execute_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.cache_ttl_secs {
            builder = builder.cache_ttl(Duration::from_secs(secs));
        }
        builder.build()
    }
}

/// Builds and validates the registry from the enabled kinds.
pub fn build_registry(kinds: &[KindConfig]) -> Result<PipelineRegistry> {
    let specs = kinds
        .iter()
        .filter(|kind| kind.enabled)
        .map(KindConfig::to_spec)
        .collect::<Result<Vec<_>>>()?;

    for spec in &specs {
        info!(
            kind = %spec.kind,
            queue = %spec.topology.queue,
            daily_limit = spec.limits.daily,
            lock_ttl_secs = spec.lock_ttl.as_secs(),
            cache_ttl_secs = spec.cache_ttl.map(|ttl| ttl.as_secs()),
            "Pipeline configured"
        );
    }
    PipelineRegistry::new(specs)
}
