//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Which broker implementation carries task queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// Redis Streams with one consumer group per queue.
    Redis,
    /// Process-local queues. Messages do not survive a restart.
    Memory,
}

/// Broker connection and consumption settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_backend")]
    pub backend: BrokerBackend,
    /// Redis URL, e.g. `redis://:password@host:6379/1`
    #[serde(default = "default_url")]
    pub url: String,
    /// Consumer group shared by every worker process
    #[serde(default = "default_group")]
    pub group: String,
    /// Consumer name, unique per process
    #[serde(default = "default_consumer")]
    pub consumer: String,
    /// Longest a receive blocks waiting for a message, in milliseconds
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Pending messages idle longer than this are reclaimed from dead consumers
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,
    /// How often each worker sweeps for abandoned messages, in seconds
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
}

fn default_backend() -> BrokerBackend {
    BrokerBackend::Redis
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_group() -> String {
    "enrichment".to_string()
}

fn default_consumer() -> String {
    format!("worker-{}", Uuid::new_v4().simple())
}

fn default_block_ms() -> u64 {
    1000
}

fn default_claim_idle_ms() -> u64 {
    600_000
}

fn default_reclaim_interval_secs() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_url(),
            group: default_group(),
            consumer: default_consumer(),
            block_ms: default_block_ms(),
            claim_idle_ms: default_claim_idle_ms(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}
