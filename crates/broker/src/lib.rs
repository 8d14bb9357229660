//! Durable task queues with explicit acknowledgment and dead-lettering.

pub mod config;
pub mod health;
pub mod memory;
pub mod message;
pub mod producer;
pub mod queues;
pub mod redis_streams;
pub mod transport;

pub use config::*;
pub use memory::MemoryBroker;
pub use message::*;
pub use producer::*;
pub use queues::*;
pub use redis_streams::RedisStreamBroker;
pub use transport::*;

use enrich_core::Result;
use std::sync::Arc;

/// Opens the configured broker backend.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn MessageBroker>> {
    match config.backend {
        BrokerBackend::Redis => Ok(Arc::new(RedisStreamBroker::connect(config).await?)),
        BrokerBackend::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}
