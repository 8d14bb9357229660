//! Shared quota counters, sliding windows, and resource locks.

pub mod clock;
pub mod config;
pub mod gate;
pub mod health;
pub mod lock;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use gate::*;
pub use lock::*;
pub use memory::MemoryQuotaStore;
pub use redis_store::RedisQuotaStore;
pub use store::*;

use enrich_core::Result;
use std::sync::Arc;

/// Opens the configured store backend.
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn QuotaStore>> {
    match config.backend {
        StoreBackend::Redis => Ok(Arc::new(RedisQuotaStore::connect(config).await?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryQuotaStore::new(clock))),
    }
}
