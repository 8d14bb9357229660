//! Health, metrics, and structured logging for the enrichment worker.
//!
//! Process-wide registries live behind `LazyLock` statics so every worker and
//! the health endpoint see the same state.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
