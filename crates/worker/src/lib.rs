//! Quota-gated consumer pipelines.
//!
//! Each task kind gets one pipeline: its messages pass the daily and
//! sliding-window quota gate, take a per-resource lock, run against the
//! provider, and are then acked, requeued, or dead-lettered.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod executor;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod sink;

pub use cache::*;
pub use config::*;
pub use consumer::*;
pub use executor::*;
pub use pipeline::*;
pub use policy::*;
pub use registry::*;
pub use scheduler::*;
pub use sink::*;
