//! Core task model, wire format, and error taxonomy for the enrichment worker.

pub mod error;
pub mod limits;
pub mod task;

pub use error::{Error, ExecutorError, Result};
pub use task::*;
