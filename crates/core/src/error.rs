//! Unified error types for the enrichment worker.
//!
//! Error codes:
//! - DECODE_001: malformed task message (never retried)
//! - CONFIG_001: invalid startup configuration (fatal)
//! - STORE_001: quota/lock store unreachable or rejected a command
//! - BROKER_001: broker unreachable or rejected a command
//! - SINK_001: result sink rejected a write

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the enrichment worker.
#[derive(Debug, Error)]
pub enum Error {
    #[error("[DECODE_001] {0}")]
    Decode(String),

    #[error("[CONFIG_001] {0}")]
    Config(String),

    #[error("[STORE_001] {0}")]
    Store(String),

    #[error("[BROKER_001] {0}")]
    Broker(String),

    #[error("[SINK_001] {0}")]
    Sink(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Decode(_) => Some("DECODE_001"),
            Self::Config(_) => Some("CONFIG_001"),
            Self::Store(_) => Some("STORE_001"),
            Self::Broker(_) => Some("BROKER_001"),
            Self::Sink(_) => Some("SINK_001"),
            _ => None,
        }
    }

    /// Connectivity failures are retried at the connection level with backoff,
    /// never counted against a message's attempts.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Broker(_))
    }
}

/// Failure reported by a task executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Network errors, downstream 5xx, timeouts. Retried up to the attempt ceiling.
    #[error("transient executor failure: {0}")]
    Transient(String),

    /// The task can never succeed (downstream 4xx, rejected input).
    #[error("permanent executor failure: {0}")]
    Permanent(String),

    /// Third-party provider asked us to slow down (HTTP 429).
    #[error("provider rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl ExecutorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}
