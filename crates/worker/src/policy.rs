//! Retry, dead-letter, and reconnect policy.

use enrich_core::limits::{
    DEFAULT_DEFER_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_PROVIDER_RETRY_AFTER_SECS,
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS, MAX_PROVIDER_RETRY_AFTER_SECS,
};
use enrich_core::ExecutorError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a message after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Back on the queue, one attempt consumed. `wait` is how long to hold off
    /// first (a provider-requested delay).
    Retry { wait: Option<Duration> },
    /// Off to the dead-letter queue.
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions a message gets, counting the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after a quota or lock deferral, in milliseconds
    #[serde(default = "default_defer_backoff_ms")]
    pub defer_backoff_ms: u64,
    /// Wait after a provider 429 that carried no Retry-After, in seconds
    #[serde(default = "default_provider_retry_after_secs")]
    pub provider_retry_after_secs: u64,
    /// Ceiling on any provider-requested wait, in seconds
    #[serde(default = "default_max_provider_retry_after_secs")]
    pub max_provider_retry_after_secs: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_defer_backoff_ms() -> u64 {
    DEFAULT_DEFER_BACKOFF_MS
}

fn default_provider_retry_after_secs() -> u64 {
    DEFAULT_PROVIDER_RETRY_AFTER_SECS
}

fn default_max_provider_retry_after_secs() -> u64 {
    MAX_PROVIDER_RETRY_AFTER_SECS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            defer_backoff_ms: default_defer_backoff_ms(),
            provider_retry_after_secs: default_provider_retry_after_secs(),
            max_provider_retry_after_secs: default_max_provider_retry_after_secs(),
        }
    }
}

impl RetryPolicy {
    pub fn defer_backoff(&self) -> Duration {
        Duration::from_millis(self.defer_backoff_ms)
    }

    /// True once `attempt` (0-based) is past the last allowed execution.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Decides the fate of a message whose execution `attempt` (0-based) failed.
    pub fn on_failure(&self, error: &ExecutorError, attempt: u32) -> Disposition {
        if !error.is_retryable() || self.exhausted(attempt + 1) {
            return Disposition::DeadLetter;
        }

        let wait = match error {
            ExecutorError::RateLimited { retry_after } => Some(self.provider_wait(*retry_after)),
            _ => None,
        };
        Disposition::Retry { wait }
    }

    /// The provider's requested delay, defaulted and capped.
    pub fn provider_wait(&self, retry_after: Option<Duration>) -> Duration {
        let requested =
            retry_after.unwrap_or(Duration::from_secs(self.provider_retry_after_secs));
        requested.min(Duration::from_secs(self.max_provider_retry_after_secs))
    }
}

/// Exponential backoff for connection-level failures: `min(base * 2^n, max)`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        )
    }
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
