//! Pipeline limits and defaults.
//!
//! Values mirror the deployed worker fleet: three delivery attempts, a 30 second
//! lock lease, and a 60 second wait when a provider throttles us without saying
//! for how long. Configuration may override the defaults; the hard caps are not
//! configurable.

// === Message Limits ===

/// Maximum task message size in bytes (256KB).
///
/// Larger bodies are rejected at decode time and dead-lettered.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Resource key max length.
/// Emails are ~50 chars, IPv6 45, search queries can run longer.
pub const MAX_RESOURCE_KEY_LEN: usize = 512;

// === Retry Defaults ===

/// Delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause after a deferral (quota exhausted, lock contended) before re-polling.
pub const DEFAULT_DEFER_BACKOFF_MS: u64 = 1_000;

/// Wait applied when a provider returns 429 without a usable Retry-After.
pub const DEFAULT_PROVIDER_RETRY_AFTER_SECS: u64 = 60;

/// Upper bound on any provider-requested wait.
pub const MAX_PROVIDER_RETRY_AFTER_SECS: u64 = 300;

// === Lock Defaults ===

/// Resource lock lease. Must cover expected executor latency.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

// === Connection Backoff ===

/// First reconnect delay after a broker/store connectivity failure.
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 500;

/// Reconnect delay ceiling.
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
