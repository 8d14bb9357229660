//! Rate gate: daily quota ceilings and sliding-window limits per task kind.
//!
//! Counters live in the shared store and are owned by no single worker. Daily
//! counters are keyed by service id, kind, and local date; they are only ever
//! incremented and disappear at local midnight through the expiry set by the
//! increment that created them.

use enrich_core::{Result, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{local_day, next_local_midnight, Clock};
use crate::store::QuotaStore;

/// Sliding-window ceiling: at most `limit` admissions per trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u64,
    pub window: Duration,
}

/// Quota ceilings for one task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub daily: u64,
    pub window: Option<WindowLimit>,
}

impl QuotaLimits {
    pub fn daily(daily: u64) -> Self {
        Self {
            daily,
            window: None,
        }
    }

    pub fn with_window(mut self, limit: u64, window: Duration) -> Self {
        self.window = Some(WindowLimit { limit, window });
        self
    }
}

/// Usage of one kind's daily quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub kind: TaskKind,
    pub used: u64,
    pub limit: u64,
}

/// Decides whether a task kind may execute now.
pub struct RateGate {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    service_id: String,
    limits: HashMap<TaskKind, QuotaLimits>,
}

impl fmt::Debug for RateGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateGate")
            .field("service_id", &self.service_id)
            .field("limits", &self.limits)
            .finish()
    }
}

impl RateGate {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            service_id: service_id.into(),
            limits: HashMap::new(),
        }
    }

    pub fn with_limits(mut self, kind: TaskKind, limits: QuotaLimits) -> Self {
        self.limits.insert(kind, limits);
        self
    }

    pub fn limits(&self, kind: TaskKind) -> Option<QuotaLimits> {
        self.limits.get(&kind).copied()
    }

    /// Daily counter key for `kind` on the current local date.
    pub fn daily_key(&self, kind: TaskKind) -> String {
        format!(
            "api_usage:{}:{}:{}",
            self.service_id,
            kind,
            local_day(self.clock.now())
        )
    }

    pub fn window_key(&self, kind: TaskKind, key: &str, window: Duration) -> String {
        format!(
            "ratelimit:{}:{}:{}:{}",
            self.service_id,
            kind,
            key,
            window.as_secs()
        )
    }

    /// True iff today's count for `kind` is below its daily ceiling and, when
    /// configured, the kind's sliding window has room.
    ///
    /// Fails closed: a store error or an unconfigured kind denies.
    pub async fn admit(&self, kind: TaskKind) -> bool {
        let Some(limits) = self.limits(kind) else {
            warn!(kind = %kind, "No quota configured, denying");
            return false;
        };

        let used = match self.store.get_count(&self.daily_key(kind)).await {
            Ok(used) => used,
            Err(e) => {
                error!(kind = %kind, error = %e, "Quota store unavailable, denying");
                return false;
            }
        };

        if used >= limits.daily {
            warn!(kind = %kind, used, limit = limits.daily, "Daily quota reached");
            return false;
        }

        match limits.window {
            Some(window) => {
                self.admit_window(kind, kind.as_str(), window.limit, window.window)
                    .await
            }
            None => true,
        }
    }

    /// Sliding-window admission for an arbitrary key under `kind`.
    ///
    /// An admitted call records its own timestamp in the window. Fails closed.
    pub async fn admit_window(
        &self,
        kind: TaskKind,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> bool {
        let now = self.clock.now();
        let member = format!("{}-{}", now.timestamp_millis(), Uuid::new_v4());

        match self
            .store
            .sliding_window_admit(&self.window_key(kind, key, window), now, window, limit, &member)
            .await
        {
            Ok(decision) => {
                if !decision.admitted {
                    debug!(
                        kind = %kind,
                        key,
                        count = decision.count,
                        limit,
                        "Sliding window full"
                    );
                }
                decision.admitted
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "Quota store unavailable, denying");
                false
            }
        }
    }

    /// Atomically counts one use of `kind` today. Returns the new count.
    pub async fn record_usage(&self, kind: TaskKind) -> Result<u64> {
        let now = self.clock.now();
        let count = self
            .store
            .incr_expire_at(&self.daily_key(kind), next_local_midnight(now))
            .await?;

        debug!(
            kind = %kind,
            used = count,
            limit = self.limits(kind).map(|l| l.daily),
            "Recorded quota usage"
        );
        Ok(count)
    }

    pub async fn current_usage(&self, kind: TaskKind) -> Result<u64> {
        self.store.get_count(&self.daily_key(kind)).await
    }

    /// Usage of every configured kind. Kinds whose counter cannot be read are skipped.
    pub async fn all_usage(&self) -> Vec<UsageReport> {
        let mut kinds: Vec<_> = self.limits.iter().collect();
        kinds.sort_by_key(|(kind, _)| **kind);

        let mut reports = Vec::with_capacity(kinds.len());
        for (kind, limits) in kinds {
            match self.current_usage(*kind).await {
                Ok(used) => reports.push(UsageReport {
                    kind: *kind,
                    used,
                    limit: limits.daily,
                }),
                Err(e) => warn!(kind = %kind, error = %e, "Failed to read quota usage"),
            }
        }
        reports
    }
}
