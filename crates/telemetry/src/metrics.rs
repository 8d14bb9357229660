//! Pipeline metrics.
//!
//! In-process atomics, read as a snapshot by the periodic metrics log line
//! and the health endpoint. Process totals sit next to per-kind counters
//! labelled by task kind.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value that goes up and down.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }
}

const BUCKETS: usize = 10;

/// Latency histogram with fixed millisecond buckets sized for provider calls.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; BUCKETS] =
        [10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds. Values past the last bound land in it.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let bucket = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            count => self.sum.load(Ordering::Relaxed) as f64 / count as f64,
        }
    }

    /// `(upper bound ms, count)` per bucket.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Counters of one task kind's pipeline.
#[derive(Debug, Default)]
pub struct KindMetrics {
    pub received: Counter,
    pub succeeded: Counter,
    pub cache_hits: Counter,
    pub retried: Counter,
    pub dead_lettered: Counter,
    pub deferred: Counter,
    /// Unsettled messages on the kind's queue, sampled by the metrics loop.
    pub queue_depth: Gauge,
}

impl KindMetrics {
    pub fn snapshot(&self) -> KindSnapshot {
        KindSnapshot {
            received: self.received.get(),
            succeeded: self.succeeded.get(),
            cache_hits: self.cache_hits.get(),
            retried: self.retried.get(),
            dead_lettered: self.dead_lettered.get(),
            deferred: self.deferred.get(),
            queue_depth: self.queue_depth.get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub cache_hits: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub deferred: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Default)]
pub struct Metrics {
    // Message outcomes
    pub tasks_received: Counter,
    pub tasks_succeeded: Counter,
    pub cache_hits: Counter,
    pub tasks_retried: Counter,
    pub tasks_dead_lettered: Counter,
    pub decode_failures: Counter,

    // Deferrals
    pub deferred_quota: Counter,
    pub deferred_lock: Counter,
    pub provider_rate_limited: Counter,

    // Bookkeeping failures that do not change a message's outcome
    pub usage_record_failures: Counter,
    pub lock_release_failures: Counter,

    // Broker
    pub broker_errors: Counter,
    pub reconnects: Counter,
    pub reclaimed: Counter,

    pub execute_latency_ms: Histogram,

    pub in_flight: Gauge,
    pub active_workers: Gauge,

    kinds: RwLock<HashMap<String, Arc<KindMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `kind`, created on first use.
    pub fn kind(&self, kind: &str) -> Arc<KindMetrics> {
        if let Some(existing) = self.kinds.read().get(kind) {
            return existing.clone();
        }
        self.kinds
            .write()
            .entry(kind.to_string())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            tasks_received: self.tasks_received.get(),
            tasks_succeeded: self.tasks_succeeded.get(),
            cache_hits: self.cache_hits.get(),
            tasks_retried: self.tasks_retried.get(),
            tasks_dead_lettered: self.tasks_dead_lettered.get(),
            decode_failures: self.decode_failures.get(),
            deferred_quota: self.deferred_quota.get(),
            deferred_lock: self.deferred_lock.get(),
            provider_rate_limited: self.provider_rate_limited.get(),
            usage_record_failures: self.usage_record_failures.get(),
            lock_release_failures: self.lock_release_failures.get(),
            broker_errors: self.broker_errors.get(),
            reconnects: self.reconnects.get(),
            reclaimed: self.reclaimed.get(),
            execute_latency_mean_ms: self.execute_latency_ms.mean(),
            in_flight: self.in_flight.get(),
            active_workers: self.active_workers.get(),
            by_kind: self
                .kinds
                .read()
                .iter()
                .map(|(kind, counters)| (kind.clone(), counters.snapshot()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tasks_received: u64,
    pub tasks_succeeded: u64,
    pub cache_hits: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub decode_failures: u64,
    pub deferred_quota: u64,
    pub deferred_lock: u64,
    pub provider_rate_limited: u64,
    pub usage_record_failures: u64,
    pub lock_release_failures: u64,
    pub broker_errors: u64,
    pub reconnects: u64,
    pub reclaimed: u64,
    pub execute_latency_mean_ms: f64,
    pub in_flight: u64,
    pub active_workers: u64,
    pub by_kind: BTreeMap<String, KindSnapshot>,
}

pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
