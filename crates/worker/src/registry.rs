//! Pipeline specs and the startup registry.
//!
//! One parameterized pipeline per task kind: queue, quota ceilings, lock TTL,
//! and executor. The registry rejects inconsistent sets of specs before any
//! worker starts; that is the only fatal error path of the pipeline.

use broker::QueueTopology;
use enrich_core::limits::DEFAULT_LOCK_TTL_SECS;
use enrich_core::{Error, Result, TaskKind};
use quota::{Clock, QuotaLimits, QuotaStore, RateGate};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::TaskExecutor;

/// Everything needed to run one kind's pipeline.
pub struct PipelineSpec {
    pub kind: TaskKind,
    pub topology: QueueTopology,
    pub limits: QuotaLimits,
    /// Lock lifetime; should cover the slowest expected execution.
    pub lock_ttl: Duration,
    /// Executions running longer than this count as transient failures.
    /// Always shorter than `lock_ttl`, so the result is stored while the
    /// lock is still held.
    pub execute_timeout: Duration,
    /// How long a provider result is served from the cache; no caching
    /// when unset.
    pub cache_ttl: Option<Duration>,
    pub executor: Arc<dyn TaskExecutor>,
}

impl fmt::Debug for PipelineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineSpec")
            .field("kind", &self.kind)
            .field("topology", &self.topology)
            .field("limits", &self.limits)
            .field("lock_ttl", &self.lock_ttl)
            .field("execute_timeout", &self.execute_timeout)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

impl PipelineSpec {
    pub fn builder(kind: TaskKind) -> PipelineSpecBuilder {
        PipelineSpecBuilder {
            kind,
            queue: None,
            daily_limit: None,
            window: None,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            execute_timeout: None,
            cache_ttl: None,
            executor: None,
        }
    }
}

pub struct PipelineSpecBuilder {
    kind: TaskKind,
    queue: Option<String>,
    daily_limit: Option<u64>,
    window: Option<(u64, Duration)>,
    lock_ttl: Duration,
    execute_timeout: Option<Duration>,
    cache_ttl: Option<Duration>,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl PipelineSpecBuilder {
    /// Overrides the default `<kind>_queue` name.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn daily_limit(mut self, limit: u64) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn window_limit(mut self, limit: u64, window: Duration) -> Self {
        self.window = Some((limit, window));
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Must be shorter than the lock TTL. Defaults to four fifths of it, the
    /// rest left for storing the result and releasing the lock.
    pub fn execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = Some(timeout);
        self
    }

    /// Serves successful results again for `ttl` without calling the provider.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<PipelineSpec> {
        let kind = self.kind;
        let invalid = |msg: &str| Error::config(format!("{} pipeline: {}", kind, msg));

        let queue = self.queue.unwrap_or_else(|| kind.default_queue());
        if queue.trim().is_empty() {
            return Err(invalid("queue name is empty"));
        }

        let daily = match self.daily_limit {
            Some(0) => return Err(invalid("daily limit must be positive")),
            Some(limit) => limit,
            None => return Err(invalid("no daily limit configured")),
        };
        let mut limits = QuotaLimits::daily(daily);
        if let Some((limit, window)) = self.window {
            if limit == 0 || window.is_zero() {
                return Err(invalid("window limit and window length must be positive"));
            }
            limits = limits.with_window(limit, window);
        }

        if self.lock_ttl.is_zero() {
            return Err(invalid("lock TTL must be positive"));
        }
        let execute_timeout = self
            .execute_timeout
            .unwrap_or(self.lock_ttl * 4 / 5);
        if execute_timeout.is_zero() {
            return Err(invalid("execute timeout must be positive"));
        }
        if execute_timeout >= self.lock_ttl {
            return Err(invalid("execute timeout must be shorter than the lock TTL"));
        }

        if self.cache_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(invalid("cache TTL must be positive"));
        }

        let executor = self.executor.ok_or_else(|| invalid("no executor configured"))?;

        Ok(PipelineSpec {
            kind,
            topology: QueueTopology::new(kind, queue),
            limits,
            lock_ttl: self.lock_ttl,
            execute_timeout,
            cache_ttl: self.cache_ttl,
            executor,
        })
    }
}

/// The validated set of pipelines this process runs.
#[derive(Debug)]
pub struct PipelineRegistry {
    specs: Vec<Arc<PipelineSpec>>,
}

impl PipelineRegistry {
    pub fn new(specs: Vec<PipelineSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::config("no task kinds enabled"));
        }

        let mut kinds = HashSet::new();
        let mut queues = HashSet::new();
        for spec in &specs {
            if !kinds.insert(spec.kind) {
                return Err(Error::config(format!("task kind {} configured twice", spec.kind)));
            }
            for name in [&spec.topology.queue, &spec.topology.dead_letter] {
                if !queues.insert(name.clone()) {
                    return Err(Error::config(format!("queue {} used by two pipelines", name)));
                }
            }
        }

        Ok(Self {
            specs: specs.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn specs(&self) -> &[Arc<PipelineSpec>] {
        &self.specs
    }

    pub fn get(&self, kind: TaskKind) -> Option<&Arc<PipelineSpec>> {
        self.specs.iter().find(|spec| spec.kind == kind)
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.specs.iter().map(|spec| spec.kind).collect()
    }

    pub fn topologies(&self) -> Vec<QueueTopology> {
        self.specs.iter().map(|spec| spec.topology.clone()).collect()
    }

    /// A rate gate carrying every pipeline's quota limits.
    pub fn rate_gate(
        &self,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        service_id: &str,
    ) -> RateGate {
        self.specs.iter().fold(
            RateGate::new(store, clock, service_id),
            |gate, spec| gate.with_limits(spec.kind, spec.limits),
        )
    }
}
