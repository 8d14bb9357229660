//! Per-message processing.
//!
//! received -> gated -> locked -> executing -> settled, or straight from
//! received to settled when the kind caches results and one is cached for the
//! resource. Every delivery leaves
//! [`Pipeline::process`] settled exactly once (acked, requeued, or
//! dead-lettered) unless the broker itself fails, in which case it stays
//! pending and is reclaimed later.

use broker::{DeadLetterRecord, Delivery, MessageBroker, Requeue};
use enrich_core::{ExecutorError, Result, Task, TaskResult};
use quota::{DistributedLock, LockGuard, RateGate};
use std::sync::Arc;
use std::time::Instant;
use telemetry::{metrics, KindMetrics};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::cache::ResultCache;
use crate::policy::{Disposition, RetryPolicy};
use crate::registry::PipelineSpec;
use crate::shutdown::sleep_or_shutdown;
use crate::sink::ResultSink;

/// Why a message went back on its queue without being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    Quota,
    Lock,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Served from the result cache without calling the provider.
    Cached,
    Deferred(DeferReason),
    Retried,
    DeadLettered,
}

/// Shared collaborators of every pipeline in the process.
#[derive(Clone)]
pub struct PipelineContext {
    pub broker: Arc<dyn MessageBroker>,
    pub gate: Arc<RateGate>,
    pub lock: Arc<DistributedLock>,
    pub sink: Arc<dyn ResultSink>,
    pub cache: Arc<ResultCache>,
    pub policy: RetryPolicy,
}

/// One task kind's pipeline.
pub struct Pipeline {
    spec: Arc<PipelineSpec>,
    ctx: PipelineContext,
    counters: Arc<KindMetrics>,
}

impl Pipeline {
    pub fn new(spec: Arc<PipelineSpec>, ctx: PipelineContext) -> Self {
        let counters = metrics().kind(spec.kind.as_str());
        Self {
            spec,
            ctx,
            counters,
        }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Takes one delivery to a settled state.
    ///
    /// Errors are broker failures while settling; the caller treats them as
    /// connection-level.
    pub async fn process(
        &self,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Outcome> {
        let span = tracing::info_span!(
            "task",
            kind = %self.spec.kind,
            message_id = %delivery.id,
            attempt = delivery.state.attempt,
        );
        metrics().tasks_received.inc();
        self.counters.received.inc();
        metrics().in_flight.inc();
        let outcome = self.run(&delivery, shutdown).instrument(span).await;
        metrics().in_flight.dec();
        outcome
    }

    async fn run(
        &self,
        delivery: &Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Outcome> {
        let policy = &self.ctx.policy;

        // Abandoned by crashed consumers until out of attempts
        if policy.exhausted(delivery.state.attempt) {
            let record = DeadLetterRecord::exhausted(delivery);
            return self.dead_letter(delivery, record).await;
        }

        let task = match Task::decode(&delivery.body, self.spec.kind, delivery.state.attempt) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "Undecodable task");
                metrics().decode_failures.inc();
                let record = DeadLetterRecord::from_delivery(delivery, e.to_string());
                return self.dead_letter(delivery, record).await;
            }
        };
        let resource = task.resource_key();

        if self.spec.cache_ttl.is_some() {
            if let Some(output) = self.ctx.cache.get(task.kind(), resource).await {
                return self.serve_cached(delivery, &task, output, shutdown).await;
            }
        }

        if !self.ctx.gate.admit(task.kind()).await {
            debug!(resource_key = %resource, "Quota unavailable, deferring");
            metrics().deferred_quota.inc();
            return self.defer(delivery, DeferReason::Quota).await;
        }

        let guard = match self
            .ctx
            .lock
            .acquire(task.kind(), resource, self.spec.lock_ttl)
            .await
        {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(resource_key = %resource, "Resource locked elsewhere, deferring");
                metrics().deferred_lock.inc();
                return self.defer(delivery, DeferReason::Lock).await;
            }
            Err(e) => {
                warn!(resource_key = %resource, error = %e, "Lock store unavailable, deferring");
                metrics().deferred_lock.inc();
                return self.defer(delivery, DeferReason::Lock).await;
            }
        };

        let started = Instant::now();
        let executed = match tokio::time::timeout(
            self.spec.execute_timeout,
            self.spec.executor.execute(&task),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::transient(format!(
                "execution timed out after {:?}",
                self.spec.execute_timeout
            ))),
        };
        metrics()
            .execute_latency_ms
            .observe(started.elapsed().as_millis() as u64);

        let failure = match executed {
            Ok(output) => {
                let result = TaskResult::new(&task, output);
                match self.ctx.sink.store(&result).await {
                    Ok(()) => {
                        if let Some(ttl) = self.spec.cache_ttl {
                            self.ctx
                                .cache
                                .put(task.kind(), resource, &result.output, ttl)
                                .await;
                        }
                        return self.succeed(delivery, &task, guard).await;
                    }
                    Err(e) => ExecutorError::transient(format!("result sink: {}", e)),
                }
            }
            Err(e) => e,
        };

        self.fail(delivery, &task, Some(guard), failure, shutdown).await
    }

    /// Hands a cached output to the sink and acks. No quota is spent and no
    /// lock is taken, since the provider is not called.
    async fn serve_cached(
        &self,
        delivery: &Delivery,
        task: &Task,
        output: serde_json::Value,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Outcome> {
        let result = TaskResult::new(task, output);
        if let Err(e) = self.ctx.sink.store(&result).await {
            let failure = ExecutorError::transient(format!("result sink: {}", e));
            return self.fail(delivery, task, None, failure, shutdown).await;
        }
        self.ctx.broker.ack(delivery).await?;

        metrics().cache_hits.inc();
        self.counters.cache_hits.inc();
        info!(resource_key = %task.resource_key(), "Task served from result cache");
        Ok(Outcome::Cached)
    }

    async fn succeed(&self, delivery: &Delivery, task: &Task, guard: LockGuard) -> Result<Outcome> {
        match self.ctx.gate.record_usage(task.kind()).await {
            Ok(used) => debug!(used, "Recorded usage"),
            Err(e) => {
                metrics().usage_record_failures.inc();
                error!(error = %e, "Failed to record quota usage");
            }
        }
        self.release(guard).await;
        self.ctx.broker.ack(delivery).await?;

        metrics().tasks_succeeded.inc();
        self.counters.succeeded.inc();
        info!(
            resource_key = %task.resource_key(),
            attempts = task.attempt() + 1,
            "Task succeeded"
        );
        Ok(Outcome::Succeeded)
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        task: &Task,
        guard: Option<LockGuard>,
        failure: ExecutorError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Outcome> {
        let disposition = self.ctx.policy.on_failure(&failure, task.attempt());
        if let Some(guard) = guard {
            self.release(guard).await;
        }

        if let ExecutorError::RateLimited { .. } = failure {
            metrics().provider_rate_limited.inc();
        }

        match disposition {
            Disposition::DeadLetter => {
                error!(
                    resource_key = %task.resource_key(),
                    error = %failure,
                    "Task failed permanently"
                );
                let record = DeadLetterRecord::from_delivery(delivery, failure.to_string());
                self.dead_letter(delivery, record).await
            }
            Disposition::Retry { wait } => {
                warn!(
                    resource_key = %task.resource_key(),
                    error = %failure,
                    wait_ms = wait.map(|w| w.as_millis() as u64),
                    "Task failed, retrying"
                );
                if let Some(wait) = wait {
                    if !sleep_or_shutdown(wait, shutdown).await {
                        info!("Shutdown during provider backoff, requeueing now");
                    }
                }
                self.ctx
                    .broker
                    .requeue(delivery, Requeue::retry(failure.to_string()))
                    .await?;
                metrics().tasks_retried.inc();
                self.counters.retried.inc();
                Ok(Outcome::Retried)
            }
        }
    }

    async fn defer(&self, delivery: &Delivery, reason: DeferReason) -> Result<Outcome> {
        self.ctx.broker.requeue(delivery, Requeue::Defer).await?;
        self.counters.deferred.inc();
        Ok(Outcome::Deferred(reason))
    }

    async fn dead_letter(&self, delivery: &Delivery, record: DeadLetterRecord) -> Result<Outcome> {
        self.ctx
            .broker
            .dead_letter(&self.spec.topology, delivery, &record)
            .await?;
        metrics().tasks_dead_lettered.inc();
        self.counters.dead_lettered.inc();
        Ok(Outcome::DeadLettered)
    }

    async fn release(&self, guard: LockGuard) {
        let key = guard.key().to_string();
        if let Err(e) = self.ctx.lock.release(guard).await {
            metrics().lock_release_failures.inc();
            warn!(key = %key, error = %e, "Failed to release lock, it will lapse at its TTL");
        }
    }
}
