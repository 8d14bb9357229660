//! Worker scheduler: spawns every long-running loop of the process.

use broker::MessageBroker;
use quota::QuotaStore;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{health, metrics};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::consumer::{ConsumerConfig, ConsumerWorker};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::registry::PipelineRegistry;

/// Owns the registry and shared collaborators; `start` fans them out.
pub struct WorkerScheduler {
    registry: Arc<PipelineRegistry>,
    ctx: PipelineContext,
    store: Arc<dyn QuotaStore>,
    consumer: ConsumerConfig,
    metrics_interval: Duration,
    health_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl WorkerScheduler {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        ctx: PipelineContext,
        store: Arc<dyn QuotaStore>,
        consumer: ConsumerConfig,
        config: &WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            ctx,
            store,
            consumer,
            metrics_interval: config.metrics_interval(),
            health_interval: config.health_interval(),
            shutdown,
        }
    }

    /// Starts one consumer per pipeline plus the health check and metrics
    /// loops. Every handle completes after shutdown.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for spec in self.registry.specs() {
            let pipeline = Pipeline::new(spec.clone(), self.ctx.clone());
            let worker = ConsumerWorker::new(pipeline, self.consumer.clone());
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.run(shutdown).await;
            }));
        }
        info!(count = handles.len(), "Consumer workers started");

        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_health_checks().await;
        }));

        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_metrics_log().await;
        }));

        info!("Background workers started");
        handles
    }

    async fn run_health_checks(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(self.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            check_components(self.ctx.broker.as_ref(), self.store.as_ref()).await;
        }
    }

    /// Updates each kind's queue depth gauge. A failed read keeps the last value.
    async fn sample_queue_depths(&self) {
        for spec in self.registry.specs() {
            match self.ctx.broker.depth(&spec.topology.queue).await {
                Ok(depth) => metrics().kind(spec.kind.as_str()).queue_depth.set(depth),
                Err(e) => warn!(queue = %spec.topology.queue, error = %e, "Failed to read queue depth"),
            }
        }
    }

    async fn run_metrics_log(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(self.metrics_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            self.sample_queue_depths().await;
            let snapshot = metrics().snapshot();
            info!(
                received = snapshot.tasks_received,
                succeeded = snapshot.tasks_succeeded,
                cache_hits = snapshot.cache_hits,
                retried = snapshot.tasks_retried,
                dead_lettered = snapshot.tasks_dead_lettered,
                deferred_quota = snapshot.deferred_quota,
                deferred_lock = snapshot.deferred_lock,
                in_flight = snapshot.in_flight,
                execute_latency_mean_ms = snapshot.execute_latency_mean_ms,
                "Pipeline metrics"
            );
            for (kind, counters) in &snapshot.by_kind {
                info!(
                    kind = %kind,
                    received = counters.received,
                    succeeded = counters.succeeded,
                    cache_hits = counters.cache_hits,
                    retried = counters.retried,
                    dead_lettered = counters.dead_lettered,
                    deferred = counters.deferred,
                    queue_depth = counters.queue_depth,
                    "Pipeline metrics by kind"
                );
            }
            for usage in self.ctx.gate.all_usage().await {
                info!(kind = %usage.kind, used = usage.used, limit = usage.limit, "Daily quota usage");
            }
        }
    }
}

/// Probes both dependencies and records the result in the health registry.
pub async fn check_components(transport: &dyn MessageBroker, store: &dyn QuotaStore) {
    health()
        .broker
        .observe(broker::health::check_connection(transport).await, "broker unreachable");
    health()
        .store
        .observe(quota::health::check_connection(store).await, "quota store unreachable");
}
