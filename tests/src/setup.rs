//! Common test setup.

use api::{router, AppState};
use axum::Router;
use broker::{Delivery, MemoryBroker, MessageBroker, QueueTopology, TaskPublisher};
use chrono::{TimeZone, Utc};
use enrich_core::TaskKind;
use quota::{DistributedLock, ManualClock, MemoryQuotaStore, QuotaStore, RateGate};
use std::sync::Arc;
use std::time::Duration;
use telemetry::HealthRegistry;
use tokio::sync::watch;
use worker::{
    Outcome, Pipeline, PipelineContext, PipelineRegistry, PipelineSpec, ResultCache, RetryPolicy,
};

use crate::fixtures;
use crate::mocks::{RecordingSink, ScriptedExecutor};

pub const SERVICE_ID: &str = "it";

/// One task kind's pipeline over in-memory broker and store, with a manual
/// clock. Every [`TestContext::worker`] is an independent worker process
/// sharing the broker and store, as separate deployments would.
pub struct TestContext {
    pub kind: TaskKind,
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<MemoryQuotaStore>,
    pub clock: ManualClock,
    pub executor: Arc<ScriptedExecutor>,
    pub sink: Arc<RecordingSink>,
    pub publisher: TaskPublisher,
    pub registry: Arc<PipelineRegistry>,
    pub policy: RetryPolicy,
    shutdown: watch::Sender<bool>,
}

impl TestContext {
    pub async fn new(kind: TaskKind, daily_limit: u64) -> Self {
        Self::with_spec(kind, |builder| builder.daily_limit(daily_limit)).await
    }

    /// Builds the context from a customized spec builder; the scripted
    /// executor is installed afterwards.
    pub async fn with_spec(
        kind: TaskKind,
        customize: impl FnOnce(worker::PipelineSpecBuilder) -> worker::PipelineSpecBuilder,
    ) -> Self {
        telemetry::init_test_tracing();

        // Midday so tests never straddle a local midnight by accident
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let store = Arc::new(MemoryQuotaStore::new(Arc::new(clock.clone())));
        let broker = Arc::new(MemoryBroker::new());
        let executor = ScriptedExecutor::new();

        let spec = customize(PipelineSpec::builder(kind))
            .executor(executor.clone())
            .build()
            .expect("valid test pipeline spec");
        let registry = Arc::new(PipelineRegistry::new(vec![spec]).expect("valid registry"));
        for topology in registry.topologies() {
            broker.declare(&topology).await.expect("declare test queue");
        }

        Self {
            kind,
            publisher: TaskPublisher::new(broker.clone()),
            broker,
            store,
            clock,
            executor,
            sink: RecordingSink::new(),
            registry,
            policy: RetryPolicy::default(),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn topology(&self) -> QueueTopology {
        self.registry.topologies().remove(0)
    }

    pub fn gate(&self) -> Arc<RateGate> {
        Arc::new(
            self.registry
                .rate_gate(self.store.clone(), Arc::new(self.clock.clone()), SERVICE_ID),
        )
    }

    /// A fresh pipeline instance, as a newly started worker process would
    /// build it. Nothing carries over from earlier instances except what
    /// lives in the broker and store.
    pub fn worker(&self, holder: &str) -> Pipeline {
        let spec = self
            .registry
            .get(self.kind)
            .expect("registry holds the context kind")
            .clone();
        let ctx = PipelineContext {
            broker: self.broker.clone(),
            gate: self.gate(),
            lock: Arc::new(DistributedLock::new(self.store.clone(), SERVICE_ID, holder)),
            sink: self.sink.clone(),
            cache: Arc::new(ResultCache::new(self.store.clone())),
            policy: self.policy,
        };
        Pipeline::new(spec, ctx)
    }

    pub async fn publish(&self, resource_key: &str) -> String {
        self.publisher
            .publish_to(&self.topology(), fixtures::envelope(self.kind, resource_key))
            .await
            .expect("publish task")
    }

    pub async fn publish_raw(&self, body: &[u8]) -> String {
        self.broker
            .publish(&self.topology().queue, body)
            .await
            .expect("publish raw body")
    }

    /// The next ready delivery, without waiting.
    pub async fn receive(&self) -> Option<Delivery> {
        self.broker
            .receive(&self.topology(), Duration::ZERO)
            .await
            .expect("receive from memory broker")
    }

    /// Receives one message and runs it through `worker`.
    pub async fn step(&self, worker: &Pipeline) -> Outcome {
        let delivery = self.receive().await.expect("a ready message");
        self.process(worker, delivery).await
    }

    pub async fn process(&self, worker: &Pipeline, delivery: Delivery) -> Outcome {
        let mut shutdown = self.shutdown.subscribe();
        worker
            .process(delivery, &mut shutdown)
            .await
            .expect("memory broker settles deliveries")
    }

    pub fn ready(&self) -> usize {
        self.broker.ready_len(&self.topology().queue)
    }

    pub fn pending(&self) -> usize {
        self.broker.pending_len(&self.topology().queue)
    }

    pub fn dead_lettered(&self) -> usize {
        self.broker.dead_letter_len(&self.topology().dead_letter)
    }

    pub async fn usage(&self) -> u64 {
        self.gate()
            .current_usage(self.kind)
            .await
            .expect("memory store reads usage")
    }

    pub async fn lock_held(&self, resource_key: &str) -> bool {
        let key = DistributedLock::new(self.store.clone(), SERVICE_ID, "lock-check")
            .lock_key(self.kind, resource_key);
        self.store.get(&key).await.expect("memory store get").is_some()
    }

    /// Health router over a private registry, so tests do not share state.
    pub fn health_router(&self) -> (Router, &'static HealthRegistry) {
        let health: &'static HealthRegistry = Box::leak(Box::new(HealthRegistry::new()));
        (router(AppState::with_health(self.gate(), health)), health)
    }
}
