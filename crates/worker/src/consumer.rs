//! Consumer worker: one receive loop per task kind.
//!
//! 1. Declare the queue (again after every reconnect)
//! 2. Periodically reclaim deliveries abandoned by dead consumers
//! 3. Receive one message and run it through the pipeline
//! 4. Pause after a deferral so a spent quota is not spun on
//!
//! Broker failures never end the loop; they trip the broker health flag and
//! back off exponentially until the broker answers again. Only shutdown ends
//! it, and only between messages.

use broker::{BrokerConfig, MessageBroker};
use enrich_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{health, metrics};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::pipeline::{Outcome, Pipeline};
use crate::policy::{ReconnectBackoff, RetryPolicy};
use crate::registry::PipelineRegistry;
use crate::shutdown::{is_shutdown, sleep_or_shutdown};

/// Consumer loop timing.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Longest a single receive blocks
    pub block: Duration,
    /// Pending deliveries idle longer than this are reclaimed
    pub claim_idle: Duration,
    pub reclaim_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl ConsumerConfig {
    pub fn new(broker: &BrokerConfig, worker: &WorkerConfig) -> Self {
        Self {
            block: broker.block(),
            claim_idle: broker.claim_idle(),
            reclaim_interval: broker.reclaim_interval(),
            reconnect_base: worker.reconnect_base(),
            reconnect_max: worker.reconnect_max(),
        }
    }

    /// Rejects a `claim_idle` that would reclaim deliveries still being
    /// worked on: it must exceed every pipeline's lock TTL plus the longest
    /// provider wait a failed attempt may sit through before settling.
    pub fn check_claim_idle(&self, registry: &PipelineRegistry, policy: &RetryPolicy) -> Result<()> {
        let provider_wait = Duration::from_secs(policy.max_provider_retry_after_secs);
        for spec in registry.specs() {
            let held = spec.lock_ttl + provider_wait;
            if self.claim_idle <= held {
                return Err(Error::config(format!(
                    "claim_idle of {}s is too short for the {} pipeline, which may hold a delivery for {}s",
                    self.claim_idle.as_secs(),
                    spec.kind,
                    held.as_secs()
                )));
            }
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(&BrokerConfig::default(), &WorkerConfig::default())
    }
}

/// Per-connection state, reset whenever the broker fails.
struct Session {
    declared: bool,
    next_reclaim: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            declared: false,
            next_reclaim: Instant::now(),
        }
    }
}

/// Runs one pipeline against its queue until shutdown.
pub struct ConsumerWorker {
    pipeline: Pipeline,
    broker: Arc<dyn MessageBroker>,
    config: ConsumerConfig,
}

impl ConsumerWorker {
    pub fn new(pipeline: Pipeline, config: ConsumerConfig) -> Self {
        let broker = pipeline.context().broker.clone();
        Self {
            pipeline,
            broker,
            config,
        }
    }

    /// Main loop. Returns once `shutdown` flips and the in-flight message
    /// (if any) is settled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let topology = &self.pipeline.spec().topology;
        info!(
            kind = %self.pipeline.spec().kind,
            queue = %topology.queue,
            dead_letter = %topology.dead_letter,
            "Consumer worker starting"
        );
        metrics().active_workers.inc();

        let mut backoff = ReconnectBackoff::new(self.config.reconnect_base, self.config.reconnect_max);
        let mut session = Session::new();

        while !is_shutdown(&shutdown) {
            match self.poll_once(&mut session, &mut shutdown).await {
                Ok(()) => {
                    if backoff.failures() > 0 {
                        info!(queue = %topology.queue, "Broker connection restored");
                        metrics().reconnects.inc();
                        health().broker.set_healthy();
                        backoff.reset();
                    }
                }
                Err(e) => {
                    metrics().broker_errors.inc();
                    health().broker.set_unhealthy(e.to_string());
                    session = Session::new();

                    let delay = backoff.next_delay();
                    warn!(
                        queue = %topology.queue,
                        error = %e,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Broker error, reconnecting"
                    );
                    if !sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        metrics().active_workers.dec();
        info!(queue = %topology.queue, "Consumer worker stopped");
    }

    /// One receive cycle: declare if needed, reclaim if due, process at most
    /// one message.
    async fn poll_once(
        &self,
        session: &mut Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let topology = &self.pipeline.spec().topology;

        if !session.declared {
            self.broker.declare(topology).await?;
            session.declared = true;
        }

        if Instant::now() >= session.next_reclaim {
            let reclaimed = self.broker.reclaim(topology, self.config.claim_idle).await?;
            if reclaimed > 0 {
                info!(queue = %topology.queue, reclaimed, "Reclaimed abandoned deliveries");
                metrics().reclaimed.inc_by(reclaimed as u64);
            }
            session.next_reclaim = Instant::now() + self.config.reclaim_interval;
        }

        let Some(delivery) = self.broker.receive(topology, self.config.block).await? else {
            return Ok(());
        };

        match self.pipeline.process(delivery, shutdown).await? {
            Outcome::Deferred(reason) => {
                let pause = self.pipeline.context().policy.defer_backoff();
                debug!(?reason, pause_ms = pause.as_millis() as u64, "Pausing after deferral");
                sleep_or_shutdown(pause, shutdown).await;
            }
            Outcome::Succeeded | Outcome::Cached | Outcome::Retried | Outcome::DeadLettered => {}
        }
        Ok(())
    }
}
