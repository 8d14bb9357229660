//! In-process broker with the same settlement semantics as the Redis one.
//!
//! Used by tests and single-process dev runs. Messages do not survive the
//! process.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use enrich_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::message::{DeadLetter, DeadLetterRecord, Delivery, DeliveryState, Requeue};
use crate::queues::QueueTopology;
use crate::transport::MessageBroker;

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: Bytes,
    state: DeliveryState,
}

#[derive(Debug, Default)]
struct QueueState {
    declared: bool,
    ready: VecDeque<Stored>,
    pending: HashMap<String, (Stored, Instant)>,
}

/// In-memory [`MessageBroker`].
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    dead: Mutex<HashMap<String, Vec<DeadLetter>>>,
    next_id: AtomicU64,
    arrivals: Notify,
    offline: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a broker outage: every call fails with [`Error::Broker`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Messages waiting for a consumer.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn pending_len(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.pending.len())
    }

    pub fn dead_letter_len(&self, dead_letter: &str) -> usize {
        self.dead.lock().get(dead_letter).map_or(0, Vec::len)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::broker("broker offline"))
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> String {
        format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn take_ready(&self, topology: &QueueTopology) -> Result<Option<Delivery>> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(&topology.queue)
            .filter(|q| q.declared)
            .ok_or_else(|| {
                Error::broker(format!("NOGROUP no consumer group on {}", topology.queue))
            })?;

        let Some(stored) = queue.ready.pop_front() else {
            return Ok(None);
        };
        let delivery = Delivery {
            id: stored.id.clone(),
            queue: topology.queue.clone(),
            kind: topology.kind,
            body: stored.body.clone(),
            state: stored.state.clone(),
        };
        queue
            .pending
            .insert(stored.id.clone(), (stored, Instant::now()));
        Ok(Some(delivery))
    }

    /// Removes `delivery` from its queue's pending set. False if it was not pending.
    fn settle(&self, delivery: &Delivery) -> bool {
        let mut queues = self.queues.lock();
        let removed = queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.pending.remove(&delivery.id))
            .is_some();
        if !removed {
            warn!(id = %delivery.id, queue = %delivery.queue, "Settling a delivery no longer pending");
        }
        removed
    }

    fn push_ready(&self, queue: &str, body: Bytes, state: DeliveryState) -> String {
        let id = self.next_id();
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Stored {
                id: id.clone(),
                body,
                state,
            });
        self.arrivals.notify_waiters();
        id
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<()> {
        self.check_online()?;
        self.queues
            .lock()
            .entry(topology.queue.clone())
            .or_default()
            .declared = true;
        self.dead.lock().entry(topology.dead_letter.clone()).or_default();
        Ok(())
    }

    async fn receive(
        &self,
        topology: &QueueTopology,
        block: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            self.check_online()?;
            // Register for wakeups before looking so a publish in between is not missed
            let arrival = self.arrivals.notified();
            if let Some(delivery) = self.take_ready(topology)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check_online()?;
        self.settle(delivery);
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, requeue: Requeue) -> Result<()> {
        self.check_online()?;
        if self.settle(delivery) {
            let state = delivery.state.after(&requeue);
            debug!(id = %delivery.id, queue = %delivery.queue, attempt = state.attempt, "Requeued");
            self.push_ready(&delivery.queue, delivery.body.clone(), state);
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        topology: &QueueTopology,
        delivery: &Delivery,
        record: &DeadLetterRecord,
    ) -> Result<()> {
        self.check_online()?;
        if self.settle(delivery) {
            let id = self.next_id();
            self.dead
                .lock()
                .entry(topology.dead_letter.clone())
                .or_default()
                .push(DeadLetter {
                    id,
                    record: record.clone(),
                    body: delivery.body.clone(),
                });
            warn!(
                id = %delivery.id,
                dead_letter = %topology.dead_letter,
                reason = %record.reason,
                "Dead-lettered"
            );
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<String> {
        self.check_online()?;
        Ok(self.push_ready(
            queue,
            Bytes::copy_from_slice(body),
            DeliveryState::fresh(Utc::now()),
        ))
    }

    async fn reclaim(&self, topology: &QueueTopology, idle: Duration) -> Result<usize> {
        self.check_online()?;
        let abandoned: Vec<Stored> = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(&topology.queue) else {
                return Ok(0);
            };
            let ids: Vec<String> = queue
                .pending
                .iter()
                .filter(|(_, (_, since))| since.elapsed() >= idle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| queue.pending.remove(id))
                .map(|(stored, _)| stored)
                .collect()
        };

        let retry = Requeue::retry("abandoned by consumer before settling");
        for stored in &abandoned {
            warn!(id = %stored.id, queue = %topology.queue, "Reclaiming abandoned delivery");
            self.push_ready(&topology.queue, stored.body.clone(), stored.state.after(&retry));
        }
        Ok(abandoned.len())
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        self.check_online()?;
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| (q.ready.len() + q.pending.len()) as u64))
    }

    async fn dead_letters(
        &self,
        topology: &QueueTopology,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        self.check_online()?;
        Ok(self
            .dead
            .lock()
            .get(&topology.dead_letter)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}
