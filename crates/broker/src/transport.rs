//! Broker interface.

use async_trait::async_trait;
use enrich_core::Result;
use std::time::Duration;

use crate::message::{DeadLetter, DeadLetterRecord, Delivery, Requeue};
use crate::queues::QueueTopology;

/// Durable queues with explicit acknowledgment.
///
/// Each delivery handed out by [`receive`](MessageBroker::receive) stays owned
/// by the receiving consumer until it is acked, requeued, or dead-lettered.
/// A delivery never settled (the consumer died) is handed back to the queue by
/// [`reclaim`](MessageBroker::reclaim) as a failed attempt.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Idempotently creates the task queue and its consumer group.
    async fn declare(&self, topology: &QueueTopology) -> Result<()>;

    /// Next message on the queue, waiting at most `block`. Prefetch is one.
    async fn receive(&self, topology: &QueueTopology, block: Duration)
        -> Result<Option<Delivery>>;

    /// Removes the message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Puts the message back at the tail of its queue with updated metadata.
    async fn requeue(&self, delivery: &Delivery, requeue: Requeue) -> Result<()>;

    /// Moves the message to the queue's dead-letter queue.
    async fn dead_letter(
        &self,
        topology: &QueueTopology,
        delivery: &Delivery,
        record: &DeadLetterRecord,
    ) -> Result<()>;

    /// Appends a producer message. Returns its id.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<String>;

    /// Returns messages abandoned longer than `idle` by other consumers to the
    /// queue, each counted as a failed attempt. Returns how many were returned.
    async fn reclaim(&self, topology: &QueueTopology, idle: Duration) -> Result<usize>;

    /// Messages on the queue not yet settled, delivered or not.
    async fn depth(&self, queue: &str) -> Result<u64>;

    /// Oldest `limit` entries of the queue's dead-letter queue.
    async fn dead_letters(&self, topology: &QueueTopology, limit: usize)
        -> Result<Vec<DeadLetter>>;

    async fn ping(&self) -> Result<()>;
}
