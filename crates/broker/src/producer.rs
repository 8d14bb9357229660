//! Task publishing for upstream producers and dead-letter replay.

use chrono::Utc;
use enrich_core::{Result, TaskEnvelope};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::message::DeadLetter;
use crate::queues::QueueTopology;
use crate::transport::MessageBroker;

/// Publishes task envelopes onto their queues.
#[derive(Clone)]
pub struct TaskPublisher {
    broker: Arc<dyn MessageBroker>,
}

impl TaskPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    /// Publishes onto the kind's default queue.
    pub async fn publish(&self, envelope: TaskEnvelope) -> Result<String> {
        let topology = QueueTopology::for_kind(envelope.kind);
        self.publish_to(&topology, envelope).await
    }

    /// Publishes onto `topology`'s queue, stamping a task id and enqueue time
    /// when the producer left them out.
    pub async fn publish_to(
        &self,
        topology: &QueueTopology,
        mut envelope: TaskEnvelope,
    ) -> Result<String> {
        envelope.task_id.get_or_insert_with(Uuid::new_v4);
        envelope.enqueued_at.get_or_insert_with(Utc::now);

        let id = self
            .broker
            .publish(&topology.queue, &envelope.to_bytes()?)
            .await?;
        debug!(
            id = %id,
            queue = %topology.queue,
            resource_key = %envelope.resource_key,
            "Published task"
        );
        Ok(id)
    }

    /// Puts a dead-lettered message back on its task queue as a fresh task.
    /// The body is republished unchanged.
    pub async fn replay(&self, topology: &QueueTopology, dead: &DeadLetter) -> Result<String> {
        let id = self.broker.publish(&topology.queue, &dead.body).await?;
        info!(
            dead_letter_id = %dead.id,
            id = %id,
            queue = %topology.queue,
            reason = %dead.record.reason,
            "Replayed dead letter"
        );
        Ok(id)
    }
}
