//! Broker health checks.

use crate::queues::QueueTopology;
use crate::transport::MessageBroker;
use tracing::{debug, error};

/// Check broker connection health.
pub async fn check_connection(broker: &dyn MessageBroker) -> bool {
    match broker.ping().await {
        Ok(()) => {
            debug!("Broker connection healthy");
            true
        }
        Err(e) => {
            error!("Broker ping failed: {}", e);
            false
        }
    }
}

/// Declares every queue. Returns the queues that could not be declared.
pub async fn declare_all(broker: &dyn MessageBroker, topologies: &[QueueTopology]) -> Vec<String> {
    let mut failed = Vec::new();
    for topology in topologies {
        if let Err(e) = broker.declare(topology).await {
            error!(queue = %topology.queue, error = %e, "Failed to declare queue");
            failed.push(topology.queue.clone());
        }
    }
    failed
}
