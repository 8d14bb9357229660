//! Queue topology per task kind.

use enrich_core::TaskKind;

/// Suffix of every dead-letter queue name.
pub const DEAD_LETTER_SUFFIX: &str = "_dlq";

/// A task queue and the dead-letter queue its rejects are routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub kind: TaskKind,
    pub queue: String,
    pub dead_letter: String,
}

impl QueueTopology {
    pub fn new(kind: TaskKind, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let dead_letter = format!("{}{}", queue, DEAD_LETTER_SUFFIX);
        Self {
            kind,
            queue,
            dead_letter,
        }
    }

    /// Topology under the kind's default queue name.
    pub fn for_kind(kind: TaskKind) -> Self {
        Self::new(kind, kind.default_queue())
    }
}
