//! Deliveries, their metadata, and dead-letter records.
//!
//! The task body is opaque here. Delivery metadata (attempt count, failure
//! history, original enqueue time) travels next to the body, never inside it,
//! so requeueing and dead-lettering leave the producer's bytes untouched.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use enrich_core::{Error, Result, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stream field names.
pub mod field {
    pub const BODY: &str = "body";
    pub const ATTEMPT: &str = "attempt";
    pub const ENQUEUED_AT: &str = "enqueued_at";
    pub const LAST_ERROR: &str = "last_error";
    pub const HISTORY: &str = "history";
    pub const RECORD: &str = "record";
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Broker-side metadata of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryState {
    /// Attempts already consumed (0 on first delivery).
    pub attempt: u32,
    pub last_error: Option<String>,
    pub history: Vec<FailureEntry>,
    pub enqueued_at: DateTime<Utc>,
}

impl DeliveryState {
    pub fn fresh(enqueued_at: DateTime<Utc>) -> Self {
        Self {
            attempt: 0,
            last_error: None,
            history: Vec::new(),
            enqueued_at,
        }
    }

    /// State the message carries after being requeued.
    pub fn after(&self, requeue: &Requeue) -> Self {
        match requeue {
            Requeue::Defer => self.clone(),
            Requeue::Retry { error } => {
                let mut history = self.history.clone();
                history.push(FailureEntry {
                    attempt: self.attempt,
                    error: error.clone(),
                    at: Utc::now(),
                });
                Self {
                    attempt: self.attempt.saturating_add(1),
                    last_error: Some(error.clone()),
                    history,
                    enqueued_at: self.enqueued_at,
                }
            }
        }
    }

    /// Metadata as stream fields, excluding the body.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        let mut fields = vec![
            (field::ATTEMPT, self.attempt.to_string().into_bytes()),
            (field::ENQUEUED_AT, self.enqueued_at.to_rfc3339().into_bytes()),
        ];
        if let Some(error) = &self.last_error {
            fields.push((field::LAST_ERROR, error.clone().into_bytes()));
        }
        if !self.history.is_empty() {
            fields.push((field::HISTORY, serde_json::to_vec(&self.history)?));
        }
        Ok(fields)
    }

    /// Reads metadata back from stream fields. Missing fields mean a message
    /// straight from a producer: attempt 0, enqueued now.
    pub fn from_fields(fields: &HashMap<String, Vec<u8>>) -> Result<Self> {
        let text = |name: &str| {
            fields
                .get(name)
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
        };

        let attempt = match text(field::ATTEMPT) {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::broker(format!("invalid attempt field: {}", raw)))?,
            None => 0,
        };
        let enqueued_at = match text(field::ENQUEUED_AT) {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| Error::broker(format!("invalid enqueued_at field: {}", e)))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };
        let history = match fields.get(field::HISTORY) {
            Some(raw) => serde_json::from_slice(raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            attempt,
            last_error: text(field::LAST_ERROR),
            history,
            enqueued_at,
        })
    }
}

/// A message handed to one consumer. Exactly one of ack, requeue, or
/// dead-letter must follow.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub queue: String,
    pub kind: TaskKind,
    pub body: Bytes,
    pub state: DeliveryState,
}

/// How a message goes back on its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requeue {
    /// Not attempted (quota or lock contention). Attempt count unchanged.
    Defer,
    /// Attempted and failed. Consumes an attempt and records the error.
    Retry { error: String },
}

impl Requeue {
    pub fn retry(error: impl Into<String>) -> Self {
        Self::Retry {
            error: error.into(),
        }
    }

    pub fn consumes_attempt(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Why a message was dead-lettered and what happened before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_kind: TaskKind,
    pub queue: String,
    pub reason: String,
    pub attempts: u32,
    pub failures: Vec<FailureEntry>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Record for a delivery that failed on its current attempt.
    pub fn from_delivery(delivery: &Delivery, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let now = Utc::now();
        let mut failures = delivery.state.history.clone();
        failures.push(FailureEntry {
            attempt: delivery.state.attempt,
            error: reason.clone(),
            at: now,
        });

        Self {
            task_kind: delivery.kind,
            queue: delivery.queue.clone(),
            reason,
            attempts: delivery.state.attempt.saturating_add(1),
            failures,
            dead_lettered_at: now,
        }
    }

    /// Record for a delivery whose attempts ran out before it was tried again.
    pub fn exhausted(delivery: &Delivery) -> Self {
        let reason = delivery
            .state
            .last_error
            .clone()
            .unwrap_or_else(|| "attempts exhausted".to_string());

        Self {
            task_kind: delivery.kind,
            queue: delivery.queue.clone(),
            reason,
            attempts: delivery.state.attempt,
            failures: delivery.state.history.clone(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// An entry of a dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub record: DeadLetterRecord,
    /// The original message body, byte for byte.
    pub body: Bytes,
}
