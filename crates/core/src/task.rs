//! Task model and wire format.
//!
//! A task message on the wire is a JSON envelope:
//!
//! ```json
//! { "kind": "leak_check", "resource_key": "a@b.com", "payload": { ... },
//!   "task_id": "…", "enqueued_at": "2024-01-01T00:00:00Z" }
//! ```
//!
//! The payload is kept as raw JSON so it is handed to executors, and to the
//! dead-letter queue, exactly as the producer wrote it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use crate::error::{Error, Result};
use crate::limits::MAX_MESSAGE_BYTES;

/// Category of enrichment work. One queue, one executor, one quota ceiling each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    BusinessSearch,
    Serp,
    DomainEmail,
    Phone,
    LeakCheck,
    ShodanSearch,
    ShodanHost,
}

impl TaskKind {
    /// All kinds, for config validation and usage reports.
    pub const ALL: [TaskKind; 7] = [
        Self::BusinessSearch,
        Self::Serp,
        Self::DomainEmail,
        Self::Phone,
        Self::LeakCheck,
        Self::ShodanSearch,
        Self::ShodanHost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BusinessSearch => "business_search",
            Self::Serp => "serp",
            Self::DomainEmail => "domain_email",
            Self::Phone => "phone",
            Self::LeakCheck => "leak_check",
            Self::ShodanSearch => "shodan_search",
            Self::ShodanHost => "shodan_host",
        }
    }

    /// Default durable queue for this kind.
    pub fn default_queue(&self) -> String {
        format!("{}_queue", self.as_str())
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::decode(format!("unknown task kind: {}", s)))
    }
}

/// Task message as published by upstream producers.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TaskEnvelope {
    pub kind: TaskKind,
    /// Logical subject of the task (email, IP, domain, query).
    #[validate(length(min = 1, max = 512))]
    pub resource_key: String,
    pub payload: Box<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    /// Builds an envelope with a fresh task id, stamped now.
    pub fn new(
        kind: TaskKind,
        resource_key: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            resource_key: resource_key.into(),
            payload: serde_json::value::to_raw_value(payload)?,
            task_id: Some(Uuid::new_v4()),
            enqueued_at: Some(Utc::now()),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Immutable unit of work decoded from a delivered message.
#[derive(Debug, Clone)]
pub struct Task {
    id: Uuid,
    kind: TaskKind,
    resource_key: String,
    payload: Box<RawValue>,
    attempt: u32,
    enqueued_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Decodes a message body that arrived on the queue for `expected`.
    ///
    /// Any structural problem is a [`Error::Decode`]: the message can never
    /// succeed and goes straight to the dead-letter queue.
    pub fn decode(body: &[u8], expected: TaskKind, attempt: u32) -> Result<Self> {
        if body.len() > MAX_MESSAGE_BYTES {
            return Err(Error::decode(format!(
                "message of {} bytes exceeds {} byte limit",
                body.len(),
                MAX_MESSAGE_BYTES
            )));
        }

        let envelope: TaskEnvelope =
            serde_json::from_slice(body).map_err(|e| Error::decode(e.to_string()))?;

        envelope
            .validate()
            .map_err(|e| Error::decode(format!("invalid task: {}", e)))?;

        if envelope.kind != expected {
            return Err(Error::decode(format!(
                "task kind {} delivered on the {} queue",
                envelope.kind, expected
            )));
        }

        Ok(Self {
            id: envelope.task_id.unwrap_or_else(Uuid::new_v4),
            kind: envelope.kind,
            resource_key: envelope.resource_key,
            payload: envelope.payload,
            attempt,
            enqueued_at: envelope.enqueued_at,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Raw payload JSON, exactly as published.
    pub fn payload(&self) -> &RawValue {
        &self.payload
    }

    /// Parses the payload into a provider-specific request type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.payload.get()).map_err(|e| Error::decode(e.to_string()))
    }

    /// Attempts already consumed before this delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }
}

/// Output of a successful execution, handed to the result sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub resource_key: String,
    pub output: serde_json::Value,
    /// Total executions including this one.
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(task: &Task, output: serde_json::Value) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            resource_key: task.resource_key.clone(),
            output,
            attempts: task.attempt + 1,
            completed_at: Utc::now(),
        }
    }
}
