//! Task executors: the provider calls the pipeline gates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrich_core::{Error, ExecutorError, Result, Task};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Runs one task against its provider.
///
/// Implementations classify their own failures: anything that may succeed on
/// another try is `Transient`, anything that never will is `Permanent`, and a
/// provider asking us to slow down is `RateLimited`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, ExecutorError>;
}

/// POSTs the task payload, verbatim, to a provider endpoint.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpExecutor {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("enrichment-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, ExecutorError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header("x-task-id", task.id().to_string())
            .header("x-task-kind", task.kind().as_str())
            .body(task.payload().get().to_owned());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        debug!(
            task_id = %task.id(),
            endpoint = %self.endpoint,
            status = status.as_u16(),
            "Provider responded"
        );

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExecutorError::rate_limited(retry_after(
                response.headers(),
                Utc::now(),
            )));
        }

        let text = response.text().await.map_err(classify_transport)?;
        if status.is_success() {
            return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }

        let detail = format!("{} from {}: {}", status, self.endpoint, truncate(&text, 200));
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            Err(ExecutorError::transient(detail))
        } else {
            Err(ExecutorError::permanent(detail))
        }
    }
}

fn classify_transport(e: reqwest::Error) -> ExecutorError {
    if e.is_builder() {
        ExecutorError::permanent(e.to_string())
    } else {
        ExecutorError::transient(e.to_string())
    }
}

/// `Retry-After` as delta-seconds or an HTTP date. None when absent or unreadable.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
