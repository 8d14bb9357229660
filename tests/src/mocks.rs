//! Mock executors and sinks.

use async_trait::async_trait;
use enrich_core::{Error, ExecutorError, Result, Task, TaskResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use worker::{ResultSink, TaskExecutor};

type Scripted = std::result::Result<Value, ExecutorError>;

/// Executor that replays a script of results, then succeeds.
///
/// Every call is recorded before it runs. `hold` parks calls until `open`,
/// so a test can keep one worker inside `executing` while another races it.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            gate: watch::channel(true).0,
        })
    }

    /// Queues the result of the next unscripted call.
    pub fn push(&self, result: Scripted) {
        self.script.lock().push_back(result);
    }

    pub fn fail_transient(&self, times: usize) {
        for n in 0..times {
            self.push(Err(ExecutorError::transient(format!("upstream 503 #{}", n + 1))));
        }
    }

    /// Resource keys of every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> std::result::Result<Value, ExecutorError> {
        self.calls.lock().push(task.resource_key().to_string());

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "resource_key": task.resource_key(), "found": true })))
    }
}

/// Sink that keeps every stored result in memory.
#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<TaskResult>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.results.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.results.lock().len()
    }

    /// Makes every subsequent `store` fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn store(&self, result: &TaskResult) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::sink("mock sink failure"));
        }
        self.results.lock().push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_core::{TaskEnvelope, TaskKind};

    fn task(key: &str) -> Task {
        let envelope = TaskEnvelope::new(TaskKind::LeakCheck, key, &json!({})).unwrap();
        Task::decode(&envelope.to_bytes().unwrap(), TaskKind::LeakCheck, 0).unwrap()
    }

    #[tokio::test]
    async fn test_script_then_default_success() {
        let executor = ScriptedExecutor::new();
        executor.push(Err(ExecutorError::permanent("bad input")));

        assert!(executor.execute(&task("a@b.com")).await.is_err());
        assert!(executor.execute(&task("a@b.com")).await.is_ok());
        assert_eq!(executor.calls(), vec!["a@b.com", "a@b.com"]);
    }

    #[tokio::test]
    async fn test_recording_sink_failure_mode() {
        let sink = RecordingSink::new();
        let result = TaskResult::new(&task("a@b.com"), json!({}));

        sink.store(&result).await.unwrap();
        sink.set_failing(true);
        assert!(sink.store(&result).await.is_err());
        assert_eq!(sink.count(), 1);
    }
}
