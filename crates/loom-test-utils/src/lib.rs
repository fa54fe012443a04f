//! Test doubles for the Loom ports.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use loom_core::error::{LoomError, Result};
use loom_core::traits::{MessageBroker, RunHandler, RunResultSink, Subscription};
use loom_core::workflow::WorkflowExecutionResult;

// ── MemoryResultSink ────────────────────────────────────────────

/// Keeps every saved result in arrival order.
#[derive(Default)]
pub struct MemoryResultSink {
    results: Mutex<Vec<(String, WorkflowExecutionResult)>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<(String, WorkflowExecutionResult)> {
        self.results.lock().unwrap().clone()
    }
}

impl RunResultSink for MemoryResultSink {
    fn save_run_result<'a>(
        &'a self,
        run_id: &'a str,
        result: &'a WorkflowExecutionResult,
    ) -> BoxFuture<'a, Result<()>> {
        self.results
            .lock()
            .unwrap()
            .push((run_id.to_string(), result.clone()));
        Box::pin(async { Ok(()) })
    }
}

// ── FailingSink ─────────────────────────────────────────────────

/// Sink whose every save fails.
pub struct FailingSink;

impl RunResultSink for FailingSink {
    fn save_run_result<'a>(
        &'a self,
        _run_id: &'a str,
        _result: &'a WorkflowExecutionResult,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(LoomError::Database("sink offline".into())) })
    }
}

// ── RecordingRunHandler ─────────────────────────────────────────

/// One call received by a [`RecordingRunHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandledRun {
    Workflow {
        run_id: String,
        workflow_id: String,
        payload: Value,
    },
    Agent {
        run_id: String,
        agent_id: String,
        payload: Value,
    },
}

impl HandledRun {
    pub fn run_id(&self) -> &str {
        match self {
            HandledRun::Workflow { run_id, .. } | HandledRun::Agent { run_id, .. } => run_id,
        }
    }
}

/// Records every request. Runs whose id is in `fail_on` return an error
/// after being recorded; runs in `panic_on` panic after being recorded.
#[derive(Default)]
pub struct RecordingRunHandler {
    calls: Mutex<Vec<HandledRun>>,
    fail_on: Vec<String>,
    panic_on: Vec<String>,
}

impl RecordingRunHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fail_on: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn panicking_on<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            panic_on: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HandledRun> {
        self.calls.lock().unwrap().clone()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.run_id().to_string()).collect()
    }

    /// Poll until `n` calls were recorded or `timeout` elapses.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.calls.lock().unwrap().len() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls.lock().unwrap().len() >= n
    }

    fn record(&self, call: HandledRun) -> Result<()> {
        let fail = self.fail_on.iter().any(|id| id == call.run_id());
        let panic = self.panic_on.iter().any(|id| id == call.run_id());
        let run_id = call.run_id().to_string();
        self.calls.lock().unwrap().push(call);
        if panic {
            panic!("handler configured to panic on {run_id}");
        }
        if fail {
            return Err(LoomError::step(run_id, "handler configured to fail"));
        }
        Ok(())
    }
}

impl RunHandler for RecordingRunHandler {
    fn run_workflow(&self, run_id: &str, workflow_id: &str, payload: Value) -> BoxFuture<'_, Result<()>> {
        let outcome = self.record(HandledRun::Workflow {
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            payload,
        });
        Box::pin(async move { outcome })
    }

    fn run_agent(&self, run_id: &str, agent_id: &str, payload: Value) -> BoxFuture<'_, Result<()>> {
        let outcome = self.record(HandledRun::Agent {
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            payload,
        });
        Box::pin(async move { outcome })
    }
}

// ── FailingBroker ───────────────────────────────────────────────

/// Broker that is never reachable.
pub struct FailingBroker;

impl MessageBroker for FailingBroker {
    fn name(&self) -> &str {
        "failing"
    }

    fn send(&self, topic: &str, _event: Value) -> BoxFuture<'_, Result<()>> {
        let err = LoomError::BrokerUnavailable(format!("cannot publish to {topic}"));
        Box::pin(async move { Err(err) })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<Box<dyn Subscription>>> {
        let err = LoomError::BrokerUnavailable(format!("cannot subscribe to {topic}"));
        Box::pin(async move { Err(err) })
    }
}
