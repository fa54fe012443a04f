use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::workflow::{WorkflowDefinition, WorkflowExecutionResult, WorkflowStep};

/// Step executor: an agent or a tool the engine can dispatch to.
///
/// Executors may be invoked more than once for the same logical request
/// (at-least-once dispatch) and must tolerate that.
pub trait StepExecutor: Send + Sync + 'static {
    /// Logical name used for registry lookups.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Run with step-specific parameters, the step input, and the shared run context.
    fn execute<'a>(
        &'a self,
        params: &'a Map<String, Value>,
        input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>>;

    /// Timeout in seconds enforced by the registry, if any.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Source of answers for HUMAN_INPUT steps.
pub trait HumanInputHandler: Send + Sync + 'static {
    fn request_input<'a>(
        &'a self,
        step: &'a WorkflowStep,
        input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// Definition store: resolves workflow definitions by id.
pub trait DefinitionStore: Send + Sync + 'static {
    /// `Ok(None)` when no definition has this id.
    fn load_workflow_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;
}

/// Run-result sink: receives each terminal result exactly once per execution.
pub trait RunResultSink: Send + Sync + 'static {
    fn save_run_result<'a>(
        &'a self,
        run_id: &'a str,
        result: &'a WorkflowExecutionResult,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Executes run requests. Called by the worker for consumed events and by
/// the scheduler when it has to run a request in-process.
pub trait RunHandler: Send + Sync + 'static {
    fn run_workflow(&self, run_id: &str, workflow_id: &str, payload: Value) -> BoxFuture<'_, Result<()>>;

    fn run_agent(&self, run_id: &str, agent_id: &str, payload: Value) -> BoxFuture<'_, Result<()>>;
}

/// Topic-based publish/subscribe transport.
pub trait MessageBroker: Send + Sync + 'static {
    /// Backend name for logs (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Publish one event to a topic.
    fn send(&self, topic: &str, event: Value) -> BoxFuture<'_, Result<()>>;

    /// Open a consumer on a topic.
    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<Box<dyn Subscription>>>;
}

/// A consumer handle for one topic.
pub trait Subscription: Send + 'static {
    fn topic(&self) -> &str;

    /// Wait for the next event. `Ok(None)` means the topic was closed.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Value>>>;
}
