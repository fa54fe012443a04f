use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use loom_core::config::EngineConfig;
use loom_core::context::ExecutionContext;
use loom_core::error::{LoomError, Result};
use loom_core::event::EventBus;
use loom_core::id::IdGenerator;
use loom_core::traits::{DefinitionStore, HumanInputHandler, RunHandler, RunResultSink};
use loom_core::workflow::{WorkflowDefinition, WorkflowExecutionResult};

use crate::dag::DagWorkflowEngine;
use crate::registry::ExecutorRegistry;

/// Resolves run requests into engine executions and reports every terminal
/// result to the configured sink.
pub struct Orchestrator {
    definitions: Arc<dyn DefinitionStore>,
    sink: Option<Arc<dyn RunResultSink>>,
    agents: Arc<ExecutorRegistry>,
    tools: Arc<ExecutorRegistry>,
    ids: Arc<IdGenerator>,
    event_bus: Option<Arc<EventBus>>,
    human_input: Option<Arc<dyn HumanInputHandler>>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        agents: Arc<ExecutorRegistry>,
        tools: Arc<ExecutorRegistry>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            definitions,
            sink: None,
            agents,
            tools,
            ids,
            event_bus: None,
            human_input: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_human_input(mut self, handler: Arc<dyn HumanInputHandler>) -> Self {
        self.human_input = Some(handler);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Load `workflow_id` and run it with `payload` as input.
    ///
    /// Step failures come back as a FAILED result. `Err` is reserved for
    /// runs that could not start; those are still reported to the sink.
    pub async fn execute_workflow_run(
        &self,
        run_id: &str,
        workflow_id: &str,
        payload: Value,
    ) -> Result<WorkflowExecutionResult> {
        let definition = match self.definitions.load_workflow_definition(workflow_id).await {
            Ok(Some(def)) => def,
            Ok(None) => {
                let err = LoomError::DefinitionNotFound(workflow_id.to_string());
                return Err(self.reject(run_id, workflow_id, err).await);
            }
            Err(e) => return Err(self.reject(run_id, workflow_id, e).await),
        };
        self.execute_definition(run_id, definition, payload).await
    }

    /// Run a single registered agent as a one-step workflow.
    pub async fn execute_agent_run(
        &self,
        run_id: &str,
        agent_id: &str,
        payload: Value,
    ) -> Result<WorkflowExecutionResult> {
        if let Err(e) = self.agents.resolve(agent_id) {
            return Err(self.reject(run_id, agent_id, e).await);
        }
        let definition = WorkflowDefinition::single_agent(agent_id);
        self.execute_definition(run_id, definition, payload).await
    }

    async fn execute_definition(
        &self,
        run_id: &str,
        definition: WorkflowDefinition,
        payload: Value,
    ) -> Result<WorkflowExecutionResult> {
        let workflow_id = definition.id.clone();
        let mut engine = match DagWorkflowEngine::new(definition, self.agents.clone(), self.tools.clone()) {
            Ok(engine) => engine.with_config(self.config.clone()),
            Err(e) => return Err(self.reject(run_id, &workflow_id, e).await),
        };
        if let Some(bus) = &self.event_bus {
            engine = engine.with_event_bus(bus.clone());
        }
        if let Some(handler) = &self.human_input {
            engine = engine.with_human_input(handler.clone());
        }

        let ctx = Arc::new(
            ExecutionContext::with_execution_id(self.ids.generate())
                .with_workflow_id(&workflow_id)
                .with_metadata("run_id", json!(run_id)),
        );
        info!(run_id, workflow_id = %workflow_id, execution_id = %ctx.execution_id(), "Executing run");

        let result = engine.execute(payload, Some(ctx)).await;
        self.save(run_id, &result).await;
        Ok(result)
    }

    /// Record a FAILED result for a run that never started.
    async fn reject(&self, run_id: &str, workflow_id: &str, err: LoomError) -> LoomError {
        warn!(run_id, workflow_id, error = %err, "Run rejected");
        let result = WorkflowExecutionResult::rejected(workflow_id, self.ids.generate(), err.to_string());
        self.save(run_id, &result).await;
        err
    }

    async fn save(&self, run_id: &str, result: &WorkflowExecutionResult) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.save_run_result(run_id, result).await {
            error!(run_id, error = %e, "Failed to save run result");
        }
    }
}

impl RunHandler for Orchestrator {
    fn run_workflow(&self, run_id: &str, workflow_id: &str, payload: Value) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.to_string();
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.execute_workflow_run(&run_id, &workflow_id, payload).await?;
            Ok(())
        })
    }

    fn run_agent(&self, run_id: &str, agent_id: &str, payload: Value) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.to_string();
        let agent_id = agent_id.to_string();
        Box::pin(async move {
            self.execute_agent_run(&run_id, &agent_id, payload).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FnExecutor;
    use loom_core::types::WorkflowStatus;
    use loom_core::workflow::WorkflowStep;
    use loom_store::MemoryDefinitionStore;
    use loom_test_utils::{FailingSink, MemoryResultSink};

    fn agents() -> Arc<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::agents();
        registry.register(FnExecutor::new("greeter", |_, input, _| {
            Ok(json!({ "greeting": format!("hello {}", input["name"].as_str().unwrap_or("?")) }))
        }));
        Arc::new(registry)
    }

    fn orchestrator(store: MemoryDefinitionStore, sink: Arc<MemoryResultSink>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(store),
            agents(),
            Arc::new(ExecutorRegistry::with_builtin_tools()),
            Arc::new(IdGenerator::new("EXEC")),
        )
        .with_sink(sink)
    }

    #[tokio::test]
    async fn workflow_run_reports_result_once() {
        let store = MemoryDefinitionStore::new();
        store.insert(
            WorkflowDefinition::new("greet", "Greet")
                .with_step(WorkflowStep::agent("hello", "greeter"))
                .with_step(WorkflowStep::tool("echo", "echo", json!({})).with_dependencies(["hello"])),
        );
        let sink = Arc::new(MemoryResultSink::new());
        let orch = orchestrator(store, sink.clone());

        let result = orch
            .execute_workflow_run("run-1", "greet", json!({"name": "ada"}))
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.output, json!({"greeting": "hello ada"}));
        assert!(result.execution_id.starts_with("EXEC-"));

        let saved = sink.results();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "run-1");
        assert_eq!(saved[0].1.execution_id, result.execution_id);
    }

    #[tokio::test]
    async fn missing_definition_is_rejected_and_saved() {
        let sink = Arc::new(MemoryResultSink::new());
        let orch = orchestrator(MemoryDefinitionStore::new(), sink.clone());

        let err = orch.run_workflow("run-2", "nope", json!({})).await.unwrap_err();
        assert!(matches!(err, LoomError::DefinitionNotFound(ref id) if id == "nope"));

        let saved = sink.results();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn agent_run_uses_single_step_workflow() {
        let sink = Arc::new(MemoryResultSink::new());
        let orch = orchestrator(MemoryDefinitionStore::new(), sink.clone());

        orch.run_agent("run-3", "greeter", json!({"name": "bob"})).await.unwrap();
        let saved = sink.results();
        assert_eq!(saved[0].1.output, json!({"greeting": "hello bob"}));

        let err = orch.run_agent("run-4", "ghost", json!({})).await.unwrap_err();
        assert!(matches!(err, LoomError::DependencyResolution(_)));
        assert_eq!(sink.results().len(), 2);
    }

    #[tokio::test]
    async fn sink_failures_do_not_fail_the_run() {
        let store = MemoryDefinitionStore::new();
        store.insert(WorkflowDefinition::single_agent("greeter"));
        let orch = Orchestrator::new(
            Arc::new(store),
            agents(),
            Arc::new(ExecutorRegistry::tools()),
            Arc::new(IdGenerator::new("EXEC")),
        )
        .with_sink(Arc::new(FailingSink));

        let result = orch.execute_workflow_run("run-5", "greeter", json!({"name": "x"})).await.unwrap();
        assert!(result.is_success());
    }
}
