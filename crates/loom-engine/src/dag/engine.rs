use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use loom_core::config::EngineConfig;
use loom_core::context::ExecutionContext;
use loom_core::error::{LoomError, Result};
use loom_core::event::EventBus;
use loom_core::traits::HumanInputHandler;
use loom_core::types::{EngineEvent, ExecutionPhase, WorkflowStatus};
use loom_core::workflow::{StepType, WorkflowDefinition, WorkflowExecutionResult, WorkflowStep};

use super::plan::ExecutionPlan;
use crate::expr::Condition;
use crate::registry::ExecutorRegistry;

/// Names a step condition may reference.
pub const STEP_CONDITION_ROOTS: &[&str] = &["input", "shared", "context"];

/// One branch of a PARALLEL step.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Branch {
    Agent {
        agent_name: String,
    },
    Tool {
        tool_name: String,
        #[serde(default)]
        tool_params: Map<String, Value>,
    },
}

/// Per-step data compiled at construction.
#[derive(Debug, Default)]
struct Compiled {
    gate: Option<Condition>,
    condition: Option<Condition>,
    branches: Vec<Branch>,
    delay: Option<Duration>,
}

/// Aggregate statistics over an engine's execution history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub success_rate: f64,
    pub average_duration: f64,
}

/// Executes a validated workflow definition batch by batch.
///
/// Steps inside a batch run concurrently on the caller's task; batches run
/// strictly in topological order. Cancellation and pause are cooperative
/// and only observed between batches.
pub struct DagWorkflowEngine {
    definition: WorkflowDefinition,
    plan: ExecutionPlan,
    steps: HashMap<String, WorkflowStep>,
    compiled: HashMap<String, Compiled>,
    agents: Arc<ExecutorRegistry>,
    tools: Arc<ExecutorRegistry>,
    human_input: Option<Arc<dyn HumanInputHandler>>,
    event_bus: Option<Arc<EventBus>>,
    config: EngineConfig,
    status: watch::Sender<WorkflowStatus>,
    history: Mutex<Vec<WorkflowExecutionResult>>,
}

impl DagWorkflowEngine {
    /// Validate `definition` and compute its batches. Fails fast with a
    /// validation error; no run can start from an invalid definition.
    pub fn new(
        definition: WorkflowDefinition,
        agents: Arc<ExecutorRegistry>,
        tools: Arc<ExecutorRegistry>,
    ) -> Result<Self> {
        let plan = ExecutionPlan::build(&definition)?;
        let mut compiled = HashMap::new();
        for step in &definition.steps {
            compiled.insert(step.id.clone(), compile_step(step)?);
        }
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        let (status, _) = watch::channel(WorkflowStatus::Pending);

        Ok(Self {
            definition,
            plan,
            steps,
            compiled,
            agents,
            tools,
            human_input: None,
            event_bus: None,
            config: EngineConfig::default(),
            status,
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
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

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn execution_batches(&self) -> &[Vec<String>] {
        self.plan.batches()
    }

    /// A fresh context tagged with this workflow's id.
    pub fn create_execution_context(&self) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new().with_workflow_id(&self.definition.id))
    }

    // -- Control -----------------------------------------------------------

    pub fn status(&self) -> WorkflowStatus {
        *self.status.borrow()
    }

    /// Request cancellation; takes effect before the next batch starts.
    pub fn cancel(&self) {
        info!(workflow_id = %self.definition.id, "Workflow cancellation requested");
        self.status.send_replace(WorkflowStatus::Cancelled);
    }

    /// Hold the run before its next batch until resumed or cancelled.
    pub fn pause(&self) -> bool {
        self.status.send_if_modified(|s| {
            if *s == WorkflowStatus::Running {
                *s = WorkflowStatus::Paused;
                true
            } else {
                false
            }
        })
    }

    pub fn resume(&self) -> bool {
        self.status.send_if_modified(|s| {
            if *s == WorkflowStatus::Paused {
                *s = WorkflowStatus::Running;
                true
            } else {
                false
            }
        })
    }

    // -- History -----------------------------------------------------------

    pub fn history(&self) -> Vec<WorkflowExecutionResult> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn summary(&self) -> ExecutionSummary {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let total = history.len();
        let successful = history.iter().filter(|r| r.is_success()).count();
        let durations: Vec<f64> = history.iter().filter_map(|r| r.duration()).collect();
        ExecutionSummary {
            total_executions: total,
            successful_executions: successful,
            failed_executions: total - successful,
            success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
            average_duration: if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            },
        }
    }

    // -- Execution ---------------------------------------------------------

    /// Run the workflow to a terminal result. Step-level failures are
    /// reported through the result, never as an `Err`.
    pub async fn execute(&self, input: Value, context: Option<Arc<ExecutionContext>>) -> WorkflowExecutionResult {
        let ctx = context.unwrap_or_else(|| self.create_execution_context());
        let execution_id = ctx.execution_id();
        let workflow_id = self.definition.id.clone();
        let start_time = Utc::now();
        let started = Instant::now();

        self.status.send_replace(WorkflowStatus::Running);
        info!(
            workflow_id = %workflow_id,
            execution_id = %execution_id,
            batches = self.plan.batches().len(),
            "Workflow started"
        );
        self.publish(EngineEvent::RunStarted {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.clone(),
        });

        ctx.start_execution();
        ctx.set_shared("workflow_input", input.clone());
        ctx.advance_phase(ExecutionPhase::AgentExecution);

        let outcome = match self.definition.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.run_batches(input, &ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(LoomError::WorkflowTimeout {
                        workflow: workflow_id.clone(),
                        timeout_secs: secs,
                    })
                }),
            None => self.run_batches(input, &ctx).await,
        };

        let (status, output, error) = match outcome {
            Ok(output) => {
                ctx.advance_phase(ExecutionPhase::OutputProcessing);
                ctx.end_execution();
                (WorkflowStatus::Completed, output, None)
            }
            Err(LoomError::Cancelled) => {
                let message = LoomError::Cancelled.to_string();
                ctx.cancel_execution(&message);
                (WorkflowStatus::Cancelled, Value::Null, Some(message))
            }
            Err(e) => {
                let message = e.to_string();
                ctx.add_error("workflow_execution_error", message.clone(), Map::new());
                ctx.advance_phase(ExecutionPhase::ErrorHandling);
                (WorkflowStatus::Failed, Value::Null, Some(message))
            }
        };
        self.status.send_replace(status);

        let result = WorkflowExecutionResult {
            workflow_id: workflow_id.clone(),
            execution_id: execution_id.clone(),
            status,
            start_time: Some(start_time),
            end_time: Some(Utc::now()),
            output,
            error: error.clone(),
            step_results: step_results(&ctx),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &error {
            None => info!(workflow_id = %workflow_id, execution_id = %execution_id, duration_ms, "Workflow completed"),
            Some(e) => error!(
                workflow_id = %workflow_id,
                execution_id = %execution_id,
                status = %status,
                error = %e,
                "Workflow did not complete"
            ),
        }
        self.publish(EngineEvent::RunFinished {
            execution_id,
            workflow_id,
            status,
            duration_ms,
            error,
        });

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        result
    }

    async fn run_batches(&self, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut last_output = input.clone();

        for (index, batch) in self.plan.batches().iter().enumerate() {
            self.checkpoint().await?;

            debug!(batch = index, steps = ?batch, "Dispatching batch");
            self.publish(EngineEvent::BatchStarted {
                execution_id: ctx.execution_id(),
                index,
                steps: batch.clone(),
            });

            let runs = batch.iter().filter_map(|id| self.steps.get(id)).map(|step| {
                let step_input = derive_input(step, &input, &outputs);
                self.run_step(step, step_input, ctx)
            });
            let results = join_all(runs).await;

            // The first failure in batch order aborts the run; sibling
            // outputs from this batch are discarded.
            let mut completed = Vec::with_capacity(batch.len());
            for (id, result) in batch.iter().zip(results) {
                completed.push((id, result?));
            }

            for (id, output) in completed {
                let step = &self.steps[id];
                let mut meta = Map::new();
                meta.insert("step_id".into(), json!(id));
                meta.insert("step_type".into(), json!(step.step_type.as_str()));
                meta.insert("batch".into(), json!(index));
                let label = if step.name.is_empty() { id.clone() } else { step.name.clone() };
                ctx.add_intermediate_result(label, output.clone(), meta);
                ctx.record_step_output(id.clone(), output.clone());
                outputs.insert(id.clone(), output.clone());
                last_output = output;
            }
        }

        Ok(last_output)
    }

    /// Cancellation and pause checkpoint between batches.
    async fn checkpoint(&self) -> Result<()> {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                WorkflowStatus::Cancelled => return Err(LoomError::Cancelled),
                WorkflowStatus::Paused => {
                    info!(workflow_id = %self.definition.id, "Workflow paused");
                    if rx.changed().await.is_err() {
                        return Err(LoomError::Cancelled);
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    async fn run_step(&self, step: &WorkflowStep, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let started = Instant::now();
        let result = self.run_step_attempts(step, input, ctx).await;
        let elapsed = started.elapsed();
        ctx.record_step_timing(step.id.clone(), elapsed);

        match result {
            Ok(output) => {
                debug!(step_id = %step.id, elapsed_ms = elapsed.as_millis() as u64, "Step complete");
                self.publish(EngineEvent::StepCompleted {
                    execution_id: ctx.execution_id(),
                    step_id: step.id.clone(),
                    duration_ms: elapsed.as_millis() as u64,
                });
                Ok(output)
            }
            Err(e) => {
                let e = match e {
                    e @ (LoomError::StepExecution { .. } | LoomError::StepTimeout { .. }) => e,
                    other => LoomError::step(&step.id, other),
                };
                let mut details = Map::new();
                details.insert("step_id".into(), json!(step.id));
                details.insert("step_type".into(), json!(step.step_type.as_str()));
                details.insert("kind".into(), json!(e.kind()));
                ctx.add_error("step_execution_error", format!("Step {}: {}", step.id, e), details);
                error!(step_id = %step.id, error = %e, "Step failed");
                self.publish(EngineEvent::StepFailed {
                    execution_id: ctx.execution_id(),
                    step_id: step.id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_step_attempts(&self, step: &WorkflowStep, input: Value, ctx: &ExecutionContext) -> Result<Value> {
        let compiled = self.compiled(&step.id)?;

        if let Some(gate) = &compiled.gate {
            if !gate.evaluate(&condition_scope(&input, ctx))? {
                debug!(step_id = %step.id, condition = gate.source(), "Step skipped");
                ctx.add_warning(format!("Step {} skipped: condition `{}` is false", step.id, gate.source()));
                return Ok(input);
            }
        }

        let timeout = step.timeout.or(self.config.default_step_timeout_secs);
        let attempts = step.retry_count + 1;
        let mut attempt = 0;
        loop {
            let dispatch = self.dispatch(step, compiled, input.clone(), ctx);
            let result = match timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), dispatch)
                    .await
                    .unwrap_or_else(|_| {
                        Err(LoomError::StepTimeout {
                            step: step.id.clone(),
                            timeout_secs: secs,
                        })
                    }),
                None => dispatch.await,
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if attempt + 1 < attempts && is_retryable(&e) => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        step_id = %step.id,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying step"
                    );
                    ctx.add_warning(format!("Step {} attempt {} failed: {}", step.id, attempt + 1, e));
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exhaustive dispatch on the step type.
    async fn dispatch(
        &self,
        step: &WorkflowStep,
        compiled: &Compiled,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        match step.step_type {
            StepType::Agent => {
                let name = required_str(step, "agent_name")?;
                self.invoke_agent(name, &step.config, input, ctx).await
            }
            StepType::Tool => {
                let name = required_str(step, "tool_name")?;
                let params = step
                    .config
                    .get("tool_params")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.invoke_tool(name, &params, input, ctx).await
            }
            StepType::Condition => {
                let passed = match &compiled.condition {
                    Some(cond) => match cond.evaluate(&condition_scope(&input, ctx)) {
                        Ok(passed) => passed,
                        Err(e) => {
                            ctx.add_warning(format!("Step {} condition evaluated as false: {}", step.id, e));
                            false
                        }
                    },
                    None => false,
                };
                let key = if passed { "true_value" } else { "false_value" };
                debug!(step_id = %step.id, passed, "Condition evaluated");
                Ok(step.config.get(key).cloned().unwrap_or(input))
            }
            StepType::Parallel => {
                let runs = compiled.branches.iter().map(|branch| {
                    let input = input.clone();
                    async move {
                        match branch {
                            Branch::Agent { agent_name } => {
                                self.invoke_agent(agent_name, &step.config, input, ctx).await
                            }
                            Branch::Tool { tool_name, tool_params } => {
                                self.invoke_tool(tool_name, tool_params, input, ctx).await
                            }
                        }
                    }
                });
                let outputs = join_all(runs).await.into_iter().collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(outputs))
            }
            StepType::HumanInput => {
                let handler = self.human_input.as_ref().ok_or_else(|| {
                    LoomError::DependencyResolution("no human input handler configured".into())
                })?;
                handler.request_input(step, input, ctx).await
            }
            StepType::Delay => {
                tokio::time::sleep(compiled.delay.unwrap_or_default()).await;
                Ok(input)
            }
        }
    }

    async fn invoke_agent(
        &self,
        name: &str,
        params: &Map<String, Value>,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let output = self.agents.execute(name, params, input, ctx).await?;
        ctx.record_agent_execution(name, output.clone());
        Ok(output)
    }

    async fn invoke_tool(
        &self,
        name: &str,
        params: &Map<String, Value>,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let output = self.tools.execute(name, params, input, ctx).await?;
        ctx.record_tool_execution(name);
        Ok(output)
    }

    fn compiled(&self, step_id: &str) -> Result<&Compiled> {
        self.compiled
            .get(step_id)
            .ok_or_else(|| LoomError::step(step_id, "step was not compiled"))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .config
            .retry_initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.config.retry_max_backoff_ms);
        // Jitter: 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

fn compile_step(step: &WorkflowStep) -> Result<Compiled> {
    let invalid = |msg: String| LoomError::Validation(format!("Step {}: {}", step.id, msg));
    let mut compiled = Compiled::default();

    if let Some(src) = &step.condition {
        compiled.gate = Some(Condition::compile(src, STEP_CONDITION_ROOTS).map_err(|e| invalid(e.to_string()))?);
    }

    match step.step_type {
        StepType::Agent => {
            required_str(step, "agent_name").map_err(|e| invalid(e.to_string()))?;
        }
        StepType::Tool => {
            required_str(step, "tool_name").map_err(|e| invalid(e.to_string()))?;
            if let Some(params) = step.config.get("tool_params") {
                if !params.is_object() {
                    return Err(invalid("tool_params must be an object".into()));
                }
            }
        }
        StepType::Condition => {
            let src = required_str(step, "condition").map_err(|e| invalid(e.to_string()))?;
            compiled.condition =
                Some(Condition::compile(src, STEP_CONDITION_ROOTS).map_err(|e| invalid(e.to_string()))?);
        }
        StepType::Parallel => {
            let branches = step
                .config
                .get("branches")
                .cloned()
                .ok_or_else(|| invalid("missing config `branches`".into()))?;
            compiled.branches = serde_json::from_value(branches)
                .map_err(|e| invalid(format!("invalid branches: {e}")))?;
            if compiled.branches.is_empty() {
                return Err(invalid("parallel step needs at least one branch".into()));
            }
        }
        StepType::HumanInput => {}
        StepType::Delay => {
            let delay = if let Some(ms) = step.config.get("milliseconds") {
                ms.as_u64().map(Duration::from_millis)
            } else if let Some(secs) = step.config.get("seconds") {
                secs.as_f64().filter(|s| *s >= 0.0).map(Duration::from_secs_f64)
            } else {
                None
            };
            compiled.delay = Some(delay.ok_or_else(|| {
                invalid("delay needs a non-negative `seconds` or `milliseconds`".into())
            })?);
        }
    }
    Ok(compiled)
}

fn required_str<'a>(step: &'a WorkflowStep, key: &str) -> Result<&'a str> {
    step.config_str(key)
        .ok_or_else(|| LoomError::Validation(format!("missing config `{key}`")))
}

/// No dependencies: the workflow input. Otherwise: the output of the
/// last-listed dependency.
fn derive_input(step: &WorkflowStep, input: &Value, outputs: &HashMap<String, Value>) -> Value {
    match step.dependencies.last() {
        None => input.clone(),
        Some(dep) => outputs.get(dep).cloned().unwrap_or_else(|| input.clone()),
    }
}

fn condition_scope(input: &Value, ctx: &ExecutionContext) -> Value {
    json!({
        "input": input,
        "shared": ctx.shared_data(),
        "context": {
            "execution_id": ctx.execution_id(),
            "workflow_id": ctx.workflow_id(),
            "step_count": ctx.step_count(),
            "phase": ctx.phase().as_str(),
        },
    })
}

fn is_retryable(e: &LoomError) -> bool {
    !matches!(
        e,
        LoomError::Validation(_)
            | LoomError::DependencyResolution(_)
            | LoomError::Expression(_)
            | LoomError::Cancelled
    )
}

fn step_results(ctx: &ExecutionContext) -> Value {
    let record = ctx.snapshot();
    json!({
        "intermediate_results": record.intermediate_results,
        "executed_tools": record.executed_tools,
        "executed_agents": record.executed_agents,
        "agent_outputs": record.agent_outputs,
        "step_outputs": record.step_outputs,
        "step_timings": record.step_timings,
    })
}
