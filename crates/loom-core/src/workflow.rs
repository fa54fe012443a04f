use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::types::WorkflowStatus;

/// Kind of work a step performs. Dispatch on this is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    Tool,
    Condition,
    Parallel,
    HumanInput,
    Delay,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Agent => "agent",
            StepType::Tool => "tool",
            StepType::Condition => "condition",
            StepType::Parallel => "parallel",
            StepType::HumanInput => "human_input",
            StepType::Delay => "delay",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single node in a workflow's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub step_type: StepType,
    /// Interpreted according to `step_type`.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Ids of steps that must finish first. Order matters: the last one feeds this step's input.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Per-attempt timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    /// Gate expression; a false result skips the step.
    #[serde(default)]
    pub condition: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            config: Map::new(),
            dependencies: Vec::new(),
            timeout: None,
            retry_count: 0,
            condition: None,
        }
    }

    pub fn agent(id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self::new(id, StepType::Agent).with_config("agent_name", Value::String(agent_name.into()))
    }

    pub fn tool(id: impl Into<String>, tool_name: impl Into<String>, params: Value) -> Self {
        Self::new(id, StepType::Tool)
            .with_config("tool_name", Value::String(tool_name.into()))
            .with_config("tool_params", params)
    }

    pub fn condition(
        id: impl Into<String>,
        expression: impl Into<String>,
        true_value: Value,
        false_value: Value,
    ) -> Self {
        Self::new(id, StepType::Condition)
            .with_config("condition", Value::String(expression.into()))
            .with_config("true_value", true_value)
            .with_config("false_value", false_value)
    }

    pub fn delay_ms(id: impl Into<String>, milliseconds: u64) -> Self {
        Self::new(id, StepType::Delay).with_config("milliseconds", json!(milliseconds))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    /// String-valued config entry.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Declarative workflow: an ordered list of steps plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Overall run timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            metadata: Map::new(),
            timeout: None,
        }
    }

    /// A one-step workflow that runs a single agent on the run payload.
    pub fn single_agent(agent_id: &str) -> Self {
        Self::new(agent_id, format!("agent:{agent_id}")).with_step(WorkflowStep::agent("agent", agent_id))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Terminal outcome of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow_id: String,
    pub execution_id: String,
    pub status: WorkflowStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub step_results: Value,
}

impl WorkflowExecutionResult {
    /// A FAILED result for a run that never started (e.g. unknown definition).
    pub fn rejected(workflow_id: impl Into<String>, execution_id: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            status: WorkflowStatus::Failed,
            start_time: Some(now),
            end_time: Some(now),
            output: Value::Null,
            error: Some(error.into()),
            step_results: json!({}),
        }
    }

    /// Duration in seconds, when both ends are known.
    pub fn duration(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            }
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Stable JSON shape used by sinks and the CLI.
    pub fn to_json(&self) -> Value {
        json!({
            "workflow_id": self.workflow_id,
            "execution_id": self.execution_id,
            "status": self.status.as_str(),
            "start_time": self.start_time.map(|t| t.to_rfc3339()),
            "end_time": self.end_time.map(|t| t.to_rfc3339()),
            "duration": self.duration(),
            "output": self.output,
            "error": self.error,
            "step_results": self.step_results,
        })
    }

    pub fn from_json(value: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
