use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WORKFLOW_RUN_REQUESTED: &str = "workflow.run.requested";
pub const AGENT_RUN_REQUESTED: &str = "agent.run.requested";

/// Terminal (or in-flight) status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = crate::error::LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            "paused" => Ok(WorkflowStatus::Paused),
            other => Err(crate::error::LoomError::Validation(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Phase of an execution, tracked by the ExecutionContext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Initialization,
    InputProcessing,
    ToolExecution,
    AgentExecution,
    OutputProcessing,
    Completion,
    ErrorHandling,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Initialization => "initialization",
            ExecutionPhase::InputProcessing => "input_processing",
            ExecutionPhase::ToolExecution => "tool_execution",
            ExecutionPhase::AgentExecution => "agent_execution",
            ExecutionPhase::OutputProcessing => "output_processing",
            ExecutionPhase::Completion => "completion",
            ExecutionPhase::ErrorHandling => "error_handling",
        }
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A "run requested" event as it travels over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunRequest {
    #[serde(rename = "workflow.run.requested")]
    Workflow {
        run_id: String,
        workflow_id: String,
        #[serde(default)]
        payload: Value,
    },

    #[serde(rename = "agent.run.requested")]
    Agent {
        run_id: String,
        agent_id: String,
        #[serde(default)]
        payload: Value,
    },
}

impl RunRequest {
    pub fn workflow(run_id: impl Into<String>, workflow_id: impl Into<String>, payload: Value) -> Self {
        RunRequest::Workflow {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            payload,
        }
    }

    pub fn agent(run_id: impl Into<String>, agent_id: impl Into<String>, payload: Value) -> Self {
        RunRequest::Agent {
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            payload,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            RunRequest::Workflow { run_id, .. } | RunRequest::Agent { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RunRequest::Workflow { .. } => WORKFLOW_RUN_REQUESTED,
            RunRequest::Agent { .. } => AGENT_RUN_REQUESTED,
        }
    }

    /// Encode as the JSON wire event.
    pub fn to_event(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_event(event: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(event)?)
    }
}

/// Events emitted by the engines onto the EventBus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Workflow run started.
    RunStarted {
        execution_id: String,
        workflow_id: String,
    },
    /// A batch of steps was dispatched.
    BatchStarted {
        execution_id: String,
        index: usize,
        steps: Vec<String>,
    },
    /// A step finished successfully.
    StepCompleted {
        execution_id: String,
        step_id: String,
        duration_ms: u64,
    },
    /// A step failed (after exhausting retries).
    StepFailed {
        execution_id: String,
        step_id: String,
        error: String,
    },
    /// Workflow run reached a terminal status.
    RunFinished {
        execution_id: String,
        workflow_id: String,
        status: WorkflowStatus,
        duration_ms: u64,
        error: Option<String>,
    },
    /// State machine fired a transition.
    TransitionFired {
        machine_id: String,
        transition_id: String,
        from: String,
        to: String,
        event: String,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::RunStarted { .. } => "run_started",
            EngineEvent::BatchStarted { .. } => "batch_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::RunFinished { .. } => "run_finished",
            EngineEvent::TransitionFired { .. } => "transition_fired",
        }
    }
}
