use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoomError {
    // Definition errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Expression error: {0}")]
    Expression(String),

    // Execution errors
    #[error("Dependency resolution failed: {0}")]
    DependencyResolution(String),

    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Workflow timeout after {timeout_secs}s: {workflow}")]
    WorkflowTimeout { workflow: String, timeout_secs: u64 },

    #[error("Workflow execution was cancelled")]
    Cancelled,

    #[error("State machine error: {0}")]
    StateMachine(String),

    // Messaging errors
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoomError {
    /// Short machine-readable kind, used as the error `type` in context logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LoomError::Validation(_) => "validation_error",
            LoomError::DefinitionNotFound(_) => "definition_not_found",
            LoomError::Expression(_) => "expression_error",
            LoomError::DependencyResolution(_) => "dependency_resolution_error",
            LoomError::StepExecution { .. } => "step_execution_error",
            LoomError::StepTimeout { .. } | LoomError::WorkflowTimeout { .. } => "timeout_error",
            LoomError::Cancelled => "cancelled_error",
            LoomError::StateMachine(_) => "state_machine_error",
            LoomError::BrokerUnavailable(_) => "broker_unavailable_error",
            LoomError::Config(_) | LoomError::ConfigNotFound(_) => "config_error",
            LoomError::Database(_) => "database_error",
            LoomError::Io(_) => "io_error",
            LoomError::Json(_) => "json_error",
        }
    }

    /// Wrap an arbitrary executor failure as a step execution error.
    pub fn step(step: impl Into<String>, message: impl ToString) -> Self {
        LoomError::StepExecution {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;

/// Text of a caught panic payload, for logs and error messages.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_downcasts_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(&*caught), "static text");

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*caught), "formatted 7");

        let caught = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(&*caught), "non-string panic payload");
    }
}
