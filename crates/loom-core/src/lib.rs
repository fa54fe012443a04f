pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod id;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use context::ExecutionContext;
pub use error::{LoomError, Result};
pub use event::EventBus;
pub use id::IdGenerator;
pub use types::*;
pub use workflow::{StepType, WorkflowDefinition, WorkflowExecutionResult, WorkflowStep};
