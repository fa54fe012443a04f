mod engine;
mod plan;

pub use engine::{DagWorkflowEngine, ExecutionSummary, STEP_CONDITION_ROOTS};
pub use plan::{validate, ExecutionPlan};
