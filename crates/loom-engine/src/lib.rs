pub mod builtin;
pub mod dag;
pub mod expr;
pub mod orchestrator;
pub mod registry;
pub mod run_log;
pub mod statemachine;

pub use dag::{DagWorkflowEngine, ExecutionPlan, ExecutionSummary};
pub use expr::Condition;
pub use orchestrator::Orchestrator;
pub use registry::{ExecutorRegistry, FnExecutor};
pub use run_log::RunLogger;
pub use statemachine::{
    approval_machine, simple_workflow_machine, Action, Guard, State, StateMachineDefinition,
    StateMachineEvent, StateMachineExecutor, StateType, Transition, TransitionType,
};
