mod definition;
mod executor;
mod prebuilt;
mod primitives;

pub use definition::{State, StateMachineDefinition, StateType, Transition, TransitionType, ANY_EVENT};
pub use executor::StateMachineExecutor;
pub use prebuilt::{approval_machine, simple_workflow_machine, DEFAULT_EVENT};
pub use primitives::{Action, Guard, StateMachineEvent, Variables, GUARD_ROOTS};
