//! Ready-made machine definitions.

use loom_core::error::Result;

use super::definition::{State, StateMachineDefinition, Transition};
use super::primitives::Guard;

/// Event used by [`simple_workflow_machine`] transitions without one.
pub const DEFAULT_EVENT: &str = "next";

fn title_case(id: &str) -> String {
    id.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// A linear machine over `states`: the first is initial, the last is final.
///
/// Each transition is `(from, to, event)`; an empty event means
/// [`DEFAULT_EVENT`]. Transition ids are `trans_0`, `trans_1`, ...
pub fn simple_workflow_machine(
    id: &str,
    states: &[&str],
    transitions: &[(&str, &str, &str)],
) -> StateMachineDefinition {
    let initial = states.first().copied().unwrap_or_default();
    let mut def = StateMachineDefinition::new(id, format!("Workflow {id}"), initial);

    for (i, state) in states.iter().enumerate() {
        let built = if i + 1 == states.len() {
            State::final_state(*state)
        } else {
            State::simple(*state)
        };
        def = def.with_state(built.with_name(title_case(state)));
    }
    if let Some(last) = states.last() {
        def = def.with_final_state(*last);
    }

    for (i, (from, to, event)) in transitions.iter().enumerate() {
        let event = if event.is_empty() { DEFAULT_EVENT } else { *event };
        def = def.with_transition(Transition::new(format!("trans_{i}"), *from, *to, event));
    }
    def
}

/// Processing with an optional human approval step.
///
/// `processed` goes straight to `completed` unless the variable
/// `requires_approval` is true; `approval_response` events carry
/// `data.approved`.
pub fn approval_machine(id: &str) -> Result<StateMachineDefinition> {
    Ok(StateMachineDefinition::new(id, "Approval Workflow", "initial")
        .with_state(State::simple("initial").with_name("Initial"))
        .with_state(State::simple("processing").with_name("Processing"))
        .with_state(State::simple("pending_approval").with_name("Pending Approval"))
        .with_state(State::simple("approved").with_name("Approved"))
        .with_state(State::final_state("rejected").with_name("Rejected"))
        .with_state(State::final_state("completed").with_name("Completed"))
        .with_transition(Transition::new("start_processing", "initial", "processing", "start"))
        .with_transition(
            Transition::new("needs_approval", "processing", "pending_approval", "processed")
                .with_guard(Guard::expression("needs_approval", "variables.requires_approval == true")?),
        )
        .with_transition(
            Transition::new("auto_approve", "processing", "completed", "processed")
                .with_guard(Guard::expression("auto_approve", "not variables.requires_approval")?),
        )
        .with_transition(
            Transition::new("approve", "pending_approval", "approved", "approval_response")
                .with_guard(Guard::expression("approved", "event.data.approved == true")?),
        )
        .with_transition(
            Transition::new("reject", "pending_approval", "rejected", "approval_response")
                .with_guard(Guard::expression("rejected", "not event.data.approved")?),
        )
        .with_transition(Transition::new("complete", "approved", "completed", "finalize"))
        .with_final_state("completed")
        .with_final_state("rejected"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::{StateMachineEvent, StateMachineExecutor, StateType};
    use serde_json::json;

    #[tokio::test]
    async fn linear_machine_walks_to_the_end() {
        let def = simple_workflow_machine(
            "wf",
            &["draft_copy", "review", "published"],
            &[("draft_copy", "review", ""), ("review", "published", "approve")],
        );
        assert_eq!(def.state("draft_copy").unwrap().name, "Draft Copy");
        assert_eq!(def.state("published").unwrap().state_type, StateType::Final);
        assert_eq!(def.transitions[1].id, "trans_1");

        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        assert!(sm.send_event(StateMachineEvent::new("next")).await.unwrap());
        assert!(sm.send_event(StateMachineEvent::new("approve")).await.unwrap());
        assert!(sm.is_final());
    }

    #[tokio::test]
    async fn approval_auto_completes_without_flag() {
        let mut sm = StateMachineExecutor::new(approval_machine("a").unwrap()).unwrap();
        sm.start().await.unwrap();
        sm.send_event(StateMachineEvent::new("start")).await.unwrap();
        sm.send_event(StateMachineEvent::new("processed")).await.unwrap();
        assert!(sm.is_in_state("completed"));
    }

    #[tokio::test]
    async fn approval_path_and_rejection() {
        let mut sm = StateMachineExecutor::new(approval_machine("a").unwrap()).unwrap();
        sm.start().await.unwrap();
        sm.set_variable("requires_approval", json!(true));
        sm.send_event(StateMachineEvent::new("start")).await.unwrap();
        sm.send_event(StateMachineEvent::new("processed")).await.unwrap();
        assert!(sm.is_in_state("pending_approval"));

        sm.send_event(StateMachineEvent::new("approval_response").with_data("approved", json!(true)))
            .await
            .unwrap();
        sm.send_event(StateMachineEvent::new("finalize")).await.unwrap();
        assert!(sm.is_in_state("completed"));

        let mut rejected = StateMachineExecutor::new(approval_machine("b").unwrap()).unwrap();
        rejected.start().await.unwrap();
        rejected.set_variable("requires_approval", json!(true));
        rejected.send_event(StateMachineEvent::new("start")).await.unwrap();
        rejected.send_event(StateMachineEvent::new("processed")).await.unwrap();
        rejected
            .send_event(StateMachineEvent::new("approval_response").with_data("approved", json!(false)))
            .await
            .unwrap();
        assert!(rejected.is_in_state("rejected"));
        assert!(rejected.is_final());
    }
}
