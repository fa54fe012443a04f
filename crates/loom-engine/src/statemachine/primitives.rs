use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use loom_core::error::Result;

use crate::expr::Condition;

/// Runtime variables of a state machine.
pub type Variables = Map<String, Value>;

/// Names a guard expression may reference.
pub const GUARD_ROOTS: &[&str] = &["variables", "event"];

type PredicateFn = dyn Fn(&Variables, &StateMachineEvent) -> Result<bool> + Send + Sync;
type ActionFn = dyn Fn(&mut Variables, Option<&StateMachineEvent>) -> Result<()> + Send + Sync;

/// An external stimulus. Recorded in the executor's history once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineEvent {
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl StateMachineEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    fn to_scope(&self, variables: &Variables) -> Value {
        json!({
            "variables": variables,
            "event": {
                "name": self.name,
                "data": self.data,
                "timestamp": self.timestamp.to_rfc3339(),
            },
        })
    }
}

#[derive(Clone)]
enum GuardKind {
    Expression(Condition),
    Predicate(Arc<PredicateFn>),
}

/// Boolean predicate gating a transition.
#[derive(Clone)]
pub struct Guard {
    name: String,
    kind: GuardKind,
}

impl Guard {
    /// Guard from a restricted expression over `variables` and `event`.
    pub fn expression(name: impl Into<String>, source: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            kind: GuardKind::Expression(Condition::compile(source, GUARD_ROOTS)?),
        })
    }

    pub fn predicate<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Variables, &StateMachineEvent) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: GuardKind::Predicate(Arc::new(f)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_evaluate(&self, variables: &Variables, event: &StateMachineEvent) -> Result<bool> {
        match &self.kind {
            GuardKind::Expression(cond) => cond.evaluate(&event.to_scope(variables)),
            GuardKind::Predicate(f) => f(variables, event),
        }
    }

    /// Evaluation errors count as `false`.
    pub fn evaluate(&self, variables: &Variables, event: &StateMachineEvent) -> bool {
        match self.try_evaluate(variables, event) {
            Ok(passed) => passed,
            Err(e) => {
                warn!(guard = %self.name, error = %e, "Guard evaluation failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            GuardKind::Expression(c) => c.source().to_string(),
            GuardKind::Predicate(_) => "<predicate>".to_string(),
        };
        f.debug_struct("Guard").field("name", &self.name).field("kind", &kind).finish()
    }
}

/// Side-effecting callable over the machine's variables. Used for entry,
/// exit, do-activity, and transition actions.
#[derive(Clone)]
pub struct Action {
    name: String,
    func: Arc<ActionFn>,
}

impl Action {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Variables, Option<&StateMachineEvent>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(f),
        }
    }

    /// Action that assigns a fixed value to a variable.
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        Self::new(format!("set:{key}"), move |vars, _| {
            vars.insert(key.clone(), value.clone());
            Ok(())
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(&self, variables: &mut Variables, event: Option<&StateMachineEvent>) -> Result<()> {
        (self.func)(variables, event)
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::error::LoomError;

    #[test]
    fn expression_guard_reads_variables_and_event() {
        let guard = Guard::expression("big", "variables.amount > 100 and event.data.approved == true").unwrap();
        let mut vars = Variables::new();
        vars.insert("amount".into(), json!(250));
        let event = StateMachineEvent::new("review").with_data("approved", json!(true));
        assert!(guard.evaluate(&vars, &event));
        assert!(!guard.evaluate(&vars, &StateMachineEvent::new("review")));
    }

    #[test]
    fn guard_errors_are_false() {
        let failing = Guard::predicate("boom", |_, _| Err(LoomError::StateMachine("boom".into())));
        assert!(!failing.evaluate(&Variables::new(), &StateMachineEvent::new("x")));

        let mistyped = Guard::expression("cmp", "variables.name > 3").unwrap();
        let mut vars = Variables::new();
        vars.insert("name".into(), json!("abc"));
        assert!(!mistyped.evaluate(&vars, &StateMachineEvent::new("x")));
    }

    #[test]
    fn guard_expression_cannot_escape_scope() {
        assert!(Guard::expression("g", "input.x == 1").is_err());
    }

    #[test]
    fn set_action_assigns() {
        let mut vars = Variables::new();
        Action::set("done", json!(true)).run(&mut vars, None).unwrap();
        assert_eq!(vars["done"], json!(true));
    }
}
