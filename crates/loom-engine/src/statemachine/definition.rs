use std::collections::HashSet;

use serde_json::Value;

use loom_core::error::{LoomError, Result};

use super::primitives::{Action, Guard, StateMachineEvent, Variables};

/// Wildcard event name matching every event.
pub const ANY_EVENT: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Simple,
    Composite,
    Parallel,
    Final,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransitionType {
    /// Exit the source, run the action, enter the target.
    #[default]
    External,
    /// Run the action only; no state is exited or entered.
    Internal,
    /// Exit the source's active descendants but not the source itself.
    Local,
}

#[derive(Debug, Clone)]
pub struct State {
    pub id: String,
    pub name: String,
    pub state_type: StateType,
    pub parent: Option<String>,
    /// Children of a COMPOSITE state.
    pub substates: Vec<String>,
    /// Default child of a COMPOSITE state.
    pub initial_state: Option<String>,
    pub entry_action: Option<Action>,
    pub exit_action: Option<Action>,
    pub do_activity: Option<Action>,
    /// State-id lists of a PARALLEL state; the first id of each is entered.
    pub regions: Vec<Vec<String>>,
}

impl State {
    fn new(id: impl Into<String>, state_type: StateType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            state_type,
            parent: None,
            substates: Vec::new(),
            initial_state: None,
            entry_action: None,
            exit_action: None,
            do_activity: None,
            regions: Vec::new(),
        }
    }

    pub fn simple(id: impl Into<String>) -> Self {
        Self::new(id, StateType::Simple)
    }

    pub fn final_state(id: impl Into<String>) -> Self {
        Self::new(id, StateType::Final)
    }

    pub fn composite<I, S>(id: impl Into<String>, substates: I, initial: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = Self::new(id, StateType::Composite);
        state.substates = substates.into_iter().map(Into::into).collect();
        state.initial_state = Some(initial.into());
        state
    }

    pub fn parallel(id: impl Into<String>, regions: Vec<Vec<&str>>) -> Self {
        let mut state = Self::new(id, StateType::Parallel);
        state.regions = regions
            .into_iter()
            .map(|r| r.into_iter().map(String::from).collect())
            .collect();
        state
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_entry(mut self, action: Action) -> Self {
        self.entry_action = Some(action);
        self
    }

    pub fn with_exit(mut self, action: Action) -> Self {
        self.exit_action = Some(action);
        self
    }

    pub fn with_activity(mut self, action: Action) -> Self {
        self.do_activity = Some(action);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Triggering event name, or `*`.
    pub event: String,
    pub guard: Option<Guard>,
    pub action: Option<Action>,
    pub transition_type: TransitionType,
    /// Higher fires first among competing transitions from one state.
    pub priority: i32,
}

impl Transition {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            event: event.into(),
            guard: None,
            action: None,
            transition_type: TransitionType::External,
            priority: 0,
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_type(mut self, transition_type: TransitionType) -> Self {
        self.transition_type = transition_type;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn matches(&self, event: &StateMachineEvent) -> bool {
        self.event == event.name || self.event == ANY_EVENT
    }
}

#[derive(Debug, Clone)]
pub struct StateMachineDefinition {
    pub id: String,
    pub name: String,
    pub states: Vec<State>,
    pub transitions: Vec<Transition>,
    pub initial_state: String,
    pub final_states: HashSet<String>,
    pub variables: Variables,
}

impl StateMachineDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, initial_state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial_state: initial_state.into(),
            final_states: HashSet::new(),
            variables: Variables::new(),
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_final_state(mut self, id: impl Into<String>) -> Self {
        self.final_states.insert(id.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    /// Structural checks run before an executor is built.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LoomError::Validation(format!("State machine {}: {}", self.id, msg)));

        if self.states.is_empty() {
            return invalid("must have at least one state".into());
        }
        let mut ids = HashSet::new();
        for state in &self.states {
            if !ids.insert(state.id.as_str()) {
                return invalid(format!("duplicate state id {}", state.id));
            }
        }
        let known = |id: &str| ids.contains(id);

        if !known(&self.initial_state) {
            return invalid(format!("unknown initial state {}", self.initial_state));
        }
        for id in &self.final_states {
            if !known(id) {
                return invalid(format!("unknown final state {id}"));
            }
        }

        for state in &self.states {
            if let Some(parent) = &state.parent {
                if !known(parent) {
                    return invalid(format!("state {} has unknown parent {}", state.id, parent));
                }
            }
            match state.state_type {
                StateType::Composite => {
                    if state.substates.is_empty() {
                        return invalid(format!("composite state {} has no substates", state.id));
                    }
                    if let Some(sub) = state.substates.iter().find(|s| !known(s)) {
                        return invalid(format!("composite state {} has unknown substate {}", state.id, sub));
                    }
                    match &state.initial_state {
                        Some(initial) if state.substates.contains(initial) => {}
                        Some(initial) => {
                            return invalid(format!(
                                "initial state {} of composite {} is not one of its substates",
                                initial, state.id
                            ))
                        }
                        None => return invalid(format!("composite state {} has no initial state", state.id)),
                    }
                }
                StateType::Parallel => {
                    if state.regions.is_empty() || state.regions.iter().any(Vec::is_empty) {
                        return invalid(format!("parallel state {} needs non-empty regions", state.id));
                    }
                    let mut seen = HashSet::new();
                    for id in state.regions.iter().flatten() {
                        if !known(id) {
                            return invalid(format!("parallel state {} has unknown region state {}", state.id, id));
                        }
                        if !seen.insert(id.as_str()) {
                            return invalid(format!("parallel state {} has overlapping regions at {}", state.id, id));
                        }
                    }
                }
                StateType::Simple | StateType::Final => {}
            }
        }

        let mut transition_ids = HashSet::new();
        for t in &self.transitions {
            if !transition_ids.insert(t.id.as_str()) {
                return invalid(format!("duplicate transition id {}", t.id));
            }
            if !known(&t.source) || !known(&t.target) {
                return invalid(format!("transition {} references an unknown state", t.id));
            }
        }
        Ok(())
    }
}
