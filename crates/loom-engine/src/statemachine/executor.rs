use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use loom_core::config::EngineConfig;
use loom_core::context::ExecutionContext;
use loom_core::error::{LoomError, Result};
use loom_core::event::EventBus;
use loom_core::types::EngineEvent;

use super::definition::{State, StateMachineDefinition, StateType, Transition, TransitionType};
use super::primitives::{Action, StateMachineEvent, Variables};

/// Drives a [`StateMachineDefinition`] one event at a time.
///
/// The active configuration is kept in entry order. For every event, each
/// state active when the event arrived gets one chance to fire its highest
/// priority matching transition; states exited earlier in the same event are
/// skipped. Do-activities run as background tasks and are cancelled before
/// their state's exit action runs.
pub struct StateMachineExecutor {
    id: String,
    initial_state: String,
    final_states: Vec<String>,
    initial_variables: Variables,
    states: HashMap<String, State>,
    transitions: HashMap<String, Vec<Transition>>,
    parents: HashMap<String, String>,
    active: Vec<String>,
    variables: Arc<Mutex<Variables>>,
    history: Vec<StateMachineEvent>,
    activities: HashMap<String, JoinHandle<()>>,
    running: bool,
    activity_interval: Duration,
    event_bus: Option<Arc<EventBus>>,
    context: Option<Arc<ExecutionContext>>,
}

impl StateMachineExecutor {
    pub fn new(definition: StateMachineDefinition) -> Result<Self> {
        definition.validate()?;

        let mut parents = HashMap::new();
        for state in &definition.states {
            if let Some(parent) = &state.parent {
                parents.insert(state.id.clone(), parent.clone());
            }
            for child in state.substates.iter().chain(state.regions.iter().flatten()) {
                parents.insert(child.clone(), state.id.clone());
            }
        }

        let mut transitions: HashMap<String, Vec<Transition>> = HashMap::new();
        for t in definition.transitions {
            transitions.entry(t.source.clone()).or_default().push(t);
        }
        // Stable sort keeps definition order among equal priorities.
        for list in transitions.values_mut() {
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        let mut final_states: Vec<String> = definition.final_states.into_iter().collect();
        final_states.sort();

        Ok(Self {
            id: definition.id,
            initial_state: definition.initial_state,
            final_states,
            variables: Arc::new(Mutex::new(definition.variables.clone())),
            initial_variables: definition.variables,
            states: definition.states.into_iter().map(|s| (s.id.clone(), s)).collect(),
            transitions,
            parents,
            active: Vec::new(),
            history: Vec::new(),
            activities: HashMap::new(),
            running: false,
            activity_interval: Duration::from_millis(EngineConfig::default().do_activity_interval_ms),
            event_bus: None,
            context: None,
        })
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.activity_interval = Duration::from_millis(config.do_activity_interval_ms.max(1));
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Fired transitions are recorded as intermediate results in `ctx`.
    pub fn with_context(mut self, ctx: Arc<ExecutionContext>) -> Self {
        self.context = Some(ctx);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Enter the initial state with variables reset to the definition's.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(LoomError::StateMachine(format!(
                "State machine {} is already running",
                self.id
            )));
        }
        *self.vars() = self.initial_variables.clone();
        self.active.clear();
        self.history.clear();
        self.running = true;

        info!(machine = %self.id, initial = %self.initial_state, "Starting state machine");
        let initial = self.initial_state.clone();
        self.enter_with_ancestors(&initial);
        Ok(())
    }

    /// Deliver one event. Returns whether any transition fired.
    pub async fn send_event(&mut self, event: StateMachineEvent) -> Result<bool> {
        if !self.running {
            return Err(LoomError::StateMachine(format!(
                "State machine {} is not running",
                self.id
            )));
        }
        debug!(machine = %self.id, event = %event.name, "Processing event");
        self.history.push(event.clone());

        let mut fired = false;
        let snapshot = self.active.clone();
        for state_id in snapshot {
            if !self.active.contains(&state_id) {
                continue;
            }
            if let Some(transition) = self.select_transition(&state_id, &event) {
                self.fire(&transition, &event).await;
                fired = true;
            }
        }
        Ok(fired)
    }

    /// Cancel every do-activity, then exit every active state deepest
    /// first and stop accepting events.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        let activities: Vec<_> = self.activities.drain().map(|(_, handle)| handle).collect();
        for handle in &activities {
            handle.abort();
        }
        for handle in activities {
            let _ = handle.await;
        }
        while let Some(state_id) = self.active.last().cloned() {
            self.exit_one(&state_id, None).await;
        }
        self.running = false;
        info!(machine = %self.id, "State machine stopped");
    }

    pub fn is_in_state(&self, state_id: &str) -> bool {
        self.active.iter().any(|s| s == state_id)
    }

    /// Whether any active state is final.
    pub fn is_final(&self) -> bool {
        self.active.iter().any(|s| {
            self.final_states.contains(s)
                || self.states.get(s).is_some_and(|st| st.state_type == StateType::Final)
        })
    }

    /// Active state ids in entry order.
    pub fn active_states(&self) -> &[String] {
        &self.active
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.vars().get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.vars().insert(name.into(), value);
    }

    pub fn variables(&self) -> Variables {
        self.vars().clone()
    }

    /// Every event sent since start, in order.
    pub fn history(&self) -> &[StateMachineEvent] {
        &self.history
    }

    fn vars(&self) -> MutexGuard<'_, Variables> {
        self.variables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn select_transition(&self, state_id: &str, event: &StateMachineEvent) -> Option<Transition> {
        let candidates = self.transitions.get(state_id)?;
        let vars = self.vars();
        candidates
            .iter()
            .filter(|t| t.matches(event))
            .find(|t| t.guard.as_ref().map_or(true, |g| g.evaluate(&vars, event)))
            .cloned()
    }

    async fn fire(&mut self, transition: &Transition, event: &StateMachineEvent) {
        info!(
            machine = %self.id,
            transition = %transition.id,
            from = %transition.source,
            to = %transition.target,
            "Executing transition"
        );

        match transition.transition_type {
            TransitionType::Internal => {
                self.run_action(transition.action.as_ref(), Some(event));
            }
            TransitionType::Local => {
                for id in self.active_descendants(&transition.source) {
                    self.exit_one(&id, Some(event)).await;
                }
                self.run_action(transition.action.as_ref(), Some(event));
                if transition.target == transition.source {
                    self.enter_defaults(&transition.target);
                } else {
                    self.enter_with_ancestors(&transition.target);
                }
            }
            TransitionType::External => {
                self.exit_tree(&transition.source, Some(event)).await;
                self.run_action(transition.action.as_ref(), Some(event));
                self.enter_with_ancestors(&transition.target);
            }
        }

        if let Some(ctx) = &self.context {
            ctx.add_intermediate_result(
                format!("transition:{}", transition.id),
                json!({
                    "machine_id": self.id,
                    "from": transition.source,
                    "to": transition.target,
                    "event": event.name,
                }),
                Map::new(),
            );
        }
        if let Some(bus) = &self.event_bus {
            bus.publish(EngineEvent::TransitionFired {
                machine_id: self.id.clone(),
                transition_id: transition.id.clone(),
                from: transition.source.clone(),
                to: transition.target.clone(),
                event: event.name.clone(),
            });
        }
    }

    fn ancestors(&self, state_id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = self.parents.get(state_id);
        while let Some(parent) = cursor {
            if chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            cursor = self.parents.get(parent);
        }
        chain
    }

    /// Active descendants of `state_id`, deepest first.
    fn active_descendants(&self, state_id: &str) -> Vec<String> {
        self.active
            .iter()
            .rev()
            .filter(|s| self.ancestors(s).iter().any(|a| a == state_id))
            .cloned()
            .collect()
    }

    fn enter_with_ancestors(&mut self, target: &str) {
        for ancestor in self.ancestors(target).into_iter().rev() {
            if !self.is_in_state(&ancestor) {
                self.enter_shallow(&ancestor);
            }
        }
        self.enter(target);
    }

    fn enter(&mut self, state_id: &str) {
        if self.is_in_state(state_id) {
            return;
        }
        self.enter_shallow(state_id);
        self.enter_defaults(state_id);
    }

    /// Activate one state: entry action and do-activity only.
    fn enter_shallow(&mut self, state_id: &str) {
        let Some(state) = self.states.get(state_id) else {
            warn!(machine = %self.id, state = %state_id, "Cannot enter unknown state");
            return;
        };
        let entry = state.entry_action.clone();
        let activity = state.do_activity.clone();

        debug!(machine = %self.id, state = %state_id, "Entering state");
        self.active.push(state_id.to_string());
        self.run_action(entry.as_ref(), None);
        if let Some(activity) = activity {
            self.spawn_activity(state_id, activity);
        }
    }

    /// Enter the initial substate of a composite or the first state of each
    /// region of a parallel state.
    fn enter_defaults(&mut self, state_id: &str) {
        let Some(state) = self.states.get(state_id) else {
            return;
        };
        let children: Vec<String> = match state.state_type {
            StateType::Composite => state.initial_state.iter().cloned().collect(),
            StateType::Parallel => state.regions.iter().filter_map(|r| r.first().cloned()).collect(),
            StateType::Simple | StateType::Final => Vec::new(),
        };
        for child in children {
            self.enter(&child);
        }
    }

    fn spawn_activity(&mut self, state_id: &str, activity: Action) {
        let variables = Arc::clone(&self.variables);
        let interval = self.activity_interval;
        let machine = self.id.clone();
        let state = state_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let result = {
                    let mut vars = variables.lock().unwrap_or_else(|e| e.into_inner());
                    activity.run(&mut vars, None)
                };
                if let Err(e) = result {
                    warn!(machine = %machine, state = %state, error = %e, "Do-activity failed");
                }
            }
        });
        if let Some(previous) = self.activities.insert(state_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Exit `state_id` and its active descendants.
    async fn exit_tree(&mut self, state_id: &str, event: Option<&StateMachineEvent>) {
        for id in self.active_descendants(state_id) {
            self.exit_one(&id, event).await;
        }
        self.exit_one(state_id, event).await;
    }

    async fn exit_one(&mut self, state_id: &str, event: Option<&StateMachineEvent>) {
        let Some(pos) = self.active.iter().position(|s| s == state_id) else {
            return;
        };
        if let Some(handle) = self.activities.remove(state_id) {
            handle.abort();
            let _ = handle.await;
        }
        debug!(machine = %self.id, state = %state_id, "Exiting state");
        let exit = self.states.get(state_id).and_then(|s| s.exit_action.clone());
        self.run_action(exit.as_ref(), event);
        self.active.remove(pos);
    }

    fn run_action(&self, action: Option<&Action>, event: Option<&StateMachineEvent>) {
        let Some(action) = action else {
            return;
        };
        let result = action.run(&mut *self.vars(), event);
        if let Err(e) = result {
            warn!(machine = %self.id, action = %action.name(), error = %e, "Action failed");
        }
    }
}

impl Drop for StateMachineExecutor {
    fn drop(&mut self) {
        for (_, handle) in self.activities.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::primitives::Guard;
    use serde_json::json;

    fn flat() -> StateMachineDefinition {
        StateMachineDefinition::new("flat", "flat", "idle")
            .with_state(State::simple("idle"))
            .with_state(State::simple("busy"))
            .with_state(State::final_state("done"))
            .with_transition(Transition::new("go", "idle", "busy", "go"))
            .with_transition(Transition::new("finish", "busy", "done", "finish"))
            .with_final_state("done")
    }

    fn counter(key: &'static str) -> Action {
        Action::new(format!("count:{key}"), move |vars, _| {
            let n = vars.get(key).and_then(Value::as_i64).unwrap_or(0);
            vars.insert(key.into(), json!(n + 1));
            Ok(())
        })
    }

    #[tokio::test]
    async fn runs_to_final_state() {
        let mut sm = StateMachineExecutor::new(flat()).unwrap();
        sm.start().await.unwrap();
        assert!(sm.is_in_state("idle"));
        assert!(sm.send_event(StateMachineEvent::new("go")).await.unwrap());
        assert!(sm.send_event(StateMachineEvent::new("finish")).await.unwrap());
        assert_eq!(sm.active_states(), ["done".to_string()]);
        assert!(sm.is_final());
        assert_eq!(sm.history().len(), 2);
    }

    #[tokio::test]
    async fn unmatched_event_changes_nothing() {
        let mut sm = StateMachineExecutor::new(flat()).unwrap();
        sm.start().await.unwrap();
        assert!(!sm.send_event(StateMachineEvent::new("finish")).await.unwrap());
        assert_eq!(sm.active_states(), ["idle".to_string()]);
        assert_eq!(sm.history().len(), 1);
    }

    #[tokio::test]
    async fn events_rejected_when_not_running() {
        let mut sm = StateMachineExecutor::new(flat()).unwrap();
        assert!(sm.send_event(StateMachineEvent::new("go")).await.is_err());
        sm.start().await.unwrap();
        assert!(sm.start().await.is_err());
        sm.stop().await;
        assert!(sm.active_states().is_empty());
        assert!(sm.send_event(StateMachineEvent::new("go")).await.is_err());
    }

    #[tokio::test]
    async fn composite_enters_initial_substate() {
        let def = StateMachineDefinition::new("c", "composite", "outer")
            .with_state(State::composite("outer", ["a", "b"], "a").with_entry(Action::set("outer_entered", json!(true))))
            .with_state(State::simple("a"))
            .with_state(State::simple("b"))
            .with_state(State::simple("elsewhere"))
            .with_transition(Transition::new("leave", "outer", "elsewhere", "leave"));
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        assert_eq!(sm.active_states(), ["outer".to_string(), "a".to_string()]);
        assert_eq!(sm.variable("outer_entered"), Some(json!(true)));

        sm.send_event(StateMachineEvent::new("leave")).await.unwrap();
        assert_eq!(sm.active_states(), ["elsewhere".to_string()]);
    }

    #[tokio::test]
    async fn parallel_activates_one_state_per_region() {
        let def = StateMachineDefinition::new("p", "parallel", "both")
            .with_state(State::parallel("both", vec![vec!["left_a", "left_b"], vec!["right_a"], vec!["third"]]))
            .with_state(State::simple("left_a"))
            .with_state(State::simple("left_b"))
            .with_state(State::simple("right_a"))
            .with_state(State::simple("third"))
            .with_transition(Transition::new("step", "left_a", "left_b", "step"));
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        assert_eq!(sm.active_states().len(), 4);
        assert!(sm.is_in_state("left_a") && sm.is_in_state("right_a") && sm.is_in_state("third"));

        sm.send_event(StateMachineEvent::new("step")).await.unwrap();
        assert!(sm.is_in_state("left_b"));
        assert!(!sm.is_in_state("left_a"));
        assert!(sm.is_in_state("right_a"));
    }

    #[tokio::test]
    async fn higher_priority_wins() {
        let def = StateMachineDefinition::new("prio", "prio", "s")
            .with_state(State::simple("s"))
            .with_state(State::simple("low"))
            .with_state(State::simple("high"))
            .with_transition(Transition::new("to_low", "s", "low", "e"))
            .with_transition(Transition::new("to_high", "s", "high", "e").with_priority(10));
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        sm.send_event(StateMachineEvent::new("e")).await.unwrap();
        assert!(sm.is_in_state("high"));
    }

    #[tokio::test]
    async fn wildcard_and_failing_guard() {
        let def = StateMachineDefinition::new("w", "wildcard", "s")
            .with_state(State::simple("s"))
            .with_state(State::simple("guarded"))
            .with_state(State::simple("any"))
            .with_transition(
                Transition::new("broken", "s", "guarded", "*")
                    .with_priority(5)
                    .with_guard(Guard::predicate("explodes", |_, _| Err(LoomError::StateMachine("bad".into())))),
            )
            .with_transition(Transition::new("catch_all", "s", "any", "*"));
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        assert!(sm.send_event(StateMachineEvent::new("whatever")).await.unwrap());
        assert!(sm.is_in_state("any"));
    }

    #[tokio::test]
    async fn action_order_is_exit_transition_entry() {
        let log = |tag: &'static str| {
            Action::new(tag, move |vars, _| {
                let mut seq = vars.get("seq").and_then(Value::as_array).cloned().unwrap_or_default();
                seq.push(json!(tag));
                vars.insert("seq".into(), Value::Array(seq));
                Ok(())
            })
        };
        let def = StateMachineDefinition::new("o", "order", "a")
            .with_state(State::simple("a").with_exit(log("exit_a")))
            .with_state(State::simple("b").with_entry(log("enter_b")))
            .with_transition(Transition::new("t", "a", "b", "go").with_action(log("transition")));
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        sm.send_event(StateMachineEvent::new("go")).await.unwrap();
        assert_eq!(sm.variable("seq"), Some(json!(["exit_a", "transition", "enter_b"])));
    }

    #[tokio::test]
    async fn internal_transition_only_runs_action() {
        let def = StateMachineDefinition::new("i", "internal", "a")
            .with_state(State::simple("a").with_entry(counter("entries")).with_exit(counter("exits")))
            .with_transition(
                Transition::new("tick", "a", "a", "tick")
                    .with_type(TransitionType::Internal)
                    .with_action(counter("ticks")),
            );
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        sm.send_event(StateMachineEvent::new("tick")).await.unwrap();
        sm.send_event(StateMachineEvent::new("tick")).await.unwrap();
        assert_eq!(sm.variable("ticks"), Some(json!(2)));
        assert_eq!(sm.variable("entries"), Some(json!(1)));
        assert_eq!(sm.variable("exits"), None);
    }

    #[tokio::test]
    async fn local_transition_keeps_source_active() {
        let def = StateMachineDefinition::new("l", "local", "outer")
            .with_state(State::composite("outer", ["a", "b"], "a").with_exit(counter("outer_exits")))
            .with_state(State::simple("a"))
            .with_state(State::simple("b"))
            .with_transition(Transition::new("reset", "outer", "b", "reset").with_type(TransitionType::Local));
        let mut sm = StateMachineExecutor::new(def).unwrap();
        sm.start().await.unwrap();
        sm.send_event(StateMachineEvent::new("reset")).await.unwrap();
        assert_eq!(sm.active_states(), ["outer".to_string(), "b".to_string()]);
        assert_eq!(sm.variable("outer_exits"), None);
    }

    #[tokio::test]
    async fn do_activity_stops_before_exit_action() {
        let snapshot = Action::new("snapshot", |vars, _| {
            let ticks = vars.get("ticks").cloned().unwrap_or(json!(0));
            vars.insert("ticks_at_exit".into(), ticks);
            Ok(())
        });
        let def = StateMachineDefinition::new("d", "activity", "working")
            .with_state(State::simple("working").with_activity(counter("ticks")).with_exit(snapshot))
            .with_state(State::simple("idle"))
            .with_transition(Transition::new("halt", "working", "idle", "halt"));
        let config = EngineConfig {
            do_activity_interval_ms: 5,
            ..EngineConfig::default()
        };
        let mut sm = StateMachineExecutor::new(def).unwrap().with_config(&config);
        sm.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        sm.send_event(StateMachineEvent::new("halt")).await.unwrap();

        let at_exit = sm.variable("ticks_at_exit").unwrap();
        assert!(at_exit.as_i64().unwrap() >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sm.variable("ticks"), Some(at_exit));
    }

    #[tokio::test]
    async fn stop_cancels_all_activities_before_any_exit() {
        let snapshot = Action::new("snapshot", |vars, _| {
            let ticks = vars.get("outer_ticks").cloned().unwrap_or(json!(0));
            vars.insert("outer_ticks_at_child_exit".into(), ticks);
            Ok(())
        });
        let def = StateMachineDefinition::new("s", "nested activities", "outer")
            .with_state(State::composite("outer", ["a"], "a").with_activity(counter("outer_ticks")))
            .with_state(State::simple("a").with_activity(counter("a_ticks")).with_exit(snapshot));
        let config = EngineConfig {
            do_activity_interval_ms: 1,
            ..EngineConfig::default()
        };
        let mut sm = StateMachineExecutor::new(def).unwrap().with_config(&config);
        sm.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        sm.stop().await;

        assert!(sm.active_states().is_empty());
        let at_child_exit = sm.variable("outer_ticks_at_child_exit").unwrap();
        assert!(at_child_exit.as_i64().unwrap() >= 1);
        let a_ticks = sm.variable("a_ticks");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sm.variable("outer_ticks"), Some(at_child_exit));
        assert_eq!(sm.variable("a_ticks"), a_ticks);
    }

    #[tokio::test]
    async fn transitions_are_recorded_and_published() {
        let ctx = Arc::new(ExecutionContext::new());
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut sm = StateMachineExecutor::new(flat())
            .unwrap()
            .with_context(ctx.clone())
            .with_event_bus(bus);
        sm.start().await.unwrap();
        sm.send_event(StateMachineEvent::new("go")).await.unwrap();

        let results = ctx.intermediate_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].step_name, "transition:go");
        assert_eq!(results[0].result["to"], "busy");
        match rx.recv().await.unwrap() {
            EngineEvent::TransitionFired { transition_id, .. } => assert_eq!(transition_id, "go"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
