use std::collections::{HashMap, HashSet};

use loom_core::error::{LoomError, Result};
use loom_core::workflow::WorkflowDefinition;

/// Validated execution order of a workflow: a list of batches, each a set of
/// steps with no dependency among themselves.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    batches: Vec<Vec<String>>,
    batch_of: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Validate the definition and compute its batches.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        validate(definition)?;
        let batches = compute_batches(definition)?;
        let batch_of = batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| batch.iter().map(move |id| (id.clone(), i)))
            .collect();
        Ok(Self { batches, batch_of })
    }

    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    pub fn batch_index(&self, step_id: &str) -> Option<usize> {
        self.batch_of.get(step_id).copied()
    }
}

/// Structural checks: non-empty, unique ids, known dependencies, acyclic.
pub fn validate(definition: &WorkflowDefinition) -> Result<()> {
    if definition.steps.is_empty() {
        return Err(LoomError::Validation("Workflow must have at least one step".into()));
    }

    let mut ids = HashSet::new();
    for step in &definition.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(LoomError::Validation(format!(
                "Workflow steps must have unique IDs (duplicate: {})",
                step.id
            )));
        }
    }

    for step in &definition.steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(LoomError::Validation(format!(
                    "Step {} depends on non-existent step {}",
                    step.id, dep
                )));
            }
        }
    }

    let deps: HashMap<&str, &[String]> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();
    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    for step in &definition.steps {
        if !visited.contains(step.id.as_str()) {
            if let Some(offender) = find_cycle(step.id.as_str(), &deps, &mut visited, &mut stack) {
                return Err(LoomError::Validation(format!(
                    "Circular dependency detected involving step {offender}"
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first search with a recursion stack. Returns the step whose
/// dependency closes a cycle.
fn find_cycle<'a>(
    node: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> Option<&'a str> {
    visited.insert(node);
    stack.insert(node);
    for dep in deps.get(node).copied().unwrap_or_default() {
        let dep = dep.as_str();
        if stack.contains(dep) {
            return Some(node);
        }
        if !visited.contains(dep) {
            if let Some(offender) = find_cycle(dep, deps, visited, stack) {
                return Some(offender);
            }
        }
    }
    stack.remove(node);
    None
}

/// Kahn's algorithm, one batch per round of zero in-degree steps. Steps
/// inside a batch keep their definition order.
fn compute_batches(definition: &WorkflowDefinition) -> Result<Vec<Vec<String>>> {
    let position: HashMap<&str, usize> = definition
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &definition.steps {
        in_degree.insert(step.id.as_str(), step.dependencies.len());
        for dep in &step.dependencies {
            dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut ready: Vec<&str> = definition
        .steps
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.id.as_str())
        .collect();

    let mut batches = Vec::new();
    let mut scheduled = 0;
    while !ready.is_empty() {
        ready.sort_by_key(|id| position[id]);
        let mut next = Vec::new();
        for id in &ready {
            for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        scheduled += ready.len();
        batches.push(ready.iter().map(|s| s.to_string()).collect());
        ready = next;
    }

    if scheduled != definition.steps.len() {
        return Err(LoomError::Validation(
            "Circular dependency detected: not every step could be scheduled".into(),
        ));
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::workflow::WorkflowStep;
    use serde_json::json;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::tool(id, "echo", json!({})).with_dependencies(deps.iter().copied())
    }

    fn def(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        steps
            .into_iter()
            .fold(WorkflowDefinition::new("wf", "test"), |d, s| d.with_step(s))
    }

    #[test]
    fn fan_out_batches() {
        let plan = ExecutionPlan::build(&def(vec![
            step("step1", &[]),
            step("step2", &["step1"]),
            step("step3", &["step1"]),
            step("step4", &["step2", "step3"]),
        ]))
        .unwrap();
        assert_eq!(
            plan.batches(),
            &[
                vec!["step1".to_string()],
                vec!["step2".to_string(), "step3".to_string()],
                vec!["step4".to_string()],
            ]
        );
    }

    #[test]
    fn dependencies_always_in_earlier_batches() {
        let d = def(vec![
            step("e", &["c", "d"]),
            step("a", &[]),
            step("d", &["b"]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("f", &[]),
            step("g", &["f", "e"]),
        ]);
        let plan = ExecutionPlan::build(&d).unwrap();
        for s in &d.steps {
            for dep in &s.dependencies {
                assert!(plan.batch_index(dep).unwrap() < plan.batch_index(&s.id).unwrap());
            }
        }
        let total: usize = plan.batches().iter().map(Vec::len).sum();
        assert_eq!(total, d.steps.len());
    }

    #[test]
    fn cycle_rejected() {
        let err = ExecutionPlan::build(&def(vec![step("step1", &["step2"]), step("step2", &["step1"])]))
            .unwrap_err();
        assert!(matches!(err, LoomError::Validation(_)));
        assert!(err.to_string().contains("Circular dependency detected involving step"));
    }

    #[test]
    fn self_dependency_rejected() {
        let err = ExecutionPlan::build(&def(vec![step("a", &["a"])])).unwrap_err();
        assert!(err.to_string().contains("involving step a"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = ExecutionPlan::build(&def(vec![step("a", &[]), step("a", &[])])).unwrap_err();
        assert!(err.to_string().contains("unique IDs"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = ExecutionPlan::build(&def(vec![step("a", &["ghost"])])).unwrap_err();
        assert!(err.to_string().contains("Step a depends on non-existent step ghost"));
    }

    #[test]
    fn empty_definition_rejected() {
        let err = ExecutionPlan::build(&WorkflowDefinition::new("wf", "empty")).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }
}
