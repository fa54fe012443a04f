use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::ExecutionPhase;

/// One entry of the append-only intermediate result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateResult {
    pub step_name: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
    pub step_number: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A recorded error, stamped with the phase and step count at the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub phase: ExecutionPhase,
    pub step_count: u64,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub phase: ExecutionPhase,
    pub step_count: u64,
}

/// Serializable state of an [`ExecutionContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub execution_id: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: ExecutionPhase,
    pub step_count: u64,
    pub is_cancelled: bool,
    #[serde(default)]
    pub shared_data: Map<String, Value>,
    #[serde(default)]
    pub intermediate_results: Vec<IntermediateResult>,
    #[serde(default)]
    pub executed_tools: Vec<String>,
    #[serde(default)]
    pub executed_agents: Vec<String>,
    #[serde(default)]
    pub agent_outputs: Map<String, Value>,
    #[serde(default)]
    pub step_outputs: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(default)]
    pub warnings: Vec<WarningEntry>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Step id -> wall-clock seconds.
    #[serde(default)]
    pub step_timings: HashMap<String, f64>,
}

impl ContextRecord {
    fn new(execution_id: String) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id: None,
            agent_id: None,
            user_id: None,
            session_id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            phase: ExecutionPhase::Initialization,
            step_count: 0,
            is_cancelled: false,
            shared_data: Map::new(),
            intermediate_results: Vec::new(),
            executed_tools: Vec::new(),
            executed_agents: Vec::new(),
            agent_outputs: Map::new(),
            step_outputs: Map::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: Map::new(),
            config: Map::new(),
            start_time: None,
            end_time: None,
            step_timings: HashMap::new(),
        }
    }
}

/// Aggregate view of a context, for logs and result payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub execution_id: String,
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub phase: ExecutionPhase,
    pub step_count: u64,
    pub is_cancelled: bool,
    pub duration: Option<f64>,
    pub intermediate_results: usize,
    pub executed_tools: usize,
    pub executed_agents: usize,
    pub errors: usize,
    pub warnings: usize,
}

/// Run-scoped mutable state shared by the engine and every step executor.
///
/// All mutation goes through `&self` methods so one context can be shared
/// (behind an `Arc`) by concurrently running steps. Every mutation bumps
/// `updated_at`. Logs are append-only; `shared_data` is last-write-wins.
#[derive(Debug)]
pub struct ExecutionContext {
    record: Mutex<ContextRecord>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_execution_id(Uuid::new_v4().to_string())
    }

    pub fn with_execution_id(execution_id: impl Into<String>) -> Self {
        Self {
            record: Mutex::new(ContextRecord::new(execution_id.into())),
        }
    }

    pub fn from_record(record: ContextRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }

    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.record_mut().workflow_id = Some(id.into());
        self
    }

    pub fn with_agent_id(mut self, id: impl Into<String>) -> Self {
        self.record_mut().agent_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.record_mut().user_id = Some(id.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.record_mut().session_id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.record_mut().metadata.insert(key.into(), value);
        self
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.record_mut().config = config;
        self
    }

    fn record_mut(&mut self) -> &mut ContextRecord {
        match self.record.get_mut() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut ContextRecord) -> R) -> R {
        let mut record = self.lock();
        let out = f(&mut record);
        record.updated_at = Utc::now();
        out
    }

    // -- Identity ----------------------------------------------------------

    pub fn execution_id(&self) -> String {
        self.lock().execution_id.clone()
    }

    pub fn workflow_id(&self) -> Option<String> {
        self.lock().workflow_id.clone()
    }

    pub fn agent_id(&self) -> Option<String> {
        self.lock().agent_id.clone()
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.lock().updated_at
    }

    // -- Lifecycle ---------------------------------------------------------

    pub fn phase(&self) -> ExecutionPhase {
        self.lock().phase
    }

    pub fn step_count(&self) -> u64 {
        self.lock().step_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled
    }

    pub fn start_execution(&self) {
        self.mutate(|r| {
            r.start_time = Some(Utc::now());
            r.phase = ExecutionPhase::InputProcessing;
        });
    }

    pub fn end_execution(&self) {
        self.mutate(|r| {
            r.end_time = Some(Utc::now());
            r.phase = ExecutionPhase::Completion;
        });
    }

    /// Move to `phase` and count it as a step.
    pub fn advance_phase(&self, phase: ExecutionPhase) {
        self.mutate(|r| {
            r.phase = phase;
            r.step_count += 1;
        });
    }

    pub fn cancel_execution(&self, reason: &str) {
        self.mutate(|r| {
            r.is_cancelled = true;
            push_error(r, "execution_cancelled", format!("Execution cancelled: {reason}"), Map::new());
            r.phase = ExecutionPhase::ErrorHandling;
        });
    }

    /// Seconds since start; up to `end_time` once the execution has ended.
    pub fn execution_duration(&self) -> Option<f64> {
        let r = self.lock();
        let start = r.start_time?;
        let end = r.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
    }

    // -- Shared data -------------------------------------------------------

    pub fn set_shared(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.mutate(|r| {
            r.shared_data.insert(key, value);
        });
    }

    pub fn get_shared(&self, key: &str) -> Option<Value> {
        self.lock().shared_data.get(key).cloned()
    }

    pub fn remove_shared(&self, key: &str) -> Option<Value> {
        self.mutate(|r| r.shared_data.remove(key))
    }

    pub fn shared_data(&self) -> Map<String, Value> {
        self.lock().shared_data.clone()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        self.lock().metadata.clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.mutate(|r| {
            r.metadata.insert(key, value);
        });
    }

    // -- Logs --------------------------------------------------------------

    pub fn add_intermediate_result(
        &self,
        step_name: impl Into<String>,
        result: Value,
        metadata: Map<String, Value>,
    ) {
        let step_name = step_name.into();
        self.mutate(|r| {
            let step_number = r.step_count;
            r.intermediate_results.push(IntermediateResult {
                step_name,
                result,
                timestamp: Utc::now(),
                step_number,
                metadata,
            });
        });
    }

    pub fn intermediate_results(&self) -> Vec<IntermediateResult> {
        self.lock().intermediate_results.clone()
    }

    pub fn record_tool_execution(&self, tool_name: impl Into<String>) {
        let tool_name = tool_name.into();
        self.mutate(|r| r.executed_tools.push(tool_name));
    }

    pub fn record_agent_execution(&self, agent_name: impl Into<String>, output: Value) {
        let agent_name = agent_name.into();
        self.mutate(|r| {
            r.agent_outputs.insert(agent_name.clone(), output);
            r.executed_agents.push(agent_name);
        });
    }

    pub fn executed_tools(&self) -> Vec<String> {
        self.lock().executed_tools.clone()
    }

    pub fn executed_agents(&self) -> Vec<String> {
        self.lock().executed_agents.clone()
    }

    pub fn agent_output(&self, agent_name: &str) -> Option<Value> {
        self.lock().agent_outputs.get(agent_name).cloned()
    }

    pub fn record_step_output(&self, step_id: impl Into<String>, output: Value) {
        let step_id = step_id.into();
        self.mutate(|r| {
            r.step_outputs.insert(step_id, output);
        });
    }

    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        self.lock().step_outputs.get(step_id).cloned()
    }

    pub fn add_error(&self, error_type: &str, message: impl Into<String>, details: Map<String, Value>) {
        let message = message.into();
        self.mutate(|r| push_error(r, error_type, message, details));
    }

    pub fn add_warning(&self, message: impl Into<String>) {
        let message = message.into();
        self.mutate(|r| {
            let entry = WarningEntry {
                message,
                timestamp: Utc::now(),
                phase: r.phase,
                step_count: r.step_count,
            };
            r.warnings.push(entry);
        });
    }

    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.lock().errors.clone()
    }

    pub fn warnings(&self) -> Vec<WarningEntry> {
        self.lock().warnings.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.lock().errors.is_empty()
    }

    pub fn last_error(&self) -> Option<ErrorEntry> {
        self.lock().errors.last().cloned()
    }

    pub fn record_step_timing(&self, step_id: impl Into<String>, elapsed: Duration) {
        let step_id = step_id.into();
        self.mutate(|r| {
            r.step_timings.insert(step_id, elapsed.as_secs_f64());
        });
    }

    pub fn step_timing(&self, step_id: &str) -> Option<f64> {
        self.lock().step_timings.get(step_id).copied()
    }

    pub fn step_timings(&self) -> HashMap<String, f64> {
        self.lock().step_timings.clone()
    }

    // -- Views -------------------------------------------------------------

    pub fn summary(&self) -> ContextSummary {
        let duration = self.execution_duration();
        let r = self.lock();
        ContextSummary {
            execution_id: r.execution_id.clone(),
            workflow_id: r.workflow_id.clone(),
            agent_id: r.agent_id.clone(),
            phase: r.phase,
            step_count: r.step_count,
            is_cancelled: r.is_cancelled,
            duration,
            intermediate_results: r.intermediate_results.len(),
            executed_tools: r.executed_tools.len(),
            executed_agents: r.executed_agents.len(),
            errors: r.errors.len(),
            warnings: r.warnings.len(),
        }
    }

    pub fn snapshot(&self) -> ContextRecord {
        self.lock().clone()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> crate::Result<Self> {
        let record: ContextRecord = serde_json::from_value(value)?;
        Ok(Self::from_record(record))
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

fn push_error(r: &mut ContextRecord, error_type: &str, message: String, details: Map<String, Value>) {
    let entry = ErrorEntry {
        error_type: error_type.to_string(),
        message,
        timestamp: Utc::now(),
        phase: r.phase,
        step_count: r.step_count,
        details,
    };
    r.errors.push(entry);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_phases() {
        let ctx = ExecutionContext::new().with_workflow_id("wf1");
        assert_eq!(ctx.phase(), ExecutionPhase::Initialization);
        assert!(ctx.execution_duration().is_none());

        ctx.start_execution();
        assert_eq!(ctx.phase(), ExecutionPhase::InputProcessing);

        ctx.advance_phase(ExecutionPhase::AgentExecution);
        ctx.advance_phase(ExecutionPhase::OutputProcessing);
        assert_eq!(ctx.step_count(), 2);

        ctx.end_execution();
        assert_eq!(ctx.phase(), ExecutionPhase::Completion);
        assert!(ctx.execution_duration().unwrap() >= 0.0);
    }

    #[test]
    fn cancel_records_error_and_phase() {
        let ctx = ExecutionContext::new();
        ctx.advance_phase(ExecutionPhase::ToolExecution);
        ctx.cancel_execution("user request");

        assert!(ctx.is_cancelled());
        assert_eq!(ctx.phase(), ExecutionPhase::ErrorHandling);
        let err = ctx.last_error().unwrap();
        assert_eq!(err.error_type, "execution_cancelled");
        assert_eq!(err.phase, ExecutionPhase::ToolExecution);
        assert_eq!(err.step_count, 1);
    }

    #[test]
    fn mutation_bumps_updated_at() {
        let ctx = ExecutionContext::new();
        let before = ctx.updated_at();
        std::thread::sleep(Duration::from_millis(2));
        ctx.set_shared("k", json!(1));
        assert!(ctx.updated_at() > before);
        assert_eq!(ctx.get_shared("k"), Some(json!(1)));
    }

    #[test]
    fn warnings_are_stamped() {
        let ctx = ExecutionContext::new();
        ctx.advance_phase(ExecutionPhase::AgentExecution);
        ctx.add_warning("slow step");
        let warnings = ctx.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].phase, ExecutionPhase::AgentExecution);
        assert_eq!(warnings[0].step_count, 1);
    }

    #[test]
    fn json_round_trip_preserves_state() {
        let ctx = ExecutionContext::with_execution_id("exec-1")
            .with_agent_id("support")
            .with_metadata("source", json!("api"));
        ctx.start_execution();
        ctx.set_shared("workflow_input", json!({"q": "hi"}));
        ctx.add_intermediate_result("s1", json!({"v": 1}), Map::new());
        ctx.record_tool_execution("search");
        ctx.record_agent_execution("writer", json!("draft"));
        ctx.add_error("step_execution_error", "Step s2: boom", Map::new());
        ctx.record_step_timing("s1", Duration::from_millis(1500));

        let restored = ExecutionContext::from_json(ctx.to_json()).unwrap();
        assert_eq!(restored.execution_id(), "exec-1");
        assert_eq!(restored.agent_id().as_deref(), Some("support"));
        assert_eq!(restored.get_shared("workflow_input"), Some(json!({"q": "hi"})));
        assert_eq!(restored.intermediate_results(), ctx.intermediate_results());
        assert_eq!(restored.executed_tools(), vec!["search"]);
        assert_eq!(restored.agent_output("writer"), Some(json!("draft")));
        assert_eq!(restored.errors(), ctx.errors());
        assert_eq!(restored.step_timing("s1"), Some(1.5));
        assert_eq!(restored.phase(), ExecutionPhase::InputProcessing);
    }

    #[tokio::test]
    async fn concurrent_appends_are_kept() {
        let ctx = Arc::new(ExecutionContext::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.add_intermediate_result(format!("s{i}"), json!(i), Map::new());
                ctx.record_step_timing(format!("s{i}"), Duration::from_millis(i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ctx.intermediate_results().len(), 16);
        assert_eq!(ctx.step_timings().len(), 16);
        assert_eq!(ctx.summary().intermediate_results, 16);
    }
}
