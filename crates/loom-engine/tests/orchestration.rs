use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use loom_core::event::EventBus;
use loom_core::id::IdGenerator;
use loom_core::traits::RunHandler;
use loom_core::types::WorkflowStatus;
use loom_engine::{ExecutorRegistry, FnExecutor, Orchestrator, RunLogger};
use loom_store::{FileDefinitionStore, SqliteRunStore};

const PIPELINE: &str = r#"
id = "pipeline"
name = "Pipeline"

[[steps]]
id = "fetch"
step_type = "agent"
config = { agent_name = "fetcher" }

[[steps]]
id = "tag"
step_type = "tool"
dependencies = ["fetch"]
config = { tool_name = "merge", tool_params = { tagged = true } }

[[steps]]
id = "route"
step_type = "condition"
dependencies = ["tag"]
config = { condition = "input.count > 2", true_value = "big", false_value = "small" }
"#;

fn agents() -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::agents();
    registry.register(FnExecutor::new("fetcher", |_, input, _| {
        Ok(json!({ "count": input["items"].as_array().map_or(0, |a| a.len()) }))
    }));
    Arc::new(registry)
}

#[tokio::test]
async fn file_definition_runs_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let defs = dir.path().join("workflows");
    std::fs::create_dir_all(&defs).unwrap();
    std::fs::write(defs.join("pipeline.toml"), PIPELINE).unwrap();

    let store = Arc::new(SqliteRunStore::open(&dir.path().join("runs.db")).unwrap());
    let bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();
    let logs = dir.path().join("logs");
    let logger = tokio::spawn(RunLogger::new(logs.clone(), 3).run(bus.clone(), cancel.clone()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let orchestrator = Orchestrator::new(
        Arc::new(FileDefinitionStore::new(&defs)),
        agents(),
        Arc::new(ExecutorRegistry::with_builtin_tools()),
        Arc::new(IdGenerator::new("RUN")),
    )
    .with_sink(store.clone())
    .with_event_bus(bus.clone());

    orchestrator
        .run_workflow("run-big", "pipeline", json!({ "items": [1, 2, 3] }))
        .await
        .unwrap();
    orchestrator
        .run_workflow("run-small", "pipeline", json!({ "items": [] }))
        .await
        .unwrap();

    let big = store.load_run("run-big").unwrap().unwrap();
    assert_eq!(big.status, WorkflowStatus::Completed);
    assert_eq!(big.output, json!("big"));
    assert_eq!(big.step_results["step_outputs"]["tag"], json!({ "count": 3, "tagged": true }));

    let small = store.load_run("run-small").unwrap().unwrap();
    assert_eq!(small.output, json!("small"));

    // Missing definitions are recorded as failed runs.
    assert!(orchestrator.run_workflow("run-missing", "nope", json!({})).await.is_err());
    let missing = store.load_run("run-missing").unwrap().unwrap();
    assert_eq!(missing.status, WorkflowStatus::Failed);
    assert_eq!(store.list_runs(None, 10).unwrap().len(), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    logger.await.unwrap();

    let log_file = logs.join(format!("{}.jsonl", big.execution_id));
    let content = std::fs::read_to_string(log_file).unwrap();
    assert!(content.lines().any(|l| l.contains("step_completed")));
    assert!(content.lines().last().unwrap().contains("run_finished"));
}
