use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use loom_broker::{InMemoryBroker, RunScheduler, ScheduleOutcome, SqliteBroker, WorkerDispatchLoop};
use loom_core::config::{BrokerConfig, TopicsConfig};
use loom_core::traits::MessageBroker;
use loom_core::types::RunRequest;
use loom_test_utils::{FailingBroker, HandledRun, RecordingRunHandler};

fn spawn_worker(
    broker: Arc<dyn MessageBroker>,
    handler: Arc<RecordingRunHandler>,
) -> (CancellationToken, tokio::task::JoinHandle<loom_core::Result<()>>) {
    let cancel = CancellationToken::new();
    let worker = WorkerDispatchLoop::new(broker, handler, &TopicsConfig::default())
        .with_retry_interval(Duration::from_millis(10));
    let handle = tokio::spawn(worker.run(cancel.clone()));
    (cancel, handle)
}

#[tokio::test]
async fn published_workflow_request_reaches_handler() {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(RecordingRunHandler::new());
    let (cancel, handle) = spawn_worker(broker.clone(), handler.clone());

    broker
        .send(
            "workflow-requests",
            json!({"type": "workflow.run.requested", "run_id": "r1", "workflow_id": "wf1", "payload": {"a": 1}}),
        )
        .await
        .unwrap();

    assert!(handler.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(
        handler.calls()[0],
        HandledRun::Workflow {
            run_id: "r1".into(),
            workflow_id: "wf1".into(),
            payload: json!({"a": 1}),
        }
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_event_does_not_stop_the_topic() {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(RecordingRunHandler::failing_on(["bad"]));
    let (cancel, handle) = spawn_worker(broker.clone(), handler.clone());

    let topic = "workflow-requests";
    broker.send(topic, RunRequest::workflow("bad", "wf", json!({})).to_event()).await.unwrap();
    broker.send(topic, json!({"type": "garbage"})).await.unwrap();
    broker.send(topic, RunRequest::workflow("good", "wf", json!({})).to_event()).await.unwrap();

    assert!(handler.wait_for(2, Duration::from_secs(2)).await);
    assert_eq!(handler.run_ids(), vec!["bad".to_string(), "good".to_string()]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_topic() {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(RecordingRunHandler::panicking_on(["boom"]));
    let (cancel, handle) = spawn_worker(broker.clone(), handler.clone());

    let topic = "agent-requests";
    broker.send(topic, RunRequest::agent("boom", "bot", json!({})).to_event()).await.unwrap();
    broker.send(topic, RunRequest::agent("after", "bot", json!({})).to_event()).await.unwrap();

    assert!(handler.wait_for(2, Duration::from_secs(2)).await);
    assert_eq!(handler.run_ids(), vec!["boom".to_string(), "after".to_string()]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn topics_are_consumed_independently() {
    let broker: Arc<dyn MessageBroker> = Arc::new(InMemoryBroker::new());
    let handler = Arc::new(RecordingRunHandler::new());
    let (cancel, handle) = spawn_worker(broker.clone(), handler.clone());

    let scheduler = RunScheduler::new(broker.clone(), handler.clone(), TopicsConfig::default());
    assert_eq!(scheduler.schedule_agent("a1", "bot", json!({})).await, ScheduleOutcome::Queued);
    assert_eq!(scheduler.schedule_workflow("w1", "wf", json!({})).await, ScheduleOutcome::Queued);

    assert!(handler.wait_for(2, Duration::from_secs(2)).await);
    let mut ids = handler.run_ids();
    ids.sort();
    assert_eq!(ids, vec!["a1".to_string(), "w1".to_string()]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn broker_failure_runs_request_inline() {
    let handler = Arc::new(RecordingRunHandler::new());
    let scheduler = RunScheduler::new(Arc::new(FailingBroker), handler.clone(), TopicsConfig::default());

    let outcome = scheduler.schedule_workflow("r1", "wf1", json!({"a": 1})).await;
    assert_eq!(outcome, ScheduleOutcome::ExecutedInline { error: None });
    assert_eq!(
        handler.calls(),
        vec![HandledRun::Workflow {
            run_id: "r1".into(),
            workflow_id: "wf1".into(),
            payload: json!({"a": 1}),
        }]
    );
}

#[tokio::test]
async fn worker_fails_fast_when_it_cannot_subscribe() {
    let handler = Arc::new(RecordingRunHandler::new());
    let worker = WorkerDispatchLoop::new(Arc::new(FailingBroker), handler, &TopicsConfig::default());
    assert!(worker.run(CancellationToken::new()).await.is_err());
}

#[tokio::test]
async fn sqlite_backend_delivers_through_worker() {
    let dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig {
        poll_interval_ms: 10,
        ..BrokerConfig::default()
    };
    let broker: Arc<dyn MessageBroker> = Arc::new(SqliteBroker::open(&dir.path().join("broker.db"), &config).unwrap());

    for i in 0..5 {
        broker
            .send("workflow-requests", RunRequest::workflow(format!("r{i}"), "wf", json!({})).to_event())
            .await
            .unwrap();
    }

    let handler = Arc::new(RecordingRunHandler::new());
    let (cancel, handle) = spawn_worker(broker.clone(), handler.clone());
    assert!(handler.wait_for(5, Duration::from_secs(5)).await);

    let mut ids = handler.run_ids();
    ids.sort();
    assert_eq!(ids, (0..5).map(|i| format!("r{i}")).collect::<Vec<_>>());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
