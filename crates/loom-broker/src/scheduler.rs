use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use loom_core::config::TopicsConfig;
use loom_core::traits::{MessageBroker, RunHandler};
use loom_core::types::RunRequest;

/// How a scheduled request was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Published; a worker will pick it up.
    Queued,
    /// The broker refused the event, so the request ran in-process.
    /// `error` is the run's own failure, if any.
    ExecutedInline { error: Option<String> },
}

/// Publishes run requests, falling back to running them in-process when
/// the broker cannot take them. A request is never dropped.
pub struct RunScheduler {
    broker: Arc<dyn MessageBroker>,
    fallback: Arc<dyn RunHandler>,
    topics: TopicsConfig,
}

impl RunScheduler {
    pub fn new(broker: Arc<dyn MessageBroker>, fallback: Arc<dyn RunHandler>, topics: TopicsConfig) -> Self {
        Self {
            broker,
            fallback,
            topics,
        }
    }

    pub async fn schedule_workflow(&self, run_id: &str, workflow_id: &str, payload: Value) -> ScheduleOutcome {
        self.schedule(RunRequest::workflow(run_id, workflow_id, payload)).await
    }

    pub async fn schedule_agent(&self, run_id: &str, agent_id: &str, payload: Value) -> ScheduleOutcome {
        self.schedule(RunRequest::agent(run_id, agent_id, payload)).await
    }

    pub async fn schedule(&self, request: RunRequest) -> ScheduleOutcome {
        let topic = match &request {
            RunRequest::Workflow { .. } => &self.topics.workflow_requests,
            RunRequest::Agent { .. } => &self.topics.agent_requests,
        };

        match self.broker.send(topic, request.to_event()).await {
            Ok(()) => {
                info!(run_id = %request.run_id(), topic = %topic, "Run request queued");
                return ScheduleOutcome::Queued;
            }
            Err(e) => warn!(
                run_id = %request.run_id(),
                topic = %topic,
                broker = %self.broker.name(),
                error = %e,
                "Publish failed, running request in-process"
            ),
        }

        let result = match request {
            RunRequest::Workflow {
                run_id,
                workflow_id,
                payload,
            } => self.fallback.run_workflow(&run_id, &workflow_id, payload).await,
            RunRequest::Agent {
                run_id,
                agent_id,
                payload,
            } => self.fallback.run_agent(&run_id, &agent_id, payload).await,
        };
        let error = result.err().map(|e| {
            error!(error = %e, "Inline run failed");
            e.to_string()
        });
        ScheduleOutcome::ExecutedInline { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use loom_test_utils::{FailingBroker, HandledRun, RecordingRunHandler};
    use serde_json::json;

    #[tokio::test]
    async fn test_queues_when_broker_accepts() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(RecordingRunHandler::new());
        let scheduler = RunScheduler::new(broker.clone(), handler.clone(), TopicsConfig::default());

        let outcome = scheduler.schedule_agent("r1", "bot", json!({"q": 1})).await;
        assert_eq!(outcome, ScheduleOutcome::Queued);
        assert!(handler.calls().is_empty());

        let mut sub = broker.subscribe("agent-requests").await.unwrap();
        let event = sub.recv().await.unwrap().unwrap();
        assert_eq!(event["type"], "agent.run.requested");
        assert_eq!(event["agent_id"], "bot");
    }

    #[tokio::test]
    async fn test_inline_error_is_reported() {
        let handler = Arc::new(RecordingRunHandler::failing_on(["r2"]));
        let scheduler = RunScheduler::new(Arc::new(FailingBroker), handler.clone(), TopicsConfig::default());

        match scheduler.schedule_workflow("r2", "wf", json!({})).await {
            ScheduleOutcome::ExecutedInline { error: Some(e) } => assert!(e.contains("r2")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            handler.calls(),
            vec![HandledRun::Workflow {
                run_id: "r2".into(),
                workflow_id: "wf".into(),
                payload: json!({}),
            }]
        );
    }
}
