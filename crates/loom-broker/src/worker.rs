use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loom_core::config::TopicsConfig;
use loom_core::error::{panic_message, LoomError, Result};
use loom_core::traits::{MessageBroker, RunHandler, Subscription};
use loom_core::types::RunRequest;

/// Which kind of request a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Workflow,
    Agent,
}

/// Consumes run requests from the broker and hands them to a [`RunHandler`].
///
/// One task per topic. A failing or panicking event is logged and skipped;
/// only cancellation or a closed topic ends a task.
pub struct WorkerDispatchLoop {
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn RunHandler>,
    routes: Vec<(String, RequestKind)>,
    retry_interval: Duration,
}

impl WorkerDispatchLoop {
    pub fn new(broker: Arc<dyn MessageBroker>, handler: Arc<dyn RunHandler>, topics: &TopicsConfig) -> Self {
        Self {
            broker,
            handler,
            routes: vec![
                (topics.workflow_requests.clone(), RequestKind::Workflow),
                (topics.agent_requests.clone(), RequestKind::Agent),
            ],
            retry_interval: Duration::from_millis(200),
        }
    }

    /// Wait this long after a receive error before trying again.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Subscribe to every topic and consume until cancelled.
    ///
    /// Fails only if a subscription cannot be opened.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        for (topic, kind) in &self.routes {
            let sub = self.broker.subscribe(topic).await?;
            info!(topic = %topic, broker = %self.broker.name(), "Worker subscribed");
            tasks.spawn(consume(
                sub,
                *kind,
                self.handler.clone(),
                self.retry_interval,
                cancel.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker stopped");
        Ok(())
    }
}

async fn consume(
    mut sub: Box<dyn Subscription>,
    kind: RequestKind,
    handler: Arc<dyn RunHandler>,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    let topic = sub.topic().to_string();
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(topic = %topic, "Consumer cancelled");
                break;
            }
            received = sub.recv() => received,
        };

        match received {
            Ok(Some(event)) => {
                // A panicking handler fails this event only; the topic keeps consuming.
                match AssertUnwindSafe(dispatch(handler.as_ref(), kind, event))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(topic = %topic, error = %e, "Run request failed"),
                    Err(payload) => error!(
                        topic = %topic,
                        panic = %panic_message(&*payload),
                        "Run request handler panicked"
                    ),
                }
            }
            Ok(None) => {
                info!(topic = %topic, "Topic closed, consumer stopping");
                break;
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Receive failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }
    }
}

/// Decode one wire event and run it.
pub async fn dispatch(handler: &dyn RunHandler, kind: RequestKind, event: Value) -> Result<()> {
    let request = RunRequest::from_event(event)?;
    match (kind, request) {
        (
            RequestKind::Workflow,
            RunRequest::Workflow {
                run_id,
                workflow_id,
                payload,
            },
        ) => {
            info!(run_id = %run_id, workflow_id = %workflow_id, "Dispatching workflow run");
            handler.run_workflow(&run_id, &workflow_id, payload).await
        }
        (
            RequestKind::Agent,
            RunRequest::Agent {
                run_id,
                agent_id,
                payload,
            },
        ) => {
            info!(run_id = %run_id, agent_id = %agent_id, "Dispatching agent run");
            handler.run_agent(&run_id, &agent_id, payload).await
        }
        (kind, request) => Err(LoomError::Validation(format!(
            "{} event {} on a {:?} topic",
            request.event_type(),
            request.run_id(),
            kind
        ))),
    }
}
