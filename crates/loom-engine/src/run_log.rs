use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use loom_core::event::EventBus;
use loom_core::types::EngineEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{execution_id}.jsonl`. State-machine transitions go to
/// `{log_dir}/{machine_id}.jsonl`. Lines are flushed as they are written,
/// so a crash loses at most the entry in flight.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run lifecycle, 2=+batches, 3=+steps and transitions.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Run the logger until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut rx = event_bus.subscribe();
        let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            let key = entry.execution_id.clone();
                            if let Err(e) = self.write_entry(&mut writers, &entry).await {
                                error!(error = %e, execution_id = %key, "Failed to write log entry");
                            }
                            // Nothing follows a terminal event for an execution.
                            if matches!(event, EngineEvent::RunFinished { .. }) {
                                if let Some(mut writer) = writers.remove(&key) {
                                    writer.flush().await.ok();
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in writers.drain() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn write_entry(
        &self,
        writers: &mut HashMap<String, BufWriter<File>>,
        entry: &LogEntry,
    ) -> std::io::Result<()> {
        if !writers.contains_key(&entry.execution_id) {
            let file = open_append(&self.log_path(&entry.execution_id)).await?;
            writers.insert(entry.execution_id.clone(), BufWriter::new(file));
        }
        let Some(writer) = writers.get_mut(&entry.execution_id) else {
            return Ok(());
        };
        let line = format!("{}\n", serde_json::to_string(entry)?);
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Convert an EngineEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let entry = |execution_id: &str, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: execution_id.to_string(),
            event_type: event.name(),
            detail,
        };

        match event {
            // L1: run lifecycle
            EngineEvent::RunStarted {
                execution_id,
                workflow_id,
            } => Some(entry(
                execution_id,
                Some(serde_json::json!({ "workflow_id": workflow_id })),
            )),
            EngineEvent::RunFinished {
                execution_id,
                workflow_id,
                status,
                duration_ms,
                error,
            } => Some(entry(
                execution_id,
                Some(serde_json::json!({
                    "workflow_id": workflow_id,
                    "status": status,
                    "duration_ms": duration_ms,
                    "error": error,
                })),
            )),

            // L2: batches
            EngineEvent::BatchStarted {
                execution_id,
                index,
                steps,
            } if self.level >= 2 => Some(entry(
                execution_id,
                Some(serde_json::json!({ "index": index, "steps": steps })),
            )),

            // L3: steps and transitions
            EngineEvent::StepCompleted {
                execution_id,
                step_id,
                duration_ms,
            } if self.level >= 3 => Some(entry(
                execution_id,
                Some(serde_json::json!({ "step_id": step_id, "duration_ms": duration_ms })),
            )),
            EngineEvent::StepFailed {
                execution_id,
                step_id,
                error,
            } if self.level >= 3 => Some(entry(
                execution_id,
                Some(serde_json::json!({ "step_id": step_id, "error": truncate_str(error, 500) })),
            )),
            EngineEvent::TransitionFired {
                machine_id,
                transition_id,
                from,
                to,
                event,
            } if self.level >= 3 => Some(entry(
                machine_id,
                Some(serde_json::json!({
                    "transition_id": transition_id,
                    "from": from,
                    "to": to,
                    "event": event,
                })),
            )),

            _ => None,
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Truncate a string for logging.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::types::WorkflowStatus;

    fn step_completed() -> EngineEvent {
        EngineEvent::StepCompleted {
            execution_id: "exec-1".into(),
            step_id: "s".into(),
            duration_ms: 3,
        }
    }

    #[test]
    fn test_event_level_filtering() {
        let started = EngineEvent::RunStarted {
            execution_id: "exec-1".into(),
            workflow_id: "wf".into(),
        };
        let batch = EngineEvent::BatchStarted {
            execution_id: "exec-1".into(),
            index: 0,
            steps: vec!["a".into()],
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&started).is_some());
        assert!(l1.event_to_entry(&batch).is_none());
        assert!(l1.event_to_entry(&step_completed()).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&batch).is_some());
        assert!(l2.event_to_entry(&step_completed()).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry(&step_completed()).is_some());
    }

    #[test]
    fn test_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&EngineEvent::RunFinished {
                execution_id: "exec-1".into(),
                workflow_id: "wf".into(),
                status: WorkflowStatus::Failed,
                duration_ms: 12,
                error: Some("boom".into()),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"run_finished\""));
        assert!(json.contains("\"status\":\"failed\""));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 50), "short");
    }

    #[tokio::test]
    async fn test_writes_one_file_per_execution() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 3);
        let handle = tokio::spawn(logger.run(bus.clone(), cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.publish(EngineEvent::RunStarted {
            execution_id: "exec-1".into(),
            workflow_id: "wf".into(),
        });
        bus.publish(step_completed());
        bus.publish(EngineEvent::RunFinished {
            execution_id: "exec-1".into(),
            workflow_id: "wf".into(),
            status: WorkflowStatus::Completed,
            duration_ms: 5,
            error: None,
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("exec-1.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("run_started"));
        assert!(lines[2].contains("run_finished"));
    }
}
