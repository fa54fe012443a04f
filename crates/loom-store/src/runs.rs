use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use loom_core::error::{LoomError, Result};
use loom_core::traits::RunResultSink;
use loom_core::types::WorkflowStatus;
use loom_core::workflow::WorkflowExecutionResult;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS run_results (
        run_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        result TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_run_results_updated
        ON run_results(updated_at);";

fn db_err(e: rusqlite::Error) -> LoomError {
    LoomError::Database(e.to_string())
}

/// One row of [`SqliteRunStore::list_runs`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub status: String,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed run-result sink. A second result for the same run id
/// replaces the first.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LoomError::Database(format!("Failed to create db directory: {}", e)))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| LoomError::Database(e.to_string()))
    }

    pub fn save(&self, run_id: &str, result: &WorkflowExecutionResult) -> Result<()> {
        let body = serde_json::to_string(result)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_results (run_id, workflow_id, execution_id, status, error, result, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(run_id) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                execution_id = excluded.execution_id,
                status = excluded.status,
                error = excluded.error,
                result = excluded.result,
                updated_at = excluded.updated_at",
            params![
                run_id,
                result.workflow_id,
                result.execution_id,
                result.status.as_str(),
                result.error,
                body,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> Result<Option<WorkflowExecutionResult>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT result FROM run_results WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated runs first, optionally filtered by status.
    pub fn list_runs(&self, status: Option<WorkflowStatus>, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, workflow_id, execution_id, status, error, updated_at
                 FROM run_results
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY updated_at DESC, run_id ASC
                 LIMIT ?2",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![status.map(|s| s.as_str()), limit as i64], |row| {
                let updated: String = row.get(5)?;
                Ok(RunSummary {
                    run_id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    execution_id: row.get(2)?,
                    status: row.get(3)?,
                    error: row.get(4)?,
                    updated_at: DateTime::parse_from_rfc3339(&updated)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(db_err)?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }
}

impl RunResultSink for SqliteRunStore {
    fn save_run_result<'a>(
        &'a self,
        run_id: &'a str,
        result: &'a WorkflowExecutionResult,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.save(run_id, result) })
    }
}
