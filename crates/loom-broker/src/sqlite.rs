use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use loom_core::config::BrokerConfig;
use loom_core::error::{LoomError, Result};
use loom_core::traits::{MessageBroker, Subscription};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        log_offset INTEGER NOT NULL,
        key TEXT,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(topic, partition_id, log_offset)
    );

    CREATE TABLE IF NOT EXISTS consumer_offsets (
        group_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        next_offset INTEGER NOT NULL,
        PRIMARY KEY (group_id, topic, partition_id)
    );";

fn unavailable(e: rusqlite::Error) -> LoomError {
    LoomError::BrokerUnavailable(e.to_string())
}

/// FNV-1a, so a key maps to the same partition across restarts.
fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

/// Durable partitioned log in SQLite with consumer-group offsets.
///
/// Events are keyed by their `run_id` (when present) to pick a partition,
/// so requests for one run stay ordered. Delivery is at-least-once: an
/// event's offset is committed only when its consumer asks for the next
/// one. There is no ordering across partitions.
pub struct SqliteBroker {
    conn: Arc<Mutex<Connection>>,
    partitions: u32,
    group: String,
    poll_interval: Duration,
}

impl SqliteBroker {
    /// Open or create the broker database at `path`.
    pub fn open(path: &Path, config: &BrokerConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LoomError::BrokerUnavailable(format!("Failed to create broker directory: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;
        debug!(path = %path.display(), partitions = config.partitions, "SQLite broker opened");
        Self::from_connection(conn, config)
    }

    /// In-memory log (for testing).
    pub fn in_memory(config: &BrokerConfig) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(unavailable)?, config)
    }

    fn from_connection(conn: Connection, config: &BrokerConfig) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            partitions: config.partitions.max(1),
            group: config.consumer_group.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    fn append(&self, topic: &str, event: &Value) -> Result<u32> {
        let key = event.get("run_id").and_then(Value::as_str).map(String::from);
        let partition = match &key {
            Some(k) => partition_for(k, self.partitions),
            None => partition_for(&Utc::now().timestamp_nanos_opt().unwrap_or(0).to_string(), self.partitions),
        };
        let payload = serde_json::to_string(event)?;

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(unavailable)?;
        let offset: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(log_offset) + 1, 0) FROM messages WHERE topic = ?1 AND partition_id = ?2",
                params![topic, partition],
                |row| row.get(0),
            )
            .map_err(unavailable)?;
        tx.execute(
            "INSERT INTO messages (topic, partition_id, log_offset, key, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![topic, partition, offset, key, payload, Utc::now().to_rfc3339()],
        )
        .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;
        Ok(partition)
    }

    /// Committed offset of the group on one partition.
    pub fn committed_offset(&self, topic: &str, partition: u32) -> Result<i64> {
        let conn = lock(&self.conn)?;
        committed(&conn, &self.group, topic, partition)
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| LoomError::BrokerUnavailable(e.to_string()))
}

fn committed(conn: &Connection, group: &str, topic: &str, partition: u32) -> Result<i64> {
    let offset: Option<i64> = conn
        .query_row(
            "SELECT next_offset FROM consumer_offsets WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
            params![group, topic, partition],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;
    Ok(offset.unwrap_or(0))
}

impl MessageBroker for SqliteBroker {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn send(&self, topic: &str, event: Value) -> BoxFuture<'_, Result<()>> {
        let result = self.append(topic, &event);
        if let Ok(partition) = &result {
            debug!(topic, partition, "Event appended");
        }
        Box::pin(async move { result.map(|_| ()) })
    }

    fn subscribe(&self, topic: &str) -> BoxFuture<'_, Result<Box<dyn Subscription>>> {
        let sub: Box<dyn Subscription> = Box::new(SqliteSubscription {
            conn: self.conn.clone(),
            topic: topic.to_string(),
            group: self.group.clone(),
            partitions: self.partitions,
            poll_interval: self.poll_interval,
            next_partition: 0,
            uncommitted: None,
        });
        Box::pin(async move { Ok(sub) })
    }
}

/// Consumes every partition of one topic for one group, round-robin.
struct SqliteSubscription {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    group: String,
    partitions: u32,
    poll_interval: Duration,
    next_partition: u32,
    /// (partition, offset) delivered but not yet committed.
    uncommitted: Option<(u32, i64)>,
}

impl SqliteSubscription {
    fn commit(&mut self, conn: &Connection) -> Result<()> {
        let Some((partition, offset)) = self.uncommitted else {
            return Ok(());
        };
        conn.execute(
            "INSERT INTO consumer_offsets (group_id, topic, partition_id, next_offset)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id, topic, partition_id)
             DO UPDATE SET next_offset = MAX(next_offset, excluded.next_offset)",
            params![self.group, self.topic, partition, offset + 1],
        )
        .map_err(unavailable)?;
        self.uncommitted = None;
        Ok(())
    }

    /// Commit the previous delivery, then look for the next one.
    fn poll_once(&mut self) -> Result<Option<Value>> {
        let shared = self.conn.clone();
        let conn = lock(&shared)?;
        self.commit(&conn)?;

        for i in 0..self.partitions {
            let partition = (self.next_partition + i) % self.partitions;
            let from = committed(&conn, &self.group, &self.topic, partition)?;
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT log_offset, payload FROM messages
                     WHERE topic = ?1 AND partition_id = ?2 AND log_offset >= ?3
                     ORDER BY log_offset ASC LIMIT 1",
                    params![self.topic, partition, from],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(unavailable)?;

            if let Some((offset, payload)) = row {
                self.next_partition = (partition + 1) % self.partitions;
                self.uncommitted = Some((partition, offset));
                return match serde_json::from_str(&payload) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        warn!(topic = %self.topic, partition, offset, error = %e, "Undecodable payload");
                        Ok(Some(Value::String(payload)))
                    }
                };
            }
        }
        Ok(None)
    }
}

impl Subscription for SqliteSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Value>>> {
        Box::pin(async move {
            loop {
                if let Some(event) = self.poll_once()? {
                    return Ok(Some(event));
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }
}
