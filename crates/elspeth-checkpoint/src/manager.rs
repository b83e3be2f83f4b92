//! Checkpoint manager: periodic persistence of processed-token offsets
//! and aggregation state, throttled by cadence, with resume reading back
//! only the latest checkpoint for a run.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use elspeth_core::config::CheckpointConfig;
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::state::Checkpoint;

/// Operations the orchestrator issues against the checkpoint store.
/// Checkpoints are append-only; `latest` always reads the most recently
/// written row for a run.
#[async_trait]
pub trait CheckpointManager: Send + Sync {
    /// Called after each completed terminal commit. Internally throttled;
    /// most calls are no-ops that only update in-memory counters.
    async fn maybe_checkpoint(&self, checkpoint: Checkpoint) -> Result<bool, ElspethError>;

    /// Peek whether the next `maybe_checkpoint` call would actually write,
    /// without mutating cadence state. Lets the caller flush whatever a
    /// checkpoint's offset depends on (e.g. pending sink rows) before a
    /// checkpoint that is about to fire, so the written offset never lands
    /// ahead of what that dependent state has committed.
    fn would_checkpoint(&self) -> bool;

    /// Force a write regardless of cadence, e.g. on graceful shutdown.
    async fn checkpoint_now(&self, checkpoint: Checkpoint) -> Result<(), ElspethError>;

    /// Called at clean completion.
    async fn delete(&self, run_id: Uuid) -> Result<(), ElspethError>;

    /// Read for resume.
    async fn latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, ElspethError>;
}

struct ThrottleState {
    rows_since_last: u64,
    last_written: Instant,
}

/// `rusqlite`-backed checkpoint store. A single blocking connection guarded
/// by a mutex; writes happen off the async executor via `spawn_blocking`,
/// matching the pattern used for the audit store.
pub struct SqliteCheckpointManager {
    conn: Arc<Mutex<Connection>>,
    config: CheckpointConfig,
    throttle: Mutex<ThrottleState>,
}

impl SqliteCheckpointManager {
    pub fn open(path: &std::path::Path, config: CheckpointConfig) -> Result<Self, ElspethError> {
        let conn = Connection::open(path).map_err(infra)?;
        Self::init_schema(&conn)?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn open_in_memory(config: CheckpointConfig) -> Result<Self, ElspethError> {
        let conn = Connection::open_in_memory().map_err(infra)?;
        Self::init_schema(&conn)?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: CheckpointConfig) -> Self {
        SqliteCheckpointManager {
            conn: Arc::new(Mutex::new(conn)),
            config,
            throttle: Mutex::new(ThrottleState { rows_since_last: 0, last_written: Instant::now() }),
        }
    }

    fn init_schema(conn: &Connection) -> Result<(), ElspethError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                written_at TEXT NOT NULL,
                payload_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id);
            "#,
        )
        .map_err(infra)
    }

    /// Due if either cadence threshold has been crossed since the last
    /// write. Resets the counters when it fires.
    fn due(&self) -> bool {
        let mut throttle = self.throttle.lock().expect("poisoned");
        throttle.rows_since_last += 1;
        let rows_due = throttle.rows_since_last >= self.config.every_n_rows;
        let time_due = throttle.last_written.elapsed() >= Duration::from_secs(self.config.every_n_seconds);
        if rows_due || time_due {
            throttle.rows_since_last = 0;
            throttle.last_written = Instant::now();
            true
        } else {
            false
        }
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<(), ElspethError> {
        tracing::debug!(run_id = %checkpoint.run_id, last_source_offset = checkpoint.last_source_offset, "writing checkpoint");
        let payload = serde_json::to_string(&checkpoint)
            .map_err(|e| ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("checkpoint serialization failed: {e}"), false)))?;
        let conn = self.conn.clone();
        let run_id = checkpoint.run_id.to_string();
        let written_at = checkpoint.written_at.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("checkpoint connection mutex poisoned");
            guard.execute(
                "INSERT INTO checkpoints (run_id, written_at, payload_json) VALUES (?1, ?2, ?3)",
                params![run_id, written_at, payload],
            )
        })
        .await
        .map_err(|e| ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("checkpoint task join error: {e}"), false)))?
        .map_err(infra)?;
        Ok(())
    }
}

fn infra(e: rusqlite::Error) -> ElspethError {
    ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("checkpoint store error: {e}"), false))
}

#[async_trait]
impl CheckpointManager for SqliteCheckpointManager {
    async fn maybe_checkpoint(&self, checkpoint: Checkpoint) -> Result<bool, ElspethError> {
        if !self.due() {
            return Ok(false);
        }
        self.write(checkpoint).await?;
        Ok(true)
    }

    fn would_checkpoint(&self) -> bool {
        let throttle = self.throttle.lock().expect("poisoned");
        let rows_due = throttle.rows_since_last + 1 >= self.config.every_n_rows;
        let time_due = throttle.last_written.elapsed() >= Duration::from_secs(self.config.every_n_seconds);
        rows_due || time_due
    }

    async fn checkpoint_now(&self, checkpoint: Checkpoint) -> Result<(), ElspethError> {
        self.write(checkpoint).await?;
        let mut throttle = self.throttle.lock().expect("poisoned");
        throttle.rows_since_last = 0;
        throttle.last_written = Instant::now();
        Ok(())
    }

    async fn delete(&self, run_id: Uuid) -> Result<(), ElspethError> {
        tracing::debug!(run_id = %run_id, "deleting checkpoints for completed run");
        let conn = self.conn.clone();
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("checkpoint connection mutex poisoned");
            guard.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
        })
        .await
        .map_err(|e| ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("checkpoint task join error: {e}"), false)))?
        .map_err(infra)?;
        Ok(())
    }

    async fn latest(&self, run_id: Uuid) -> Result<Option<Checkpoint>, ElspethError> {
        let conn = self.conn.clone();
        let run_id_str = run_id.to_string();
        let payload: Option<String> = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("checkpoint connection mutex poisoned");
            guard.query_row(
                "SELECT payload_json FROM checkpoints WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id_str],
                |row| row.get(0),
            )
        })
        .await
        .map_err(|e| ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("checkpoint task join error: {e}"), false)))?
        .map(Some)
        .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
        .map_err(infra)?;

        match payload {
            None => Ok(None),
            Some(json) => {
                let checkpoint: Checkpoint = serde_json::from_str(&json).map_err(|e| {
                    ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("checkpoint deserialization failed: {e}"), false))
                })?;
                Ok(Some(checkpoint))
            }
        }
    }
}
