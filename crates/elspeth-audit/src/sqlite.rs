//! SQLite-backed `AuditRecorder`. Append-only tables; reads used for
//! resume (max call index, incomplete batches) and for audit export.
//! Connection access is serialized behind a blocking mutex and
//! dispatched via `spawn_blocking`, matching the engine's single-threaded
//! cooperative scheduling model — the store itself is the only place a
//! blocking call briefly escapes the async executor.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elspeth_core::audit::{
    AuditExport, AuditRecorder, BatchRecord, BatchStatus, ExternalCallRecord, NodeKind, NodeRegistration, NodeStateRecord,
    NodeStateStatus, RoutingEventRecord, RunRecord, RunStatus, SecretResolutionRecord, ValidationErrorRecord,
};
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use rusqlite::{params, Connection};
use uuid::Uuid;

pub struct SqliteAuditRecorder {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditRecorder {
    pub fn open(path: &std::path::Path) -> Result<Self, ElspethError> {
        let conn = Connection::open(path).map_err(infra)?;
        Self::init_schema(&conn)?;
        Ok(SqliteAuditRecorder { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self, ElspethError> {
        let conn = Connection::open_in_memory().map_err(infra)?;
        Self::init_schema(&conn)?;
        Ok(SqliteAuditRecorder { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<(), ElspethError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                config_fingerprint TEXT NOT NULL,
                status TEXT
            );
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                plugin_name TEXT NOT NULL,
                input_schema_json TEXT,
                output_schema_json TEXT
            );
            CREATE TABLE IF NOT EXISTS node_states (
                state_id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                input_hash TEXT,
                output_hash TEXT,
                duration_ms INTEGER NOT NULL,
                started_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS external_calls (
                state_id INTEGER NOT NULL,
                call_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                request_fingerprint TEXT NOT NULL,
                response_fingerprint TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                retry_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS routing_events (
                state_id INTEGER NOT NULL,
                from_node TEXT NOT NULL,
                to_node TEXT NOT NULL,
                label TEXT,
                reason TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                member_count INTEGER NOT NULL,
                trigger_kind TEXT NOT NULL,
                members_json TEXT
            );
            CREATE TABLE IF NOT EXISTS secret_resolutions (
                run_id TEXT NOT NULL,
                env_var_name TEXT NOT NULL,
                source TEXT NOT NULL,
                vault_url TEXT,
                secret_name TEXT,
                fingerprint TEXT NOT NULL,
                latency_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS validation_errors (
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                token_id TEXT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL
            );
            "#,
        )
        .map_err(infra)
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, ElspethError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("audit connection mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("audit task join error: {e}"), false)))?
        .map_err(infra)
    }
}

fn infra(e: rusqlite::Error) -> ElspethError {
    ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("audit store error: {e}"), false))
}

fn node_kind_str(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Source => "source",
        NodeKind::Transform => "transform",
        NodeKind::Aggregation => "aggregation",
        NodeKind::Coalesce => "coalesce",
        NodeKind::Sink => "sink",
    }
}

fn status_str(status: NodeStateStatus) -> &'static str {
    match status {
        NodeStateStatus::Started => "started",
        NodeStateStatus::Completed => "completed",
        NodeStateStatus::Failed => "failed",
        NodeStateStatus::Routed => "routed",
        NodeStateStatus::Quarantined => "quarantined",
        NodeStateStatus::Discarded => "discarded",
        NodeStateStatus::Forked => "forked",
        NodeStateStatus::Coalesced => "coalesced",
        NodeStateStatus::Expanded => "expanded",
        NodeStateStatus::Buffered => "buffered",
        NodeStateStatus::ConsumedInBatch => "consumed_in_batch",
    }
}

fn batch_status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Draft => "draft",
        BatchStatus::Executing => "executing",
        BatchStatus::Completed => "completed",
        BatchStatus::Failed => "failed",
    }
}

fn parse_batch_status(s: &str) -> BatchStatus {
    match s {
        "draft" => BatchStatus::Draft,
        "executing" => BatchStatus::Executing,
        "completed" => BatchStatus::Completed,
        _ => BatchStatus::Failed,
    }
}

fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Interrupted => "interrupted",
    }
}

#[async_trait]
impl AuditRecorder for SqliteAuditRecorder {
    async fn begin_run(&self, record: RunRecord) -> Result<(), ElspethError> {
        tracing::debug!(run_id = %record.run_id, "audit: inserting run record");
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO runs (run_id, started_at, config_fingerprint, status) VALUES (?1, ?2, ?3, 'running')",
                params![record.run_id.to_string(), record.started_at.to_rfc3339(), record.config_fingerprint],
            )?;
            Ok(())
        })
        .await
    }

    async fn register_node(&self, node: NodeRegistration) -> Result<(), ElspethError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO nodes (node_id, kind, plugin_name, input_schema_json, output_schema_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![node.node_id, node_kind_str(node.kind), node.plugin_name, node.input_schema_json, node.output_schema_json],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_node_state(&self, record: NodeStateRecord) -> Result<i64, ElspethError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO node_states (run_id, token_id, node_id, status, input_hash, output_hash, duration_ms, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.run_id.to_string(),
                    record.token_id.to_string(),
                    record.node_id,
                    status_str(record.status),
                    record.input_hash,
                    record.output_hash,
                    record.duration_ms as i64,
                    record.started_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn record_external_call(&self, record: ExternalCallRecord) -> Result<(), ElspethError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO external_calls (state_id, call_index, kind, request_fingerprint, response_fingerprint, duration_ms, retry_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.state_id,
                    record.call_index as i64,
                    record.kind,
                    record.request_fingerprint,
                    record.response_fingerprint,
                    record.duration_ms as i64,
                    record.retry_count as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_routing(&self, record: RoutingEventRecord) -> Result<(), ElspethError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO routing_events (state_id, from_node, to_node, label, reason) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![record.state_id, record.from_node, record.to_node, record.label, record.reason],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_batch(&self, record: BatchRecord) -> Result<(), ElspethError> {
        tracing::debug!(batch_id = %record.batch_id, node_id = %record.node_id, status = ?record.status, "audit: recording batch");
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO batches (batch_id, node_id, status, started_at, completed_at, member_count, trigger_kind, members_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.batch_id,
                    record.node_id,
                    batch_status_str(record.status),
                    record.started_at.to_rfc3339(),
                    record.completed_at.map(|t: DateTime<Utc>| t.to_rfc3339()),
                    record.member_count as i64,
                    record.trigger_kind,
                    record.members_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_secret_resolution(&self, record: SecretResolutionRecord) -> Result<(), ElspethError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO secret_resolutions (run_id, env_var_name, source, vault_url, secret_name, fingerprint, latency_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.run_id.to_string(),
                    record.env_var_name,
                    record.source,
                    record.vault_url,
                    record.secret_name,
                    record.fingerprint,
                    record.latency_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_validation_error(&self, record: ValidationErrorRecord) -> Result<(), ElspethError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO validation_errors (run_id, node_id, token_id, kind, message) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.run_id.to_string(),
                    record.node_id,
                    record.token_id.map(|t| t.to_string()),
                    record.kind,
                    record.message,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_incomplete_batches(&self, run_id: Uuid) -> Result<Vec<BatchRecord>, ElspethError> {
        // Batches aren't scoped to run_id in the physical schema (a node_id
        // is unique within a run in practice); filter is a future extension
        // point once multi-run audit stores are shared.
        let _ = run_id;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_id, node_id, status, started_at, completed_at, member_count, trigger_kind, members_json FROM batches WHERE status IN ('draft', 'executing')",
            )?;
            let rows = stmt.query_map([], |row| {
                let started_at: String = row.get(3)?;
                let completed_at: Option<String> = row.get(4)?;
                Ok(BatchRecord {
                    batch_id: row.get(0)?,
                    node_id: row.get(1)?,
                    status: parse_batch_status(&row.get::<_, String>(2)?),
                    started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
                    completed_at: completed_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
                    member_count: row.get::<_, i64>(5)? as usize,
                    trigger_kind: row.get(6)?,
                    members_json: row.get(7)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    async fn update_batch_status(&self, batch_id: &str, status: BatchStatus) -> Result<(), ElspethError> {
        let batch_id = batch_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE batches SET status = ?1, completed_at = CASE WHEN ?1 IN ('completed','failed') THEN ?2 ELSE completed_at END WHERE batch_id = ?3",
                params![batch_status_str(status), Utc::now().to_rfc3339(), batch_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn retry_batch(&self, batch_id: &str) -> Result<(), ElspethError> {
        let batch_id = batch_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE batches SET status = 'draft', completed_at = NULL WHERE batch_id = ?1",
                params![batch_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn max_call_index(&self, run_id: Uuid, node_id: &str) -> Result<u64, ElspethError> {
        let node_id = node_id.to_string();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(ec.call_index) FROM external_calls ec JOIN node_states ns ON ec.state_id = ns.state_id WHERE ns.run_id = ?1 AND ns.node_id = ?2",
                params![run_id.to_string(), node_id],
                |row| row.get(0),
            )?;
            Ok(max.unwrap_or(0) as u64)
        })
        .await
    }

    async fn complete_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), ElspethError> {
        tracing::info!(run_id = %run_id, ?status, "audit: marking run complete");
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE runs SET status = ?1 WHERE run_id = ?2",
                params![run_status_str(status), run_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn export_records(&self, run_id: Uuid) -> Result<AuditExport, ElspethError> {
        self.with_conn(move |conn| {
            let run = conn
                .query_row(
                    "SELECT run_id, started_at, config_fingerprint FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                    |row| {
                        let started_at: String = row.get(1)?;
                        Ok(RunRecord {
                            run_id,
                            started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
                            config_fingerprint: row.get(2)?,
                        })
                    },
                )
                .ok();

            let mut nodes_stmt = conn.prepare("SELECT node_id, kind, plugin_name, input_schema_json, output_schema_json FROM nodes")?;
            let nodes = nodes_stmt
                .query_map([], |row| {
                    Ok(NodeRegistration {
                        node_id: row.get(0)?,
                        kind: parse_node_kind(&row.get::<_, String>(1)?),
                        plugin_name: row.get(2)?,
                        input_schema_json: row.get(3)?,
                        output_schema_json: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut states_stmt = conn.prepare(
                "SELECT state_id, run_id, token_id, node_id, status, input_hash, output_hash, duration_ms, started_at FROM node_states WHERE run_id = ?1",
            )?;
            let state_ids_and_records = states_stmt
                .query_map(params![run_id.to_string()], |row| {
                    let started_at: String = row.get(8)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        NodeStateRecord {
                            run_id,
                            token_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap(),
                            node_id: row.get(3)?,
                            status: parse_node_state_status(&row.get::<_, String>(4)?),
                            input_hash: row.get(5)?,
                            output_hash: row.get(6)?,
                            duration_ms: row.get::<_, i64>(7)? as u64,
                            started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let node_states: Vec<NodeStateRecord> = state_ids_and_records.iter().map(|(_, r)| r.clone()).collect();
            let state_ids: Vec<i64> = state_ids_and_records.iter().map(|(id, _)| *id).collect();

            let mut calls_stmt = conn.prepare(
                "SELECT state_id, call_index, kind, request_fingerprint, response_fingerprint, duration_ms, retry_count FROM external_calls",
            )?;
            let external_calls = calls_stmt
                .query_map([], |row| {
                    Ok(ExternalCallRecord {
                        state_id: row.get(0)?,
                        call_index: row.get::<_, i64>(1)? as u64,
                        kind: row.get(2)?,
                        request_fingerprint: row.get(3)?,
                        response_fingerprint: row.get(4)?,
                        duration_ms: row.get::<_, i64>(5)? as u64,
                        retry_count: row.get::<_, i64>(6)? as u32,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|c| state_ids.contains(&c.state_id))
                .collect();

            let mut routing_stmt = conn.prepare("SELECT state_id, from_node, to_node, label, reason FROM routing_events")?;
            let routing_events = routing_stmt
                .query_map([], |row| {
                    Ok(RoutingEventRecord {
                        state_id: row.get(0)?,
                        from_node: row.get(1)?,
                        to_node: row.get(2)?,
                        label: row.get(3)?,
                        reason: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|r| state_ids.contains(&r.state_id))
                .collect();

            let mut batches_stmt = conn.prepare(
                "SELECT batch_id, node_id, status, started_at, completed_at, member_count, trigger_kind, members_json FROM batches",
            )?;
            let batches = batches_stmt
                .query_map([], |row| {
                    let started_at: String = row.get(3)?;
                    let completed_at: Option<String> = row.get(4)?;
                    Ok(BatchRecord {
                        batch_id: row.get(0)?,
                        node_id: row.get(1)?,
                        status: parse_batch_status(&row.get::<_, String>(2)?),
                        started_at: DateTime::parse_from_rfc3339(&started_at).unwrap().with_timezone(&Utc),
                        completed_at: completed_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
                        member_count: row.get::<_, i64>(5)? as usize,
                        trigger_kind: row.get(6)?,
                        members_json: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut secrets_stmt = conn.prepare(
                "SELECT run_id, env_var_name, source, vault_url, secret_name, fingerprint, latency_ms FROM secret_resolutions WHERE run_id = ?1",
            )?;
            let secret_resolutions = secrets_stmt
                .query_map(params![run_id.to_string()], |row| {
                    Ok(SecretResolutionRecord {
                        run_id,
                        env_var_name: row.get(1)?,
                        source: row.get(2)?,
                        vault_url: row.get(3)?,
                        secret_name: row.get(4)?,
                        fingerprint: row.get(5)?,
                        latency_ms: row.get::<_, i64>(6)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut validation_stmt =
                conn.prepare("SELECT run_id, node_id, token_id, kind, message FROM validation_errors WHERE run_id = ?1")?;
            let validation_errors = validation_stmt
                .query_map(params![run_id.to_string()], |row| {
                    let token_id: Option<String> = row.get(2)?;
                    Ok(ValidationErrorRecord {
                        run_id,
                        node_id: row.get(1)?,
                        token_id: token_id.map(|t| Uuid::parse_str(&t).unwrap()),
                        kind: row.get(3)?,
                        message: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(AuditExport {
                run,
                nodes,
                node_states,
                external_calls,
                routing_events,
                batches,
                secret_resolutions,
                validation_errors,
            })
        })
        .await
    }
}

fn parse_node_kind(s: &str) -> NodeKind {
    match s {
        "source" => NodeKind::Source,
        "transform" => NodeKind::Transform,
        "aggregation" => NodeKind::Aggregation,
        "coalesce" => NodeKind::Coalesce,
        _ => NodeKind::Sink,
    }
}

fn parse_node_state_status(s: &str) -> NodeStateStatus {
    match s {
        "started" => NodeStateStatus::Started,
        "completed" => NodeStateStatus::Completed,
        "failed" => NodeStateStatus::Failed,
        "routed" => NodeStateStatus::Routed,
        "quarantined" => NodeStateStatus::Quarantined,
        "discarded" => NodeStateStatus::Discarded,
        "forked" => NodeStateStatus::Forked,
        "coalesced" => NodeStateStatus::Coalesced,
        "expanded" => NodeStateStatus::Expanded,
        "buffered" => NodeStateStatus::Buffered,
        _ => NodeStateStatus::ConsumedInBatch,
    }
}
