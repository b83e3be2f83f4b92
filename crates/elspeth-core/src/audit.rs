//! Audit record kinds and the `AuditRecorder` trait.
//!
//! The trait lives in `elspeth-core` (not `elspeth-audit`) so that
//! `Source`/`Transform`/`Sink` plugins and the `RunContext` they receive
//! can depend on it without the core crate needing a dependency on the
//! concrete audit-store implementations. `elspeth-audit` implements this
//! trait; `elspeth-core` only defines the contract and the record shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ElspethError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Transform,
    Aggregation,
    Coalesce,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    Started,
    Completed,
    Failed,
    Routed,
    Quarantined,
    Discarded,
    Forked,
    Coalesced,
    Expanded,
    Buffered,
    ConsumedInBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub config_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub kind: NodeKind,
    pub plugin_name: String,
    pub input_schema_json: Option<String>,
    pub output_schema_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub run_id: Uuid,
    pub token_id: Uuid,
    pub node_id: String,
    pub status: NodeStateStatus,
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    pub duration_ms: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCallRecord {
    pub state_id: i64,
    pub call_index: u64,
    pub kind: String,
    pub request_fingerprint: String,
    pub response_fingerprint: String,
    pub duration_ms: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEventRecord {
    pub state_id: i64,
    pub from_node: String,
    pub to_node: String,
    pub label: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: String,
    pub node_id: String,
    pub status: BatchStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub member_count: usize,
    pub trigger_kind: String,
    /// Opaque serialized snapshot of the batch's buffered members, set
    /// when the record transitions to `Executing` (before the flush call
    /// runs) so a crash mid-flush leaves enough in the audit trail for
    /// `retry_batch` to re-seed the node's aggregation buffer on resume.
    #[serde(default)]
    pub members_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretResolutionRecord {
    pub run_id: Uuid,
    pub env_var_name: String,
    pub source: String,
    pub vault_url: Option<String>,
    pub secret_name: Option<String>,
    pub fingerprint: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    pub run_id: Uuid,
    pub node_id: String,
    pub token_id: Option<Uuid>,
    pub kind: String,
    pub message: String,
}

/// Every record kind recorded for one run, flattened for export to a
/// configured `json`/`csv` sink. Each field holds that record kind's
/// rows for the run in question; a store that can't
/// cheaply scope a table to a single run (e.g. `node_states` has no run
/// column in some physical schemas) may return every row it holds instead
/// — exporters are a convenience, not a security boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditExport {
    pub run: Option<RunRecord>,
    pub nodes: Vec<NodeRegistration>,
    pub node_states: Vec<NodeStateRecord>,
    pub external_calls: Vec<ExternalCallRecord>,
    pub routing_events: Vec<RoutingEventRecord>,
    pub batches: Vec<BatchRecord>,
    pub secret_resolutions: Vec<SecretResolutionRecord>,
    pub validation_errors: Vec<ValidationErrorRecord>,
}

/// Append-only audit operations the engine issues.
///
/// Every record kind is append-only except a batch's lifecycle fields:
/// `update_batch_status`/`retry_batch` mutate a `BatchRecord`'s `status`
/// and `completed_at` in place rather than appending a new row, so
/// `get_incomplete_batches` always reflects a batch's current state
/// instead of every state it ever passed through.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn begin_run(&self, record: RunRecord) -> Result<(), ElspethError>;
    async fn register_node(&self, node: NodeRegistration) -> Result<(), ElspethError>;
    async fn record_node_state(&self, record: NodeStateRecord) -> Result<i64, ElspethError>;
    async fn record_external_call(&self, record: ExternalCallRecord) -> Result<(), ElspethError>;
    async fn record_routing(&self, record: RoutingEventRecord) -> Result<(), ElspethError>;
    async fn record_batch(&self, record: BatchRecord) -> Result<(), ElspethError>;
    async fn record_secret_resolution(&self, record: SecretResolutionRecord) -> Result<(), ElspethError>;
    async fn record_validation_error(&self, record: ValidationErrorRecord) -> Result<(), ElspethError>;

    async fn get_incomplete_batches(&self, run_id: Uuid) -> Result<Vec<BatchRecord>, ElspethError>;
    async fn update_batch_status(&self, batch_id: &str, status: BatchStatus) -> Result<(), ElspethError>;

    /// Flip a crash-incomplete batch back to `Draft` after `resume` has
    /// forced it to `Failed`, marking it eligible to be re-driven rather
    /// than abandoned. The caller is responsible for re-seeding the
    /// batch's buffered members (`BatchRecord::members_json`) into the
    /// owning node's aggregation buffer.
    async fn retry_batch(&self, batch_id: &str) -> Result<(), ElspethError>;

    async fn max_call_index(&self, run_id: Uuid, node_id: &str) -> Result<u64, ElspethError>;
    async fn complete_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), ElspethError>;

    /// Pull every record for `run_id` back out, for the orchestrator's
    /// optional audit export step.
    async fn export_records(&self, run_id: Uuid) -> Result<AuditExport, ElspethError>;
}
