//! Orchestrator: the run lifecycle.
//!
//! Single-threaded and cooperative — the only concurrency is whatever a
//! `BatchAwareTransform` does inside its own worker pool via
//! `SharedBatchAdapter`. Every row is pulled from the source, driven
//! through the graph by `RowProcessor`, routed to a pending sink buffer,
//! and the run checkpoints on cadence so a crash can resume from the last
//! committed offset instead of replaying the whole source.
//!
//! `RowProcessor` is constructed fresh at every call site rather than
//! held in a variable: it borrows the graph and batch registry, and the
//! source/sink plugins the orchestrator also needs mutable access to
//! (via `ExecutionGraph::node_mut`) live inside that same graph. A
//! long-lived `RowProcessor` would keep the graph borrowed immutably for
//! the whole run, which conflicts with pulling the next source row or
//! writing a sink batch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use elspeth_checkpoint::{Checkpoint, CheckpointManager};
use elspeth_core::audit::{
    AuditRecorder, BatchStatus, NodeKind, NodeRegistration, NodeStateRecord, NodeStateStatus, RunRecord, RunStatus,
    ValidationErrorRecord,
};
use elspeth_core::config::RunConfig;
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::token::Token;
use elspeth_core::traits::{RoutePolicy, SourceRow};
use elspeth_core::value::RowData;
use elspeth_core::{Clock, RateLimiter, RunContext};
use elspeth_graph::{ExecutionGraph, NodePlugin};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregation::{AggregationExecutor, TriggerKind};
use crate::batch_adapter::BatchAwareRegistry;
use crate::coalesce::CoalesceExecutor;
use crate::outcome::{Outcome, ProcessResult};
use crate::processor::RowProcessor;
use crate::retry::with_retry;

fn invariant(message: impl Into<String>) -> ElspethError {
    ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, message, false))
}

/// Canonical hash of a contract's normalized field set + types, ignoring
/// `original_name`/`required`/`source` — what the checkpoint compares on
/// resume.
fn schema_fingerprint(contract: &elspeth_core::SchemaContract) -> String {
    let shape: Vec<(String, elspeth_core::ValueType)> =
        contract.fields.iter().map(|f| (f.normalized_name.clone(), f.value_type)).collect();
    elspeth_core::canonical::canonical_json(&shape).expect("schema shape always serializes")
}

/// Run-wide progress, reported back once the run ends. In steady state
/// `rows_loaded == rows_succeeded + rows_failed + rows_quarantined +
/// rows_discarded`, modulo tokens still mid-fan-out at the moment the run
/// stopped.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub counters: elspeth_checkpoint::Counters,
    pub rows_routed: HashMap<String, u64>,
    pub rows_forked: u64,
    pub rows_coalesced: u64,
}

/// Drives one run of a validated graph from open to close.
pub struct Orchestrator {
    graph: ExecutionGraph,
    batch_registry: BatchAwareRegistry,
    config: RunConfig,
    audit: Arc<dyn AuditRecorder>,
    checkpoint_manager: Arc<dyn CheckpointManager>,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<dyn RateLimiter>,

    run_id: Uuid,
    source_id: String,
    sink_ids: Vec<String>,
    coalesce_node_ids: Vec<String>,
    aggregation_node_ids: Vec<String>,

    coalesce_execs: HashMap<String, CoalesceExecutor>,
    aggregation_execs: HashMap<String, AggregationExecutor>,

    pending_sink_rows: HashMap<String, Vec<Token>>,
    counters: elspeth_checkpoint::Counters,
    rows_routed: HashMap<String, u64>,
    rows_forked: u64,
    rows_coalesced: u64,
    last_source_offset: u64,
    committed_token_ids: HashMap<String, Uuid>,
    source_schema_fingerprint: String,
}

impl Orchestrator {
    /// Validate the graph and build the per-node coalesce/aggregation
    /// executors. `batch_registry` is built by the caller at
    /// pipeline-construction time (it needs the same
    /// `Arc<dyn BatchAwareTransform>` the graph node wraps in a
    /// `BatchAwareAsTransform`, which the graph alone cannot
    /// reconstruct).
    pub fn new(
        graph: ExecutionGraph,
        batch_registry: BatchAwareRegistry,
        config: RunConfig,
        audit: Arc<dyn AuditRecorder>,
        checkpoint_manager: Arc<dyn CheckpointManager>,
        clock: Arc<dyn Clock>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self, ElspethError> {
        let errors = graph.validate();
        if !errors.is_empty() {
            return Err(ElspethError::Configuration(ErrorReason::new(
                ErrorKind::Configuration,
                format!("graph failed validation: {errors:?}"),
                false,
            )));
        }

        let mut source_id = None;
        let mut sink_ids = Vec::new();
        let mut coalesce_node_ids = Vec::new();
        let mut aggregation_node_ids = Vec::new();
        let mut coalesce_execs = HashMap::new();
        let mut aggregation_execs = HashMap::new();

        for id in graph.node_ids() {
            let node = graph.node(id).expect("node_ids only lists present nodes");
            match &node.plugin {
                NodePlugin::Source(_) => source_id = Some(id.clone()),
                NodePlugin::Sink(_) => sink_ids.push(id.clone()),
                NodePlugin::Coalesce(cfg) => {
                    let mut seen = HashSet::new();
                    let branches: Vec<String> = graph
                        .incoming(id)
                        .into_iter()
                        .filter_map(|e| e.label.clone())
                        .filter(|label| seen.insert(label.clone()))
                        .collect();
                    coalesce_execs.insert(id.clone(), CoalesceExecutor::new(cfg.clone(), branches));
                    coalesce_node_ids.push(id.clone());
                }
                NodePlugin::Aggregation(_, cfg) => {
                    aggregation_execs.insert(id.clone(), AggregationExecutor::new(id.clone(), cfg.clone()));
                    aggregation_node_ids.push(id.clone());
                }
                NodePlugin::Transform(_, _) => {}
            }
        }

        let source_id = source_id.ok_or_else(|| invariant("graph has no source node"))?;
        let source_fingerprint = schema_fingerprint(
            graph
                .node(&source_id)
                .and_then(|n| n.output_schema())
                .ok_or_else(|| invariant("source node has no output schema"))?,
        );

        Ok(Orchestrator {
            graph,
            batch_registry,
            config,
            audit,
            checkpoint_manager,
            clock,
            rate_limiter,
            run_id: Uuid::new_v4(),
            source_id,
            sink_ids,
            coalesce_node_ids,
            aggregation_node_ids,
            coalesce_execs,
            aggregation_execs,
            pending_sink_rows: HashMap::new(),
            counters: elspeth_checkpoint::Counters::default(),
            rows_routed: HashMap::new(),
            rows_forked: 0,
            rows_coalesced: 0,
            last_source_offset: 0,
            committed_token_ids: HashMap::new(),
            source_schema_fingerprint: source_fingerprint,
        })
    }

    /// The id of the run this orchestrator is currently driving — the id
    /// a checkpoint is filed under, and what a later `resume` call reads
    /// back.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Resume an existing run: read the latest checkpoint, verify its
    /// schema fingerprint still matches the current source, and seed
    /// counters/offsets/aggregation buffers from it.
    ///
    /// `last_source_offset` is safe to resume from verbatim: `maybe_checkpoint`
    /// always flushes every pending sink row before a checkpoint that is
    /// actually about to fire, so the persisted offset never sits ahead of
    /// what the sinks have committed.
    ///
    /// Batches recorded `Executing` at the time of the crash are forced to
    /// `Failed` for the audit trail, then reopened via `retry_batch` so
    /// they are picked back up rather than abandoned; an `Executing` batch
    /// carries the member rows it was flushing (`members_json`), which are
    /// re-seeded into the node's aggregation buffer so they flush again
    /// instead of being lost. `Draft` batches need no recovery — their
    /// members are already covered by the aggregation snapshot restored
    /// above — but are still flipped back to `Draft` via `retry_batch` for
    /// a consistent audit trail.
    pub async fn resume(mut self, resume_run_id: Uuid) -> Result<Self, ElspethError> {
        let checkpoint = self
            .checkpoint_manager
            .latest(resume_run_id)
            .await?
            .ok_or_else(|| invariant(format!("no checkpoint found for run {resume_run_id}")))?;
        checkpoint.verify_schema_fingerprint(&self.source_schema_fingerprint)?;
        info!(run_id = %resume_run_id, last_source_offset = checkpoint.last_source_offset, "resuming run from checkpoint");

        self.run_id = resume_run_id;
        self.last_source_offset = checkpoint.last_source_offset;
        self.committed_token_ids = checkpoint.committed_token_ids;
        self.counters = checkpoint.counters;

        for (node_id, snapshot) in checkpoint.aggregation_state {
            if let Some(executor) = self.aggregation_execs.get_mut(&node_id) {
                executor.restore(snapshot)?;
            }
        }

        let now = self.clock.now();
        for batch in self.audit.get_incomplete_batches(resume_run_id).await? {
            if !matches!(batch.status, BatchStatus::Draft | BatchStatus::Executing) {
                continue;
            }
            let was_executing = matches!(batch.status, BatchStatus::Executing);
            self.audit.update_batch_status(&batch.batch_id, BatchStatus::Failed).await?;
            self.audit.retry_batch(&batch.batch_id).await?;

            if was_executing {
                if let Some(members_json) = &batch.members_json {
                    if let Some(executor) = self.aggregation_execs.get_mut(&batch.node_id) {
                        executor.reseed_from_retry(members_json, now)?;
                    }
                }
            }
        }

        Ok(self)
    }

    /// Run to completion (source exhaustion) or until `shutdown` is
    /// cancelled. Cooperative: cancellation is only observed between
    /// rows, never mid-token.
    pub async fn run(&mut self, shutdown: Option<CancellationToken>) -> Result<RunSummary, ElspethError> {
        info!(run_id = %self.run_id, "run started");
        let ctx = RunContext::new(self.run_id, self.audit.clone(), self.clock.clone(), &self.config)
            .with_rate_limiter(self.rate_limiter.clone());

        self.audit
            .begin_run(RunRecord { run_id: self.run_id, started_at: ctx.now(), config_fingerprint: ctx.config_fingerprint.clone() })
            .await?;

        for id in self.graph.node_ids().to_vec() {
            let node = self.graph.node(&id).expect("node_ids only lists present nodes");
            self.audit
                .register_node(NodeRegistration {
                    node_id: id.clone(),
                    kind: node_kind(&node.plugin),
                    plugin_name: plugin_name(&node.plugin).to_string(),
                    input_schema_json: node.input_schema().map(|s| serde_json::to_string(s).unwrap_or_default()),
                    output_schema_json: node.output_schema().map(|s| serde_json::to_string(s).unwrap_or_default()),
                })
                .await?;
        }

        {
            let source_node = self
                .graph
                .node_mut(&self.source_id)
                .ok_or_else(|| invariant("source node disappeared after validation"))?;
            let NodePlugin::Source(source) = &mut source_node.plugin else {
                return Err(invariant("source node id does not hold a source plugin"));
            };
            source.open(&ctx).await?;
        }

        // Skip rows already accounted for by a resumed checkpoint.
        for _ in 0..self.last_source_offset {
            if self.next_source_row(&ctx).await?.is_none() {
                break;
            }
        }

        let mut interrupted = false;
        loop {
            if let Some(token) = &shutdown {
                if token.is_cancelled() {
                    warn!(run_id = %self.run_id, "shutdown requested, finishing current row then interrupting");
                    interrupted = true;
                    break;
                }
            }

            self.check_timeouts(&ctx).await?;

            let Some(source_row) = self.next_source_row(&ctx).await? else { break };
            self.last_source_offset += 1;
            self.counters.rows_loaded += 1;

            if source_row.is_quarantined {
                self.route_quarantined(source_row).await?;
                self.maybe_checkpoint(&ctx).await?;
                continue;
            }

            let token = Token::new_source_token(source_row.row_id, source_row.row);
            let retry = self.config.retry.clone();
            let results = RowProcessor::new(&self.graph, &self.batch_registry, &retry)
                .process_token(token, &self.source_id, &ctx, &mut self.coalesce_execs, &mut self.aggregation_execs)
                .await?;
            self.absorb_results(results);
            self.flush_due_sinks(&ctx).await?;
            self.maybe_checkpoint(&ctx).await?;
        }

        // End-of-source: flush every aggregation node regardless of
        // whether its own trigger ever fired, then drain whatever that
        // produces.
        if !interrupted {
            self.flush_all_aggregations(&ctx).await?;
        }
        self.flush_all_sinks(&ctx).await?;
        self.close_sinks().await?;

        let status = if interrupted { RunStatus::Interrupted } else { RunStatus::Completed };
        info!(run_id = %self.run_id, ?status, rows_loaded = self.counters.rows_loaded, rows_succeeded = self.counters.rows_succeeded, "run finished");
        if !interrupted {
            self.checkpoint_manager.delete(self.run_id).await?;
        } else {
            let checkpoint = self.build_checkpoint(ctx.now())?;
            self.checkpoint_manager.checkpoint_now(checkpoint).await?;
        }
        self.audit.complete_run(self.run_id, status).await?;

        if let Some(export) = self.config.export.clone() {
            self.export_audit(&export).await?;
        }

        Ok(RunSummary {
            run_id: self.run_id,
            status,
            counters: self.counters.clone(),
            rows_routed: self.rows_routed.clone(),
            rows_forked: self.rows_forked,
            rows_coalesced: self.rows_coalesced,
        })
    }

    async fn next_source_row(&mut self, ctx: &RunContext) -> Result<Option<SourceRow>, ElspethError> {
        let retry = self.config.retry.clone();
        let source_node = self.graph.node_mut(&self.source_id).ok_or_else(|| invariant("source node missing"))?;
        let NodePlugin::Source(source) = &mut source_node.plugin else {
            return Err(invariant("source node id does not hold a source plugin"));
        };
        with_retry(&retry, |_attempt| source.next_row(ctx)).await
    }

    async fn route_quarantined(&mut self, source_row: SourceRow) -> Result<(), ElspethError> {
        self.counters.rows_quarantined += 1;
        let token = Token::new_source_token(source_row.row_id, source_row.row);
        let policy = {
            let source_node = self.graph.node(&self.source_id).ok_or_else(|| invariant("source node missing"))?;
            let NodePlugin::Source(source) = &source_node.plugin else {
                return Err(invariant("source node id does not hold a source plugin"));
            };
            source.on_validation_failure().clone()
        };

        for message in &source_row.validation_errors {
            self.audit
                .record_validation_error(ValidationErrorRecord {
                    run_id: self.run_id,
                    node_id: self.source_id.clone(),
                    token_id: Some(token.token_id),
                    kind: "source_validation".to_string(),
                    message: message.clone(),
                })
                .await?;
        }

        match policy {
            RoutePolicy::Discard => {
                self.counters.rows_discarded += 1;
            }
            RoutePolicy::Sink(sink_name) => {
                self.audit
                    .record_node_state(NodeStateRecord {
                        run_id: self.run_id,
                        token_id: token.token_id,
                        node_id: self.source_id.clone(),
                        status: NodeStateStatus::Quarantined,
                        input_hash: None,
                        output_hash: None,
                        duration_ms: 0,
                        started_at: self.clock.now(),
                    })
                    .await?;
                self.pending_sink_rows.entry(sink_name.clone()).or_default().push(token);
                *self.rows_routed.entry(sink_name).or_default() += 1;
            }
        }
        Ok(())
    }

    fn absorb_results(&mut self, results: Vec<ProcessResult>) {
        for result in results {
            match result.outcome {
                Outcome::Completed => {
                    self.counters.rows_succeeded += 1;
                    if let Some(sink) = &result.sink_name {
                        self.pending_sink_rows.entry(sink.clone()).or_default().push(result.token);
                    }
                }
                Outcome::Routed => {
                    self.counters.rows_failed += 1;
                    if let Some(sink) = &result.sink_name {
                        self.pending_sink_rows.entry(sink.clone()).or_default().push(result.token);
                        *self.rows_routed.entry(sink.clone()).or_default() += 1;
                    }
                }
                Outcome::Failed => {
                    self.counters.rows_failed += 1;
                }
                Outcome::Discarded => {
                    self.counters.rows_discarded += 1;
                }
                Outcome::Quarantined => {
                    self.counters.rows_quarantined += 1;
                    if let Some(sink) = &result.sink_name {
                        self.pending_sink_rows.entry(sink.clone()).or_default().push(result.token);
                        *self.rows_routed.entry(sink.clone()).or_default() += 1;
                    }
                }
                Outcome::Coalesced => self.rows_coalesced += 1,
                Outcome::Forked => self.rows_forked += 1,
                Outcome::Expanded | Outcome::Buffered | Outcome::ConsumedInBatch => {}
            }
        }
    }

    /// Sweep coalesce timeouts and aggregation timeout triggers, checked
    /// once per main-loop iteration before the next row is pulled.
    async fn check_timeouts(&mut self, ctx: &RunContext) -> Result<(), ElspethError> {
        let retry = self.config.retry.clone();
        let coalesce_ids = self.coalesce_node_ids.clone();
        for node_id in &coalesce_ids {
            let mut results = Vec::new();
            RowProcessor::new(&self.graph, &self.batch_registry, &retry)
                .check_coalesce_timeouts(node_id, ctx, &mut self.coalesce_execs, &mut results)
                .await?;
            self.absorb_results(results);
        }

        let aggregation_ids = self.aggregation_node_ids.clone();
        for node_id in &aggregation_ids {
            let fires = self.aggregation_execs.get(node_id).map(|e| e.timeout_trigger_fires(ctx.now())).unwrap_or(false);
            if !fires {
                continue;
            }
            self.flush_one_aggregation(node_id, ctx, None).await?;
        }
        Ok(())
    }

    async fn flush_one_aggregation(
        &mut self,
        node_id: &str,
        ctx: &RunContext,
        forced_trigger: Option<TriggerKind>,
    ) -> Result<(), ElspethError> {
        let retry = self.config.retry.clone();
        let mut queue = VecDeque::new();
        let mut results = Vec::new();
        {
            let node = self.graph.node(node_id).ok_or_else(|| invariant(format!("aggregation node '{node_id}' missing")))?;
            let NodePlugin::Aggregation(transform, _) = &node.plugin else {
                return Err(invariant(format!("node '{node_id}' is not an aggregation node")));
            };
            RowProcessor::new(&self.graph, &self.batch_registry, &retry)
                .flush_aggregation(node_id, transform.as_ref(), ctx, &mut self.aggregation_execs, &mut queue, &mut results, forced_trigger)
                .await?;
        }
        RowProcessor::new(&self.graph, &self.batch_registry, &retry)
            .drain_queue(&mut queue, ctx, &mut self.coalesce_execs, &mut self.aggregation_execs, &mut results)
            .await?;
        self.absorb_results(results);
        Ok(())
    }

    async fn flush_all_aggregations(&mut self, ctx: &RunContext) -> Result<(), ElspethError> {
        let ids = self.aggregation_node_ids.clone();
        for node_id in ids {
            let has_pending = self.aggregation_execs.get(&node_id).map(|e| e.has_pending()).unwrap_or(false);
            if !has_pending {
                continue;
            }
            self.flush_one_aggregation(&node_id, ctx, Some(TriggerKind::EndOfSource)).await?;
        }
        Ok(())
    }

    async fn flush_due_sinks(&mut self, ctx: &RunContext) -> Result<(), ElspethError> {
        let due: Vec<String> = self
            .pending_sink_rows
            .iter()
            .filter(|(_, rows)| rows.len() >= self.config.sink_batch_size)
            .map(|(name, _)| name.clone())
            .collect();
        for sink_name in due {
            self.write_sink(&sink_name, ctx).await?;
        }
        Ok(())
    }

    async fn flush_all_sinks(&mut self, ctx: &RunContext) -> Result<(), ElspethError> {
        let names: Vec<String> = self.pending_sink_rows.keys().cloned().collect();
        for sink_name in names {
            self.write_sink(&sink_name, ctx).await?;
        }
        Ok(())
    }

    async fn write_sink(&mut self, sink_name: &str, ctx: &RunContext) -> Result<(), ElspethError> {
        let Some(tokens) = self.pending_sink_rows.remove(sink_name) else { return Ok(()) };
        if tokens.is_empty() {
            return Ok(());
        }
        let last_token_id = tokens.last().map(|t| t.token_id);
        let rows: Vec<RowData> = tokens.into_iter().map(|t| t.row_data).collect();

        let node = self.graph.node_mut(sink_name).ok_or_else(|| invariant(format!("sink '{sink_name}' missing")))?;
        let NodePlugin::Sink(sink) = &mut node.plugin else {
            return Err(invariant(format!("node '{sink_name}' is not a sink")));
        };
        sink.write(rows, ctx).await?;
        sink.flush().await?;

        if let Some(id) = last_token_id {
            self.committed_token_ids.insert(sink_name.to_string(), id);
        }
        Ok(())
    }

    async fn close_sinks(&mut self) -> Result<(), ElspethError> {
        for sink_name in self.sink_ids.clone().into_iter().rev() {
            let node = self.graph.node_mut(&sink_name).ok_or_else(|| invariant(format!("sink '{sink_name}' missing")))?;
            let NodePlugin::Sink(sink) = &mut node.plugin else {
                return Err(invariant(format!("node '{sink_name}' is not a sink")));
            };
            sink.close().await?;
        }
        Ok(())
    }

    fn build_checkpoint(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Checkpoint, ElspethError> {
        let mut checkpoint = Checkpoint::new(self.run_id, self.source_schema_fingerprint.clone(), now);
        checkpoint.last_source_offset = self.last_source_offset;
        checkpoint.committed_token_ids = self.committed_token_ids.clone();
        checkpoint.counters = self.counters.clone();
        for (node_id, executor) in &self.aggregation_execs {
            checkpoint.aggregation_state.insert(node_id.clone(), executor.snapshot()?);
        }
        Ok(checkpoint)
    }

    async fn maybe_checkpoint(&mut self, ctx: &RunContext) -> Result<(), ElspethError> {
        // `last_source_offset` is only meaningful if every row it implies
        // has already reached a sink — flush whatever is pending before a
        // checkpoint that is actually about to fire, so the cadence never
        // writes an offset ahead of committed state.
        if self.checkpoint_manager.would_checkpoint() {
            self.flush_all_sinks(ctx).await?;
        }
        let checkpoint = self.build_checkpoint(ctx.now())?;
        self.checkpoint_manager.maybe_checkpoint(checkpoint).await?;
        Ok(())
    }

    async fn export_audit(&self, export: &elspeth_core::config::ExportConfig) -> Result<(), ElspethError> {
        let records = self.audit.export_records(self.run_id).await?;
        let signing_key = if export.sign {
            let secret = std::env::var("ELSPETH_AUDIT_SIGNING_KEY").map_err(|_| {
                ElspethError::Configuration(ErrorReason::new(
                    ErrorKind::Configuration,
                    "export.sign is true but ELSPETH_AUDIT_SIGNING_KEY is not set",
                    false,
                ))
            })?;
            Some(elspeth_audit::FingerprintKey::new(secret.into_bytes()))
        } else {
            None
        };
        let path = std::path::Path::new(&export.sink);
        match export.format {
            elspeth_core::config::ExportFormat::Json => {
                elspeth_audit::export::export_json(&records, path, signing_key.as_ref())?;
            }
            elspeth_core::config::ExportFormat::Csv => {
                elspeth_audit::export::export_csv(&records, path, signing_key.as_ref())?;
            }
        }
        Ok(())
    }
}

fn node_kind(plugin: &NodePlugin) -> NodeKind {
    match plugin {
        NodePlugin::Source(_) => NodeKind::Source,
        NodePlugin::Transform(_, _) => NodeKind::Transform,
        NodePlugin::Aggregation(_, _) => NodeKind::Aggregation,
        NodePlugin::Coalesce(_) => NodeKind::Coalesce,
        NodePlugin::Sink(_) => NodeKind::Sink,
    }
}

fn plugin_name(plugin: &NodePlugin) -> &str {
    use elspeth_core::Operator;
    match plugin {
        NodePlugin::Source(s) => s.name(),
        NodePlugin::Transform(t, _) => t.name(),
        NodePlugin::Aggregation(t, _) => t.name(),
        NodePlugin::Coalesce(_) => "coalesce",
        NodePlugin::Sink(s) => s.name(),
    }
}
