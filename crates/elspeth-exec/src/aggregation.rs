//! Aggregation Executor: windowed per-node buffers with
//! count/timeout/composite/end-of-source triggers. On flush, drives the
//! buffered tokens through the node's batch-aware transform and emits
//! output tokens per `output_mode`.

use elspeth_core::config::{AggregationConfig, AggregationOutputMode, TriggerExpr};
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::token::Token;
use elspeth_core::traits::{Transform, TransformOutput};
use elspeth_core::value::RowData;
use elspeth_core::RunContext;

/// A batch's lifecycle: Draft while accepting rows, Executing while the
/// flush is in flight, then Completed or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Draft,
    Executing,
    Completed,
    Failed,
}

/// What trigger kind fired a flush, for the audit `batch` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Count,
    Timeout,
    Composite,
    EndOfSource,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Count => "count",
            TriggerKind::Timeout => "timeout",
            TriggerKind::Composite => "composite",
            TriggerKind::EndOfSource => "end_of_source",
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct BufferedRow {
    token: Token,
    row: RowData,
}

/// What a `snapshot`/`restore` round-trip carries into a checkpoint's
/// opaque per-node `aggregation_state`.
#[derive(serde::Serialize, serde::Deserialize)]
struct AggregationSnapshot {
    buffer: Vec<BufferedRow>,
    batch_id: Option<String>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    next_batch_seq: u64,
}

/// The output of a successful flush: the completed batch's output tokens
/// plus any input tokens dropped because `output_mode=transform` returned
/// fewer rows than were buffered.
pub struct FlushOutcome {
    pub batch_id: String,
    pub trigger: TriggerKind,
    pub member_count: usize,
    pub outputs: Vec<(Token, FlushDisposition)>,
    pub rows_dropped: usize,
}

/// How a flush's output token should continue through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDisposition {
    /// `single`/`transform` mode: re-enter the processor after this node.
    Continue,
    /// `passthrough` mode: recorded as a `Buffered` outcome; the token is
    /// handed to whatever re-buffers it downstream (e.g. a further
    /// aggregation node), not completed here.
    Passthrough,
}

/// Per-aggregation-node windowed buffer state, owned exclusively by this
/// executor.
pub struct AggregationExecutor {
    config: AggregationConfig,
    node_id: String,
    buffer: Vec<BufferedRow>,
    batch_id: Option<String>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    next_batch_seq: u64,
}

impl AggregationExecutor {
    pub fn new(node_id: impl Into<String>, config: AggregationConfig) -> Self {
        AggregationExecutor {
            config,
            node_id: node_id.into(),
            buffer: Vec::new(),
            batch_id: None,
            started_at: None,
            next_batch_seq: 0,
        }
    }

    pub fn member_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    pub fn started_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.started_at
    }

    /// Buffer one row, starting a new batch if this is the first member.
    /// Returns `true` if the count trigger (or a composite including a
    /// satisfied count leaf) now fires.
    pub fn push(&mut self, token: Token, row: RowData, now: chrono::DateTime<chrono::Utc>) -> bool {
        if self.buffer.is_empty() {
            self.started_at = Some(now);
            self.next_batch_seq += 1;
            self.batch_id = Some(format!("{}-batch-{}", self.node_id, self.next_batch_seq));
        }
        self.buffer.push(BufferedRow { token, row });
        self.count_trigger_fires()
    }

    fn count_trigger_fires(&self) -> bool {
        trigger_satisfied(&self.config.trigger, self.buffer.len(), false)
    }

    /// Evaluate the timeout leg of the configured trigger against `now`:
    /// fires only when the buffer is non-empty and
    /// `now - started_at >= seconds`. Called by the orchestrator before
    /// processing each incoming row, not on a free-running timer — a
    /// timeout can only fire as early as the next row arrives (or at
    /// end-of-source), never mid-wait.
    pub fn timeout_trigger_fires(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(started_at) = self.started_at else { return false };
        if self.buffer.is_empty() {
            return false;
        }
        timeout_leg_satisfied(&self.config.trigger, now - started_at)
    }

    fn trigger_kind(&self) -> TriggerKind {
        match classify(&self.config.trigger) {
            Classification::Count => TriggerKind::Count,
            Classification::Timeout => TriggerKind::Timeout,
            Classification::EndOfSource => TriggerKind::EndOfSource,
            Classification::Composite => TriggerKind::Composite,
        }
    }

    /// Pop the current buffer and drive it through the batch-aware
    /// transform's `process_batch`, interpreting the result per
    /// `output_mode`. Marks the batch Executing for the duration of the
    /// call, then Completed/Failed.
    /// On success, the flush's outputs. On failure, the original member
    /// tokens come back alongside the error so the caller can route each
    /// one per the aggregation node's `on_error` policy — `flush` itself
    /// has already popped the buffer, so it is the only place that still
    /// holds them.
    pub async fn flush(
        &mut self,
        transform: &dyn Transform,
        ctx: &RunContext,
        trigger: TriggerKind,
    ) -> Result<(FlushOutcome, BatchState), (ElspethError, Vec<Token>)> {
        let batch_id = self.batch_id.take().expect("flush called on non-empty batch");
        let members = std::mem::take(&mut self.buffer);
        self.started_at = None;
        let member_count = members.len();

        let rows: Vec<RowData> = members.iter().map(|m| m.row.clone()).collect();
        match transform.process_batch(rows, ctx).await {
            Err(err) => {
                let tokens = members.into_iter().map(|m| m.token).collect();
                Err((wrap_aggregation_error(err), tokens))
            }
            Ok(output) => {
                let (outputs, rows_dropped) = self.interpret_output(output, members, &batch_id);
                Ok((FlushOutcome { batch_id, trigger, member_count, outputs, rows_dropped }, BatchState::Completed))
            }
        }
    }

    fn interpret_output(
        &self,
        output: TransformOutput,
        members: Vec<BufferedRow>,
        batch_id: &str,
    ) -> (Vec<(Token, FlushDisposition)>, usize) {
        match self.config.output_mode {
            AggregationOutputMode::Single => {
                let row = match output {
                    TransformOutput::Row(row) => row,
                    TransformOutput::Expanded(mut rows) => rows.pop().unwrap_or_default(),
                    TransformOutput::Forked(branches) => {
                        branches.into_iter().next().map(|(_, row)| row).unwrap_or_default()
                    }
                };
                let token = Token::aggregation_output(batch_id, row);
                (vec![(token, FlushDisposition::Continue)], 0)
            }
            AggregationOutputMode::Transform => {
                let output_rows = match output {
                    TransformOutput::Row(row) => vec![row],
                    TransformOutput::Expanded(rows) => rows,
                    TransformOutput::Forked(branches) => branches.into_iter().map(|(_, row)| row).collect(),
                };
                // Positional zip: inputs with no corresponding output are
                // dropped and counted, never silently unaccounted.
                let rows_dropped = members.len().saturating_sub(output_rows.len());
                let outputs = members
                    .into_iter()
                    .zip(output_rows)
                    .map(|(member, row)| {
                        (Token::deaggregation_child(&member.token, row, Some(member.token.row_id.clone())), FlushDisposition::Continue)
                    })
                    .collect();
                (outputs, rows_dropped)
            }
            AggregationOutputMode::Passthrough => {
                let outputs = members.into_iter().map(|m| (m.token, FlushDisposition::Passthrough)).collect();
                (outputs, 0)
            }
        }
    }

    /// Force a flush at source exhaustion regardless of trigger state, if
    /// the buffer holds anything — `end_of_source` is implicit at source
    /// exhaustion, not a trigger leaf that has to fire explicitly.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn end_of_source_trigger(&self) -> TriggerKind {
        TriggerKind::EndOfSource
    }

    /// The trigger kind that would be recorded for a flush happening now,
    /// distinguishing which leaf of a composite trigger actually fired.
    pub fn active_trigger_kind(&self) -> TriggerKind {
        self.trigger_kind()
    }

    /// Serialize the rows about to be popped by `flush`, for the
    /// `Executing` batch record written just before the flush call —
    /// the one place outside a checkpoint that durably carries a batch's
    /// member data, since `flush` itself drains the buffer before the
    /// transform call returns.
    pub fn pending_members_json(&self) -> Result<String, ElspethError> {
        serde_json::to_string(&self.buffer).map_err(|e| {
            ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("batch member serialization failed: {e}"), false))
        })
    }

    /// Re-seed rows recovered from a retried `Executing` batch record
    /// ahead of whatever this node's buffer already holds (from a
    /// checkpoint restore or rows that have arrived since resume), since
    /// they were buffered first. Starts a fresh batch if the buffer was
    /// otherwise empty.
    pub fn reseed_from_retry(&mut self, members_json: &str, now: chrono::DateTime<chrono::Utc>) -> Result<(), ElspethError> {
        let mut recovered: Vec<BufferedRow> = serde_json::from_str(members_json).map_err(|e| {
            ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("retried batch deserialization failed: {e}"), false))
        })?;
        if recovered.is_empty() {
            return Ok(());
        }
        if self.buffer.is_empty() {
            self.started_at = Some(now);
            self.next_batch_seq += 1;
            self.batch_id = Some(format!("{}-batch-{}", self.node_id, self.next_batch_seq));
        }
        recovered.append(&mut self.buffer);
        self.buffer = recovered;
        Ok(())
    }

    /// Serialize the buffered-but-not-yet-flushed state for this node's
    /// slot in a `Checkpoint.aggregation_state` map.
    pub fn snapshot(&self) -> Result<serde_json::Value, ElspethError> {
        let snapshot = AggregationSnapshot {
            buffer: self.buffer.iter().map(|b| BufferedRow { token: b.token.clone(), row: b.row.clone() }).collect(),
            batch_id: self.batch_id.clone(),
            started_at: self.started_at,
            next_batch_seq: self.next_batch_seq,
        };
        serde_json::to_value(snapshot).map_err(|e| {
            ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("aggregation snapshot failed: {e}"), false))
        })
    }

    /// Restore buffered state from a checkpoint's `aggregation_state` entry
    /// for this node, on resume.
    pub fn restore(&mut self, value: serde_json::Value) -> Result<(), ElspethError> {
        let snapshot: AggregationSnapshot = serde_json::from_value(value).map_err(|e| {
            ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, format!("aggregation restore failed: {e}"), false))
        })?;
        self.buffer = snapshot.buffer;
        self.batch_id = snapshot.batch_id;
        self.started_at = snapshot.started_at;
        self.next_batch_seq = snapshot.next_batch_seq;
        Ok(())
    }
}

fn wrap_aggregation_error(err: ElspethError) -> ElspethError {
    match err {
        ElspethError::Transform(reason) => ElspethError::Aggregation(ErrorReason::new(
            ErrorKind::AggregationFailure,
            format!("aggregation batch failed: {}", reason.message),
            reason.retryable,
        )),
        other => other,
    }
}

enum Classification {
    Count,
    Timeout,
    EndOfSource,
    Composite,
}

fn classify(expr: &TriggerExpr) -> Classification {
    match expr {
        TriggerExpr::Count { .. } => Classification::Count,
        TriggerExpr::Timeout { .. } => Classification::Timeout,
        TriggerExpr::EndOfSource => Classification::EndOfSource,
        TriggerExpr::And { .. } | TriggerExpr::Or { .. } => Classification::Composite,
    }
}

/// Evaluate the count/composite-count parts of a trigger expression.
/// `timeout_already_elapsed` lets composite evaluation account for a
/// timeout leaf that separately fired (used only by `timeout_leg_satisfied`
/// recursing back in for `And`/`Or` combinators).
fn trigger_satisfied(expr: &TriggerExpr, count: usize, timeout_already_elapsed: bool) -> bool {
    match expr {
        TriggerExpr::Count { threshold } => count >= *threshold,
        TriggerExpr::Timeout { .. } => timeout_already_elapsed,
        TriggerExpr::EndOfSource => false,
        TriggerExpr::And { of } => of.iter().all(|e| trigger_satisfied(e, count, timeout_already_elapsed)),
        TriggerExpr::Or { of } => of.iter().any(|e| trigger_satisfied(e, count, timeout_already_elapsed)),
    }
}

/// Evaluate the timeout/composite-timeout parts of a trigger expression
/// against elapsed buffer age. `And`/`Or` are evaluated short-circuit
/// left-to-right over their sub-triggers.
fn timeout_leg_satisfied(expr: &TriggerExpr, elapsed: chrono::Duration) -> bool {
    match expr {
        TriggerExpr::Timeout { seconds } => elapsed.num_seconds() >= *seconds as i64,
        TriggerExpr::Count { .. } | TriggerExpr::EndOfSource => false,
        TriggerExpr::And { of } => of.iter().all(|e| timeout_leg_satisfied(e, elapsed)),
        TriggerExpr::Or { of } => of.iter().any(|e| timeout_leg_satisfied(e, elapsed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use elspeth_core::audit::AuditRecorder;
    use elspeth_core::config::RunConfig;
    use elspeth_core::schema::SchemaContract;
    use elspeth_core::traits::OnError;
    use elspeth_core::value::Value;
    use elspeth_core::{Operator, SchemaConfig, SystemClock};
    use std::sync::Arc;
    use uuid::Uuid;

    struct SumTransform {
        schema: SchemaContract,
        on_error: OnError,
    }
    #[async_trait]
    impl Operator for SumTransform {
        fn name(&self) -> &str {
            "sum"
        }
    }
    #[async_trait]
    impl Transform for SumTransform {
        fn input_schema(&self) -> &SchemaContract {
            &self.schema
        }
        fn output_schema(&self) -> &SchemaContract {
            &self.schema
        }
        fn schema_config(&self) -> SchemaConfig {
            SchemaConfig::default()
        }
        fn on_error(&self) -> &OnError {
            &self.on_error
        }
        async fn process(&self, row: RowData, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
            Ok(TransformOutput::Row(row))
        }
        async fn process_batch(&self, rows: Vec<RowData>, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
            let mut sum = 0i64;
            for row in &rows {
                if let Some(Value::Int(v)) = row.get("value") {
                    sum += v;
                }
            }
            let mut out = RowData::new();
            out.insert("sum".into(), Value::Int(sum));
            Ok(TransformOutput::Row(out))
        }
    }

    struct NoopAudit;
    #[async_trait]
    impl AuditRecorder for NoopAudit {
        async fn begin_run(&self, _: elspeth_core::audit::RunRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn register_node(&self, _: elspeth_core::audit::NodeRegistration) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_node_state(&self, _: elspeth_core::audit::NodeStateRecord) -> Result<i64, ElspethError> {
            Ok(0)
        }
        async fn record_external_call(&self, _: elspeth_core::audit::ExternalCallRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_routing(&self, _: elspeth_core::audit::RoutingEventRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_batch(&self, _: elspeth_core::audit::BatchRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_secret_resolution(&self, _: elspeth_core::audit::SecretResolutionRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_validation_error(&self, _: elspeth_core::audit::ValidationErrorRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn get_incomplete_batches(&self, _: Uuid) -> Result<Vec<elspeth_core::audit::BatchRecord>, ElspethError> {
            Ok(vec![])
        }
        async fn update_batch_status(&self, _: &str, _: elspeth_core::audit::BatchStatus) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn retry_batch(&self, _: &str) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn max_call_index(&self, _: Uuid, _: &str) -> Result<u64, ElspethError> {
            Ok(0)
        }
        async fn complete_run(&self, _: Uuid, _: elspeth_core::audit::RunStatus) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn export_records(&self, _: Uuid) -> Result<elspeth_core::audit::AuditExport, ElspethError> {
            Ok(elspeth_core::audit::AuditExport::default())
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Uuid::new_v4(), Arc::new(NoopAudit), Arc::new(SystemClock), &RunConfig::default())
    }

    fn row_with_value(v: i64) -> RowData {
        let mut row = RowData::new();
        row.insert("value".into(), Value::Int(v));
        row
    }

    #[tokio::test]
    async fn count_trigger_fires_on_exactly_nth_row() {
        let mut executor = AggregationExecutor::new("agg", AggregationConfig {
            trigger: TriggerExpr::Count { threshold: 5 },
            output_mode: AggregationOutputMode::Single,
            quiet_seconds: None,
        });
        let now = chrono::Utc::now();
        for i in 1..5 {
            let token = Token::new_source_token(i.to_string(), row_with_value(i as i64));
            assert!(!executor.push(token, row_with_value(i as i64), now));
        }
        let token = Token::new_source_token("5", row_with_value(5));
        assert!(executor.push(token, row_with_value(5), now));
        assert_eq!(executor.member_count(), 5);
    }

    #[tokio::test]
    async fn timeout_does_not_fire_on_empty_buffer_but_fires_once_populated() {
        let executor = AggregationExecutor::new("agg", AggregationConfig {
            trigger: TriggerExpr::Timeout { seconds: 10 },
            output_mode: AggregationOutputMode::Single,
            quiet_seconds: None,
        });
        let now = chrono::Utc::now();
        assert!(!executor.timeout_trigger_fires(now + chrono::Duration::seconds(100)));
    }

    #[tokio::test]
    async fn single_mode_flush_produces_one_aggregated_token() {
        let transform = SumTransform { schema: SchemaContract::observed(), on_error: OnError::Fatal };
        let mut executor = AggregationExecutor::new("agg", AggregationConfig {
            trigger: TriggerExpr::Count { threshold: 5 },
            output_mode: AggregationOutputMode::Single,
            quiet_seconds: None,
        });
        let now = chrono::Utc::now();
        for i in 1..=5 {
            let token = Token::new_source_token(i.to_string(), row_with_value(i));
            executor.push(token, row_with_value(i), now);
        }
        let (outcome, state) = executor.flush(&transform, &ctx(), TriggerKind::Count).await.unwrap();
        assert_eq!(state, BatchState::Completed);
        assert_eq!(outcome.member_count, 5);
        assert_eq!(outcome.outputs.len(), 1);
        let (token, disposition) = &outcome.outputs[0];
        assert_eq!(token.row_data.get("sum"), Some(&Value::Int(15)));
        assert_eq!(*disposition, FlushDisposition::Continue);
        assert!(!executor.has_pending());
    }

    #[tokio::test]
    async fn passthrough_mode_returns_original_tokens_for_downstream_rebuffering() {
        struct Identity {
            schema: SchemaContract,
            on_error: OnError,
        }
        #[async_trait]
        impl Operator for Identity {
            fn name(&self) -> &str {
                "identity"
            }
        }
        #[async_trait]
        impl Transform for Identity {
            fn input_schema(&self) -> &SchemaContract {
                &self.schema
            }
            fn output_schema(&self) -> &SchemaContract {
                &self.schema
            }
            fn schema_config(&self) -> SchemaConfig {
                SchemaConfig::default()
            }
            fn on_error(&self) -> &OnError {
                &self.on_error
            }
            async fn process(&self, row: RowData, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
                Ok(TransformOutput::Row(row))
            }
            async fn process_batch(&self, _rows: Vec<RowData>, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
                Ok(TransformOutput::Row(RowData::new()))
            }
        }
        let transform = Identity { schema: SchemaContract::observed(), on_error: OnError::Fatal };
        let mut executor = AggregationExecutor::new("agg", AggregationConfig {
            trigger: TriggerExpr::Count { threshold: 2 },
            output_mode: AggregationOutputMode::Passthrough,
            quiet_seconds: None,
        });
        let now = chrono::Utc::now();
        executor.push(Token::new_source_token("1", row_with_value(1)), row_with_value(1), now);
        executor.push(Token::new_source_token("2", row_with_value(2)), row_with_value(2), now);
        let (outcome, _) = executor.flush(&transform, &ctx(), TriggerKind::Count).await.unwrap();
        assert_eq!(outcome.outputs.len(), 2);
        assert!(outcome.outputs.iter().all(|(_, d)| *d == FlushDisposition::Passthrough));
    }

    #[tokio::test]
    async fn transform_mode_drops_unmatched_inputs_and_counts_them() {
        struct HalfOutput {
            schema: SchemaContract,
            on_error: OnError,
        }
        #[async_trait]
        impl Operator for HalfOutput {
            fn name(&self) -> &str {
                "half"
            }
        }
        #[async_trait]
        impl Transform for HalfOutput {
            fn input_schema(&self) -> &SchemaContract {
                &self.schema
            }
            fn output_schema(&self) -> &SchemaContract {
                &self.schema
            }
            fn schema_config(&self) -> SchemaConfig {
                SchemaConfig::default()
            }
            fn on_error(&self) -> &OnError {
                &self.on_error
            }
            async fn process(&self, row: RowData, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
                Ok(TransformOutput::Row(row))
            }
            async fn process_batch(&self, rows: Vec<RowData>, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
                Ok(TransformOutput::Expanded(rows.into_iter().take(1).collect()))
            }
        }
        let transform = HalfOutput { schema: SchemaContract::observed(), on_error: OnError::Fatal };
        let mut executor = AggregationExecutor::new("agg", AggregationConfig {
            trigger: TriggerExpr::Count { threshold: 3 },
            output_mode: AggregationOutputMode::Transform,
            quiet_seconds: None,
        });
        let now = chrono::Utc::now();
        for i in 1..=3 {
            executor.push(Token::new_source_token(i.to_string(), row_with_value(i)), row_with_value(i), now);
        }
        let (outcome, _) = executor.flush(&transform, &ctx(), TriggerKind::Count).await.unwrap();
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.rows_dropped, 2);
    }
}
