//! Row Processor: drives one token through the graph, from the node it
//! enters at through to a terminal or absorbing outcome.
//!
//! The processor holds no state of its own between calls — the coalesce
//! and aggregation executors are owned by whatever caller drives a run
//! (the orchestrator) and passed in by mutable reference each time. A
//! single `process_token` call can still produce many results: fork
//! branches, coalesce continuations, and aggregation flush outputs all
//! become new work items that re-enter the same call's local queue
//! rather than recursive calls, so a deeply forking/aggregating pipeline
//! doesn't grow the call stack.

use std::collections::{HashMap, VecDeque};

use elspeth_core::audit::{
    AuditRecorder, BatchRecord, BatchStatus, NodeStateRecord, NodeStateStatus, RoutingEventRecord, ValidationErrorRecord,
};
use elspeth_core::config::{OnIncomplete, RetryConfig};
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::token::Token;
use elspeth_core::traits::{OnError, Transform, TransformOutput};
use elspeth_core::value::RowData;
use elspeth_core::RunContext;
use elspeth_graph::{ExecutionGraph, NodePlugin, TransformBehavior};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::aggregation::{AggregationExecutor, FlushOutcome, TriggerKind};
use crate::batch_adapter::BatchAwareRegistry;
use crate::coalesce::{CoalesceArrival, CoalesceExecutor, CoalesceFailureReason};
use crate::outcome::{Outcome, ProcessResult};
use crate::retry::with_retry;
use crate::work::WorkItem;

fn invariant(message: impl Into<String>) -> ElspethError {
    ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, message, false))
}

fn row_fingerprint(row: &RowData) -> String {
    let canonical = elspeth_core::canonical::canonical_json(row).expect("row data always serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// What a single regular-transform call produced, resolved against the
/// node's declared `TransformBehavior`.
enum TransformStep {
    Continue(Token),
    Forked(Vec<(String, Token)>),
    Expanded(Vec<Token>),
}

pub struct RowProcessor<'a> {
    graph: &'a ExecutionGraph,
    batch_registry: &'a BatchAwareRegistry,
    retry_config: &'a RetryConfig,
}

impl<'a> RowProcessor<'a> {
    pub fn new(graph: &'a ExecutionGraph, batch_registry: &'a BatchAwareRegistry, retry_config: &'a RetryConfig) -> Self {
        RowProcessor { graph, batch_registry, retry_config }
    }

    /// Drive `token` from `start_node` to completion, returning every
    /// terminal/absorbing result produced along the way (a fork or an
    /// aggregation flush can produce more than one).
    pub async fn process_token(
        &self,
        token: Token,
        start_node: &str,
        ctx: &RunContext,
        coalesce_execs: &mut HashMap<String, CoalesceExecutor>,
        aggregation_execs: &mut HashMap<String, AggregationExecutor>,
    ) -> Result<Vec<ProcessResult>, ElspethError> {
        let mut queue = VecDeque::new();
        queue.push_back(WorkItem::new(token, start_node));
        let mut results = Vec::new();
        self.drain_queue(&mut queue, ctx, coalesce_execs, aggregation_execs, &mut results).await?;
        Ok(results)
    }

    /// Drain a queue of work items to completion, the way `process_token`
    /// drains the one it seeds internally. Exposed so the orchestrator can
    /// continue a queue seeded by `flush_aggregation` (a timeout or
    /// end-of-source flush, rather than a row arriving mid-pipeline).
    pub async fn drain_queue(
        &self,
        queue: &mut VecDeque<WorkItem>,
        ctx: &RunContext,
        coalesce_execs: &mut HashMap<String, CoalesceExecutor>,
        aggregation_execs: &mut HashMap<String, AggregationExecutor>,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        while let Some(item) = queue.pop_front() {
            self.drive(item, ctx, coalesce_execs, aggregation_execs, queue, results).await?;
        }
        Ok(())
    }

    async fn drive(
        &self,
        item: WorkItem,
        ctx: &RunContext,
        coalesce_execs: &mut HashMap<String, CoalesceExecutor>,
        aggregation_execs: &mut HashMap<String, AggregationExecutor>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        let WorkItem { token, start_node, coalesce_at_node, .. } = item;

        if let Some(coalesce_node) = coalesce_at_node {
            return self.handle_coalesce_arrival(&coalesce_node, token, ctx, coalesce_execs, queue, results).await;
        }

        let mut token = token;
        let mut current_node_id = start_node;

        loop {
            let node = self
                .graph
                .node(&current_node_id)
                .ok_or_else(|| invariant(format!("processor reached unknown node '{current_node_id}'")))?;

            match &node.plugin {
                NodePlugin::Source(_) => {
                    return Err(invariant(format!("processor reached source node '{current_node_id}' mid-pipeline")));
                }

                NodePlugin::Sink(_) => {
                    self.record_state(ctx, &token, &current_node_id, NodeStateStatus::Completed, None, Some(&token.row_data))
                        .await?;
                    results.push(ProcessResult::completed(token, current_node_id));
                    return Ok(());
                }

                NodePlugin::Coalesce(_) => {
                    return self.handle_coalesce_arrival(&current_node_id, token, ctx, coalesce_execs, queue, results).await;
                }

                NodePlugin::Aggregation(transform, _config) => {
                    return self
                        .handle_aggregation(&current_node_id, transform.as_ref(), token, ctx, aggregation_execs, queue, results)
                        .await;
                }

                NodePlugin::Transform(transform, behavior) => {
                    match self.run_transform(&current_node_id, transform.as_ref(), *behavior, &token, ctx).await {
                        Ok(TransformStep::Continue(next_token)) => {
                            self.record_state(
                                ctx,
                                &next_token,
                                &current_node_id,
                                NodeStateStatus::Completed,
                                Some(&token.row_data),
                                Some(&next_token.row_data),
                            )
                            .await?;
                            let next = self.single_outgoing(&current_node_id)?;
                            token = next_token;
                            current_node_id = next;
                            continue;
                        }
                        Ok(TransformStep::Forked(children)) => {
                            self.record_state(ctx, &token, &current_node_id, NodeStateStatus::Forked, Some(&token.row_data), None)
                                .await?;
                            results.push(ProcessResult::absorbing(Outcome::Forked, token.clone()));
                            for (label, child) in children {
                                self.enqueue_via_edge(&current_node_id, &label, child, queue)?;
                            }
                            return Ok(());
                        }
                        Ok(TransformStep::Expanded(children)) => {
                            self.record_state(ctx, &token, &current_node_id, NodeStateStatus::Expanded, Some(&token.row_data), None)
                                .await?;
                            results.push(ProcessResult::absorbing(Outcome::Expanded, token.clone()));
                            let next = self.single_outgoing(&current_node_id)?;
                            for child in children {
                                queue.push_back(WorkItem::new(child, next.clone()));
                            }
                            return Ok(());
                        }
                        Err(err) => {
                            let reason = reason_of(&err);
                            self.record_state(ctx, &token, &current_node_id, NodeStateStatus::Failed, Some(&token.row_data), None)
                                .await?;
                            self.route_failed_token(&current_node_id, token, reason, transform.on_error(), ctx, results).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn run_transform(
        &self,
        node_id: &str,
        transform: &dyn Transform,
        behavior: TransformBehavior,
        token: &Token,
        ctx: &RunContext,
    ) -> Result<TransformStep, ElspethError> {
        let output = if self.batch_registry.contains(node_id) {
            let (batch_transform, adapter) =
                self.batch_registry.get(node_id).expect("contains() just confirmed the entry exists");
            let row = adapter.submit_and_wait(batch_transform.as_ref(), token.token_id, token.row_data.clone(), ctx).await?;
            TransformOutput::Row(row)
        } else {
            with_retry(self.retry_config, |_attempt| transform.process(token.row_data.clone(), ctx)).await?
        };

        match (behavior, output) {
            (TransformBehavior::Regular, TransformOutput::Row(row)) => {
                let mut next = token.clone();
                next.row_data = row;
                Ok(TransformStep::Continue(next))
            }
            (TransformBehavior::Fork, TransformOutput::Forked(branches)) => {
                let children = branches.into_iter().map(|(label, row)| (label.clone(), Token::fork_child(token, label, Some(row)))).collect();
                Ok(TransformStep::Forked(children))
            }
            (TransformBehavior::Deaggregation, TransformOutput::Expanded(rows)) => {
                let children = rows.into_iter().map(|row| Token::deaggregation_child(token, row, None)).collect();
                Ok(TransformStep::Expanded(children))
            }
            (behavior, _) => Err(invariant(format!(
                "node '{node_id}' is declared {behavior:?} but its transform returned a mismatched output shape"
            ))),
        }
    }

    /// Hand an arriving token to the node's coalesce executor and act on
    /// the result: emit and continue, absorb silently (recording a
    /// routing event for a duplicate), or fail it out per `on_incomplete`.
    async fn handle_coalesce_arrival(
        &self,
        node_id: &str,
        token: Token,
        ctx: &RunContext,
        coalesce_execs: &mut HashMap<String, CoalesceExecutor>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        let executor = coalesce_execs
            .get_mut(node_id)
            .ok_or_else(|| invariant(format!("no coalesce executor registered for node '{node_id}'")))?;

        match executor.arrive(token.clone(), ctx.now()) {
            CoalesceArrival::Emitted(merged) => {
                self.record_state(ctx, &merged, node_id, NodeStateStatus::Coalesced, None, Some(&merged.row_data)).await?;
                results.push(ProcessResult::absorbing(Outcome::Coalesced, merged.clone()));
                let next = self.single_outgoing(node_id)?;
                queue.push_back(WorkItem::new(merged, next));
                Ok(())
            }
            CoalesceArrival::Absorbed { duplicate } => {
                self.record_state(ctx, &token, node_id, NodeStateStatus::ConsumedInBatch, Some(&token.row_data), None).await?;
                if duplicate {
                    self.record_routing(ctx, node_id, node_id, None, "duplicate branch arrival absorbed").await?;
                }
                results.push(ProcessResult::absorbing(Outcome::ConsumedInBatch, token));
                Ok(())
            }
            CoalesceArrival::Failed(reason) => {
                let on_incomplete = executor.on_incomplete().clone();
                self.handle_coalesce_failure(node_id, token, reason, &on_incomplete, ctx, results).await
            }
        }
    }

    /// Sweep a coalesce node's pending keys for expired timeouts and route
    /// each per the node's configured `on_incomplete` fallback. Called by
    /// the orchestrator's main loop alongside aggregation timeout checks.
    pub async fn check_coalesce_timeouts(
        &self,
        node_id: &str,
        ctx: &RunContext,
        coalesce_execs: &mut HashMap<String, CoalesceExecutor>,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        let executor = coalesce_execs
            .get_mut(node_id)
            .ok_or_else(|| invariant(format!("no coalesce executor registered for node '{node_id}'")))?;
        let expired = executor.check_timeouts(ctx.now());
        if expired.is_empty() {
            return Ok(());
        }
        let on_incomplete = executor.on_incomplete().clone();
        for (_key, reason, partial) in expired {
            self.handle_coalesce_failure(node_id, partial, reason, &on_incomplete, ctx, results).await?;
        }
        Ok(())
    }

    async fn handle_coalesce_failure(
        &self,
        node_id: &str,
        token: Token,
        reason: CoalesceFailureReason,
        on_incomplete: &OnIncomplete,
        ctx: &RunContext,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        let message = match reason {
            CoalesceFailureReason::QuorumNotMet => "coalesce timed out before its quorum was reached",
            CoalesceFailureReason::IncompleteBranches => "coalesce timed out with incomplete branch arrivals",
        };
        let error_reason = ErrorReason::new(ErrorKind::CoalesceFailure, message, false);
        match on_incomplete {
            OnIncomplete::Fail => {
                self.record_state(ctx, &token, node_id, NodeStateStatus::Failed, Some(&token.row_data), None).await?;
                results.push(ProcessResult::failed(token, error_reason));
            }
            OnIncomplete::Route { sink } => {
                self.record_state(ctx, &token, node_id, NodeStateStatus::Routed, Some(&token.row_data), None).await?;
                self.record_routing(ctx, node_id, sink, None, error_reason.message.clone()).await?;
                results.push(ProcessResult::routed(token, sink.clone(), error_reason));
            }
        }
        Ok(())
    }

    /// Buffer a row into its node's windowed aggregation, flushing through
    /// the node's batch-aware transform if the trigger just fired.
    async fn handle_aggregation(
        &self,
        node_id: &str,
        transform: &dyn Transform,
        token: Token,
        ctx: &RunContext,
        aggregation_execs: &mut HashMap<String, AggregationExecutor>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        let now = ctx.now();
        let row = token.row_data.clone();

        let fires = {
            let executor = aggregation_execs
                .get_mut(node_id)
                .ok_or_else(|| invariant(format!("no aggregation executor registered for node '{node_id}'")))?;
            executor.push(token.clone(), row, now)
        };
        self.record_state(ctx, &token, node_id, NodeStateStatus::Buffered, Some(&token.row_data), None).await?;
        results.push(ProcessResult::absorbing(Outcome::Buffered, token));

        if !fires {
            return Ok(());
        }
        self.flush_aggregation(node_id, transform, ctx, aggregation_execs, queue, results, None).await
    }

    /// Force a flush regardless of trigger state — used by the orchestrator
    /// for timeout-driven and end-of-source flushes. `forced_trigger`
    /// overrides the trigger-kind label recorded on the batch (e.g.
    /// `EndOfSource` for a flush forced by source exhaustion rather than
    /// the node's own configured trigger firing); `None` keeps the
    /// executor's own classification, as the count-triggered path above does.
    pub async fn flush_aggregation(
        &self,
        node_id: &str,
        transform: &dyn Transform,
        ctx: &RunContext,
        aggregation_execs: &mut HashMap<String, AggregationExecutor>,
        queue: &mut VecDeque<WorkItem>,
        results: &mut Vec<ProcessResult>,
        forced_trigger: Option<TriggerKind>,
    ) -> Result<(), ElspethError> {
        let (trigger, started_at) = {
            let executor = aggregation_execs
                .get_mut(node_id)
                .ok_or_else(|| invariant(format!("no aggregation executor registered for node '{node_id}'")))?;
            (forced_trigger.unwrap_or_else(|| executor.active_trigger_kind()), executor.started_at())
        };
        let executor = aggregation_execs.get_mut(node_id).expect("checked above");
        let batch_id_before = executor.batch_id().map(str::to_string);
        let member_count_before = executor.member_count();
        let members_json_before = executor.pending_members_json()?;
        tracing::debug!(node_id, trigger = trigger.as_str(), member_count = member_count_before, "flushing aggregation batch");

        // Record the batch as `Executing`, carrying its member rows, before
        // the flush call pops the buffer — the buffer is the only durable
        // copy of those rows once `flush` hands them to the transform, so a
        // crash mid-flush would otherwise leave nothing for `resume` to
        // retry from.
        if let Some(batch_id) = &batch_id_before {
            ctx.audit
                .record_batch(BatchRecord {
                    batch_id: batch_id.clone(),
                    node_id: node_id.to_string(),
                    status: BatchStatus::Executing,
                    started_at: started_at.unwrap_or_else(|| ctx.now()),
                    completed_at: None,
                    member_count: member_count_before,
                    trigger_kind: trigger.as_str().to_string(),
                    members_json: Some(members_json_before),
                })
                .await?;
        }

        let flushed = aggregation_execs.get_mut(node_id).expect("checked above").flush(transform, ctx, trigger).await;
        match flushed {
            Ok((outcome, _state)) => {
                if batch_id_before.is_some() {
                    ctx.audit.update_batch_status(&outcome.batch_id, BatchStatus::Completed).await?;
                }
                self.record_dropped_rows(ctx, node_id, &outcome).await?;
                self.route_flush_outputs(node_id, outcome, queue).await?;
                Ok(())
            }
            Err((err, members)) => {
                if let Some(batch_id) = &batch_id_before {
                    ctx.audit.update_batch_status(batch_id, BatchStatus::Failed).await?;
                }
                let reason = reason_of(&err);
                for member in members {
                    self.route_failed_token(node_id, member, reason.clone(), transform.on_error(), ctx, results).await?;
                }
                Ok(())
            }
        }
    }

    async fn route_flush_outputs(&self, node_id: &str, outcome: FlushOutcome, queue: &mut VecDeque<WorkItem>) -> Result<(), ElspethError> {
        if outcome.outputs.is_empty() {
            return Ok(());
        }
        let next = self.single_outgoing(node_id)?;
        for (token, _disposition) in outcome.outputs {
            queue.push_back(WorkItem::new(token, next.clone()));
        }
        Ok(())
    }

    fn single_outgoing(&self, node_id: &str) -> Result<String, ElspethError> {
        self.graph
            .outgoing(node_id)
            .first()
            .map(|edge| edge.to.clone())
            .ok_or_else(|| invariant(format!("node '{node_id}' has no outgoing edge")))
    }

    fn enqueue_via_edge(&self, node_id: &str, label: &str, token: Token, queue: &mut VecDeque<WorkItem>) -> Result<(), ElspethError> {
        let edge = self
            .graph
            .outgoing(node_id)
            .into_iter()
            .find(|e| e.label.as_deref() == Some(label))
            .ok_or_else(|| invariant(format!("node '{node_id}' has no outgoing edge labelled '{label}'")))?;

        let destination = self.graph.node(&edge.to).ok_or_else(|| invariant(format!("edge targets unknown node '{}'", edge.to)))?;
        if matches!(destination.plugin, NodePlugin::Coalesce(_)) {
            queue.push_back(WorkItem::at_coalesce(token, edge.to.clone(), label.to_string()));
        } else {
            queue.push_back(WorkItem::new(token, edge.to.clone()));
        }
        Ok(())
    }

    /// Apply a node's `on_error` policy to one failed token: fatal (report
    /// as Failed), discard, or route to a named sink.
    async fn route_failed_token(
        &self,
        node_id: &str,
        token: Token,
        reason: ErrorReason,
        on_error: &OnError,
        ctx: &RunContext,
        results: &mut Vec<ProcessResult>,
    ) -> Result<(), ElspethError> {
        match on_error {
            OnError::Fatal => {
                warn!(token_id = %token.token_id, node_id, error = %reason.message, "transform failed, no on_error route: token failed");
                results.push(ProcessResult::failed(token, reason));
            }
            OnError::Discard => {
                warn!(token_id = %token.token_id, node_id, error = %reason.message, "transform failed, discarding token");
                self.record_state(ctx, &token, node_id, NodeStateStatus::Discarded, Some(&token.row_data), None).await?;
                results.push(ProcessResult::discarded(token));
            }
            OnError::Route(sink) => {
                warn!(token_id = %token.token_id, node_id, sink, error = %reason.message, "transform failed, routing token to error sink");
                self.record_state(ctx, &token, node_id, NodeStateStatus::Routed, Some(&token.row_data), None).await?;
                self.record_routing(ctx, node_id, sink, None, reason.message.clone()).await?;
                results.push(ProcessResult::routed(token, sink.clone(), reason));
            }
        }
        Ok(())
    }

    async fn record_state(
        &self,
        ctx: &RunContext,
        token: &Token,
        node_id: &str,
        status: NodeStateStatus,
        input: Option<&RowData>,
        output: Option<&RowData>,
    ) -> Result<i64, ElspethError> {
        let started_at = ctx.now();
        ctx.audit
            .record_node_state(NodeStateRecord {
                run_id: ctx.run_id,
                token_id: token.token_id,
                node_id: node_id.to_string(),
                status,
                input_hash: input.map(row_fingerprint),
                output_hash: output.map(row_fingerprint),
                duration_ms: 0,
                started_at,
            })
            .await
    }

    async fn record_routing(&self, ctx: &RunContext, from_node: &str, to_node: &str, label: Option<&str>, reason: impl Into<String>) -> Result<(), ElspethError> {
        ctx.audit
            .record_routing(RoutingEventRecord {
                state_id: 0,
                from_node: from_node.to_string(),
                to_node: to_node.to_string(),
                label: label.map(str::to_string),
                reason: reason.into(),
            })
            .await
    }

    async fn record_dropped_rows(&self, ctx: &RunContext, node_id: &str, outcome: &FlushOutcome) -> Result<(), ElspethError> {
        if outcome.rows_dropped > 0 {
            ctx.audit
                .record_validation_error(ValidationErrorRecord {
                    run_id: ctx.run_id,
                    node_id: node_id.to_string(),
                    token_id: None,
                    kind: "aggregation_underrun".to_string(),
                    message: format!(
                        "transform mode produced fewer output rows than buffered members; {} row(s) dropped",
                        outcome.rows_dropped
                    ),
                })
                .await?;
        }
        Ok(())
    }
}

fn reason_of(err: &ElspethError) -> ErrorReason {
    err.reason().cloned().unwrap_or_else(|| ErrorReason::new(ErrorKind::TransformExecution, err.to_string(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use elspeth_core::audit::{AuditRecorder, RunRecord, RunStatus};
    use elspeth_core::config::{AggregationConfig, AggregationOutputMode, CoalesceConfig, MergePolicy, MergeRule, OnIncomplete, RunConfig, TriggerExpr};
    use elspeth_core::schema::SchemaContract;
    use elspeth_core::value::Value;
    use elspeth_core::{Operator, SchemaConfig, SystemClock};
    use elspeth_graph::{Edge, EdgeMode, Node};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    struct RecordingAudit {
        states: Mutex<Vec<NodeStateStatus>>,
    }
    impl RecordingAudit {
        fn new() -> Self {
            RecordingAudit { states: Mutex::new(Vec::new()) }
        }
    }
    #[async_trait]
    impl AuditRecorder for RecordingAudit {
        async fn begin_run(&self, _: RunRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn register_node(&self, _: elspeth_core::audit::NodeRegistration) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_node_state(&self, record: NodeStateRecord) -> Result<i64, ElspethError> {
            self.states.lock().unwrap().push(record.status);
            Ok(self.states.lock().unwrap().len() as i64)
        }
        async fn record_external_call(&self, _: elspeth_core::audit::ExternalCallRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_routing(&self, _: RoutingEventRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_batch(&self, _: BatchRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_secret_resolution(&self, _: elspeth_core::audit::SecretResolutionRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn record_validation_error(&self, _: ValidationErrorRecord) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn get_incomplete_batches(&self, _: Uuid) -> Result<Vec<BatchRecord>, ElspethError> {
            Ok(vec![])
        }
        async fn update_batch_status(&self, _: &str, _: BatchStatus) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn retry_batch(&self, _: &str) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn max_call_index(&self, _: Uuid, _: &str) -> Result<u64, ElspethError> {
            Ok(0)
        }
        async fn complete_run(&self, _: Uuid, _: RunStatus) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn export_records(&self, _: Uuid) -> Result<elspeth_core::audit::AuditExport, ElspethError> {
            Ok(elspeth_core::audit::AuditExport::default())
        }
    }

    fn ctx_with(audit: Arc<dyn AuditRecorder>) -> RunContext {
        RunContext::new(Uuid::new_v4(), audit, Arc::new(SystemClock), &RunConfig::default())
    }

    struct Uppercase {
        schema: SchemaContract,
        on_error: OnError,
    }
    #[async_trait]
    impl Operator for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }
    }
    #[async_trait]
    impl Transform for Uppercase {
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
        async fn process(&self, mut row: RowData, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
            if let Some(Value::String(s)) = row.get("text").cloned() {
                row.insert("text".into(), Value::String(s.to_uppercase()));
            }
            Ok(TransformOutput::Row(row))
        }
    }

    struct AlwaysFails {
        schema: SchemaContract,
        on_error: OnError,
    }
    #[async_trait]
    impl Operator for AlwaysFails {
        fn name(&self) -> &str {
            "fails"
        }
    }
    #[async_trait]
    impl Transform for AlwaysFails {
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
        async fn process(&self, _row: RowData, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
            Err(ElspethError::Transform(ErrorReason::new(ErrorKind::TransformExecution, "boom", false)))
        }
    }

    fn row(text: &str) -> RowData {
        let mut r = RowData::new();
        r.insert("text".into(), Value::String(text.to_string()));
        r
    }

    #[tokio::test]
    async fn regular_transform_chain_completes_at_sink() {
        let schema = SchemaContract::observed();
        let nodes = vec![
            Node::new(
                "upper",
                NodePlugin::Transform(Box::new(Uppercase { schema: schema.clone(), on_error: OnError::Fatal }), TransformBehavior::Regular),
            ),
            Node::new("out", NodePlugin::Sink(Box::new(StubSink { schema: schema.clone() }))),
        ];
        let edges = vec![Edge::new("upper", "out", None, EdgeMode::Move)];
        let graph = ExecutionGraph::build(nodes, edges).unwrap();
        let registry = BatchAwareRegistry::new();
        let retry = RetryConfig::default();
        let processor = RowProcessor::new(&graph, &registry, &retry);

        let audit = Arc::new(RecordingAudit::new());
        let ctx = ctx_with(audit.clone());
        let token = Token::new_source_token("1", row("hello"));
        let mut coalesce = HashMap::new();
        let mut aggregation = HashMap::new();

        let results = processor.process_token(token, "upper", &ctx, &mut coalesce, &mut aggregation).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Completed);
        assert_eq!(results[0].token.row_data.get("text"), Some(&Value::String("HELLO".into())));
        assert!(audit.states.lock().unwrap().contains(&NodeStateStatus::Completed));
    }

    #[tokio::test]
    async fn fatal_error_surfaces_as_failed_without_panicking() {
        let schema = SchemaContract::observed();
        let nodes = vec![
            Node::new("boom", NodePlugin::Transform(Box::new(AlwaysFails { schema: schema.clone(), on_error: OnError::Fatal }), TransformBehavior::Regular)),
            Node::new("out", NodePlugin::Sink(Box::new(StubSink { schema }))),
        ];
        let edges = vec![Edge::new("boom", "out", None, EdgeMode::Move)];
        let graph = ExecutionGraph::build(nodes, edges).unwrap();
        let registry = BatchAwareRegistry::new();
        let retry = RetryConfig { max_attempts: 1, base_delay_ms: 1, max_delay_ms: 1, jitter: false };
        let processor = RowProcessor::new(&graph, &registry, &retry);
        let ctx = ctx_with(Arc::new(RecordingAudit::new()));

        let token = Token::new_source_token("1", row("x"));
        let mut coalesce = HashMap::new();
        let mut aggregation = HashMap::new();
        let results = processor.process_token(token, "boom", &ctx, &mut coalesce, &mut aggregation).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn route_on_error_sends_token_to_named_sink_outcome() {
        let schema = SchemaContract::observed();
        let nodes = vec![
            Node::new(
                "boom",
                NodePlugin::Transform(Box::new(AlwaysFails { schema: schema.clone(), on_error: OnError::Route("quarantine".into()) }), TransformBehavior::Regular),
            ),
            Node::new("out", NodePlugin::Sink(Box::new(StubSink { schema: schema.clone() }))),
            Node::new("quarantine", NodePlugin::Sink(Box::new(StubSink { schema }))),
        ];
        let edges = vec![Edge::new("boom", "out", None, EdgeMode::Move)];
        let graph = ExecutionGraph::build(nodes, edges).unwrap();
        let registry = BatchAwareRegistry::new();
        let retry = RetryConfig { max_attempts: 1, base_delay_ms: 1, max_delay_ms: 1, jitter: false };
        let processor = RowProcessor::new(&graph, &registry, &retry);
        let ctx = ctx_with(Arc::new(RecordingAudit::new()));

        let token = Token::new_source_token("1", row("x"));
        let mut coalesce = HashMap::new();
        let mut aggregation = HashMap::new();
        let results = processor.process_token(token, "boom", &ctx, &mut coalesce, &mut aggregation).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Routed);
        assert_eq!(results[0].sink_name.as_deref(), Some("quarantine"));
    }

    #[tokio::test]
    async fn fork_then_coalesce_merges_both_branches() {
        struct Splitter {
            schema: SchemaContract,
            on_error: OnError,
        }
        #[async_trait]
        impl Operator for Splitter {
            fn name(&self) -> &str {
                "splitter"
            }
        }
        #[async_trait]
        impl Transform for Splitter {
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
                let mut a = row.clone();
                a.insert("leg".into(), Value::String("a".into()));
                let mut b = row;
                b.insert("leg".into(), Value::String("b".into()));
                Ok(TransformOutput::Forked(vec![("a".into(), a), ("b".into(), b)]))
            }
        }

        let schema = SchemaContract::observed();
        let nodes = vec![
            Node::new("split", NodePlugin::Transform(Box::new(Splitter { schema: schema.clone(), on_error: OnError::Fatal }), TransformBehavior::Fork)),
            Node::new(
                "join",
                NodePlugin::Coalesce(CoalesceConfig {
                    merge_policy: MergePolicy::AllBranches,
                    timeout_seconds: None,
                    on_incomplete: OnIncomplete::Fail,
                    rule: MergeRule::FirstWins,
                    branch_priority: None,
                }),
            ),
            Node::new("out", NodePlugin::Sink(Box::new(StubSink { schema }))),
        ];
        let edges = vec![
            Edge::new("split", "join", Some("a".into()), EdgeMode::Copy),
            Edge::new("split", "join", Some("b".into()), EdgeMode::Copy),
            Edge::new("join", "out", None, EdgeMode::Move),
        ];
        let graph = ExecutionGraph::build(nodes, edges).unwrap();
        let registry = BatchAwareRegistry::new();
        let retry = RetryConfig::default();
        let processor = RowProcessor::new(&graph, &registry, &retry);
        let ctx = ctx_with(Arc::new(RecordingAudit::new()));

        let token = Token::new_source_token("1", row("hi"));
        let mut coalesce = HashMap::new();
        coalesce.insert("join".to_string(), CoalesceExecutor::new(
            CoalesceConfig {
                merge_policy: MergePolicy::AllBranches,
                timeout_seconds: None,
                on_incomplete: OnIncomplete::Fail,
                rule: MergeRule::FirstWins,
                branch_priority: None,
            },
            vec!["a".into(), "b".into()],
        ));
        let mut aggregation = HashMap::new();

        let results = processor.process_token(token, "split", &ctx, &mut coalesce, &mut aggregation).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, Outcome::Forked);
        assert_eq!(results[1].outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn aggregation_count_trigger_flushes_through_to_sink() {
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
                for r in &rows {
                    if let Some(Value::Int(v)) = r.get("value") {
                        sum += v;
                    }
                }
                let mut out = RowData::new();
                out.insert("sum".into(), Value::Int(sum));
                Ok(TransformOutput::Row(out))
            }
        }

        let schema = SchemaContract::observed();
        let nodes = vec![
            Node::new(
                "agg",
                NodePlugin::Aggregation(
                    Box::new(SumTransform { schema: schema.clone(), on_error: OnError::Fatal }),
                    AggregationConfig { trigger: TriggerExpr::Count { threshold: 2 }, output_mode: AggregationOutputMode::Single, quiet_seconds: None },
                ),
            ),
            Node::new("out", NodePlugin::Sink(Box::new(StubSink { schema }))),
        ];
        let edges = vec![Edge::new("agg", "out", None, EdgeMode::Move)];
        let graph = ExecutionGraph::build(nodes, edges).unwrap();
        let registry = BatchAwareRegistry::new();
        let retry = RetryConfig::default();
        let processor = RowProcessor::new(&graph, &registry, &retry);
        let ctx = ctx_with(Arc::new(RecordingAudit::new()));

        let mut coalesce = HashMap::new();
        let mut aggregation = HashMap::new();
        aggregation.insert(
            "agg".to_string(),
            AggregationExecutor::new("agg", AggregationConfig { trigger: TriggerExpr::Count { threshold: 2 }, output_mode: AggregationOutputMode::Single, quiet_seconds: None }),
        );

        let mut value_row = RowData::new();
        value_row.insert("value".into(), Value::Int(3));
        let first = processor
            .process_token(Token::new_source_token("1", value_row.clone()), "agg", &ctx, &mut coalesce, &mut aggregation)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].outcome, Outcome::Buffered);

        let mut value_row2 = RowData::new();
        value_row2.insert("value".into(), Value::Int(4));
        let second = processor
            .process_token(Token::new_source_token("2", value_row2), "agg", &ctx, &mut coalesce, &mut aggregation)
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].outcome, Outcome::Buffered);
        assert_eq!(second[1].outcome, Outcome::Completed);
        assert_eq!(second[1].token.row_data.get("sum"), Some(&Value::Int(7)));
    }

    struct StubSink {
        schema: SchemaContract,
    }
    #[async_trait]
    impl Operator for StubSink {
        fn name(&self) -> &str {
            "sink"
        }
    }
    #[async_trait]
    impl elspeth_core::Sink for StubSink {
        fn input_schema(&self) -> &SchemaContract {
            &self.schema
        }
        fn set_output_contract(&mut self, contract: SchemaContract) {
            self.schema = contract;
        }
        async fn write(&mut self, rows: Vec<RowData>, _ctx: &RunContext) -> Result<elspeth_core::ArtifactDescriptor, ElspethError> {
            Ok(elspeth_core::ArtifactDescriptor { sink_name: "sink".into(), rows_written: rows.len(), details: None })
        }
        async fn flush(&mut self) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ElspethError> {
            Ok(())
        }
    }
}
