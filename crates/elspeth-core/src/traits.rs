//! Plugin protocols: what the engine requires from collaborator
//! sources, transforms, and sinks. Concrete plugin implementations are
//! out of this crate's scope (see `elspeth-io` for reference plugins);
//! this module fixes only the contract.

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::{ElspethError, ErrorReason};
use crate::schema::{SchemaConfig, SchemaContract};
use crate::value::RowData;

/// Where a row goes when it fails an `on_error`/`on_validation_failure`
/// policy: a named sink, or discarded outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePolicy {
    Sink(String),
    Discard,
}

/// A transform's `on_error` policy: `None` means an error is fatal
/// (reported, surfaces as FAILED); otherwise it's discarded or routed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OnError {
    #[default]
    Fatal,
    Discard,
    Route(String),
}

/// A row read from a source, possibly already flagged as failing the
/// source's own schema validation.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub row_id: String,
    pub row: RowData,
    pub is_quarantined: bool,
    pub validation_errors: Vec<String>,
}

/// The output of a regular transform's `process` call.
///
/// Fork and deaggregation are *shapes* of a regular transform's output —
/// the row processor resolves which applies by looking at the graph
/// node's `TransformBehavior` together with the shape returned here —
/// not separate trait methods.
#[derive(Debug, Clone)]
pub enum TransformOutput {
    /// A single modified row.
    Row(RowData),
    /// Fork: one row per branch.
    Forked(Vec<(String, RowData)>),
    /// Deaggregation/expansion: zero or more output rows from one input.
    Expanded(Vec<RowData>),
}

/// Descriptor returned by a sink's `write`, summarizing what was written.
/// Intentionally opaque beyond identity + count — concrete sinks may
/// attach richer metadata via `details`.
#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    pub sink_name: String,
    pub rows_written: usize,
    pub details: Option<String>,
}

/// Common metadata every operator exposes.
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;
}

#[async_trait]
pub trait Source: Operator {
    fn output_schema(&self) -> &SchemaContract;
    fn schema_config(&self) -> SchemaConfig;
    fn on_validation_failure(&self) -> &RoutePolicy;

    /// Open the source (e.g. open a file, connect to a broker). Called
    /// once before the first `next_row`.
    async fn open(&mut self, ctx: &RunContext) -> Result<(), ElspethError>;

    /// Pull the next row as a pull protocol; `Ok(None)` signals
    /// exhaustion. Finite and restartable only via checkpoint-driven
    /// resume.
    async fn next_row(&mut self, ctx: &RunContext) -> Result<Option<SourceRow>, ElspethError>;
}

#[async_trait]
pub trait Transform: Operator {
    fn input_schema(&self) -> &SchemaContract;
    fn output_schema(&self) -> &SchemaContract;
    fn schema_config(&self) -> SchemaConfig;
    fn on_error(&self) -> &OnError;

    /// Whether this transform is batch-aware (fans out internally via a
    /// `SharedBatchAdapter`, e.g. an LLM or HTTP-batch transform). When
    /// true the row processor uses `accept`/the adapter instead of
    /// calling `process` directly; `process` may then be unimplemented
    /// (see default below).
    fn is_batch_aware(&self) -> bool {
        false
    }

    async fn process(&self, row: RowData, ctx: &RunContext) -> Result<TransformOutput, ElspethError>;

    /// Drive an aggregation flush: given every buffered row for
    /// a batch, produce the flush output. Only aggregation-capable
    /// transforms override this; a transform used purely as a regular
    /// pipeline step raises the same not-supported shape `process` does
    /// for a batch-aware transform that lacks row-at-a-time `process`.
    async fn process_batch(&self, _rows: Vec<RowData>, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
        Err(ElspethError::Transform(ErrorReason::new(
            crate::error::ErrorKind::TransformExecution,
            format!("transform '{}' does not support batch (aggregation) processing", self.name()),
            false,
        )))
    }
}

/// A sender half the engine hands to a batch-aware transform at
/// `connect_output` time; the transform's output port uses it to signal a
/// token's result once its internal worker pool completes the call,
/// independent of the order the engine submitted rows in.
pub type BatchResultSender = tokio::sync::mpsc::UnboundedSender<(uuid::Uuid, Result<RowData, ElspethError>)>;

/// Capability extension for batch-aware transforms. Detected at
/// graph-build time via a downcast/capability check, not a marker on
/// `Transform` itself, since not every transform needs it.
#[async_trait]
pub trait BatchAwareTransform: Transform {
    /// Wire this transform's output port to the engine's
    /// `SharedBatchAdapter`. Called once, on first use. `max_pending` is a
    /// capacity hint for the plugin's own internal pool; the engine does
    /// not enforce it.
    fn connect_output(&self, sender: BatchResultSender, max_pending: usize);

    /// Submit a row for processing by the plugin's internal worker pool.
    /// Non-blocking: the actual result arrives asynchronously through the
    /// sender registered via `connect_output`.
    async fn accept(&self, token_id: uuid::Uuid, row: RowData, ctx: &RunContext) -> Result<(), ElspethError>;
}

#[async_trait]
pub trait Sink: Operator {
    fn input_schema(&self) -> &SchemaContract;
    fn set_output_contract(&mut self, contract: SchemaContract);

    /// Most sinks have a static input contract; a sink writing to a
    /// schemaless store (e.g. a JSON blob sink) may override this to skip
    /// edge-compatibility checks, the same way a dynamic source/transform
    /// does.
    fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::default()
    }

    async fn write(&mut self, rows: Vec<RowData>, ctx: &RunContext) -> Result<ArtifactDescriptor, ElspethError>;
    async fn flush(&mut self) -> Result<(), ElspethError>;
    async fn close(&mut self) -> Result<(), ElspethError>;
}
