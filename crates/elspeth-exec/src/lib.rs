//! # Elspeth Exec
//!
//! The execution side of the engine: the row processor that drives a
//! single token through the graph, the coalesce and aggregation
//! executors it delegates to for fork/join and windowed-batch nodes, the
//! shared retry/rate-limit policies every transform call goes through,
//! and the orchestrator that drives a full run from an open source to
//! closed sinks.

pub mod aggregation;
pub mod batch_adapter;
pub mod coalesce;
pub mod orchestrator;
pub mod outcome;
pub mod processor;
pub mod rate_limit;
pub mod retry;
pub mod work;

pub use aggregation::{AggregationExecutor, BatchState, FlushDisposition, FlushOutcome, TriggerKind};
pub use batch_adapter::{BatchAwareAsTransform, BatchAwareRegistry, SharedBatchAdapter};
pub use coalesce::{CoalesceArrival, CoalesceExecutor, CoalesceFailureReason};
pub use orchestrator::{Orchestrator, RunSummary};
pub use outcome::{Outcome, ProcessResult};
pub use processor::RowProcessor;
pub use rate_limit::RateLimiterRegistry;
pub use retry::with_retry;
pub use work::WorkItem;
