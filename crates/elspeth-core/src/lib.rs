//! # Elspeth Core
//!
//! Foundational types for the Elspeth pipeline engine: the token model,
//! the dynamic row-value model, schema contracts, the plugin traits
//! (`Source`/`Transform`/`Sink`), the run-scoped context, the audit
//! recorder contract, and the configuration surface.
//!
//! Concrete plugins, the execution graph, and the executors that drive
//! tokens through a graph live in sibling crates (`elspeth-io`,
//! `elspeth-graph`, `elspeth-exec`); this crate only fixes the contracts
//! they all share.

pub mod audit;
pub mod canonical;
pub mod config;
pub mod context;
pub mod error;
pub mod schema;
pub mod token;
pub mod traits;
pub mod value;

pub use context::{Clock, NoopRateLimiter, RateLimiter, RunContext, SystemClock};
pub use error::{ElspethError, ErrorKind, ErrorReason};
pub use schema::{ContractMode, ContractViolation, FieldContract, HeaderMode, SchemaConfig, SchemaContract};
pub use token::{Lineage, Token};
pub use traits::{
    ArtifactDescriptor, BatchAwareTransform, BatchResultSender, OnError, Operator, RoutePolicy, Sink, Source,
    SourceRow, Transform, TransformOutput,
};
pub use value::{RowData, Value, ValueType};
