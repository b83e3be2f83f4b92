//! Error taxonomy: every error carries a structured reason so routing
//! events and the audit trail can handle failures uniformly, rather than
//! relying on exceptions for control flow.

use serde::{Deserialize, Serialize};

/// Stable classification of an error's cause, independent of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    SchemaViolation,
    TransformExecution,
    AggregationFailure,
    CoalesceFailure,
    Infrastructure,
    InvariantViolation,
    InvalidValue,
    Timeout,
}

/// The structured reason carried by every error in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReason {
    pub field: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorReason {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        ErrorReason { field: None, kind, message: message.into(), retryable }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "[{:?}] {field}: {}", self.kind, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

/// The engine's closed error type. Plugin-facing boundaries use
/// `anyhow::Result` for opaque/contextual errors; engine-internal
/// decisions need the structured reason to route on.
#[derive(Debug, thiserror::Error)]
pub enum ElspethError {
    #[error("configuration error: {0}")]
    Configuration(ErrorReason),

    #[error("schema violation: {0}")]
    Validation(ErrorReason),

    #[error("transform execution error: {0}")]
    Transform(ErrorReason),

    #[error("aggregation failure: {0}")]
    Aggregation(ErrorReason),

    #[error("coalesce failure: {0}")]
    Coalesce(ErrorReason),

    #[error("infrastructure error: {0}")]
    Infrastructure(ErrorReason),

    #[error("invariant violation: {0}")]
    Invariant(ErrorReason),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ElspethError {
    /// Extract the structured reason, if this variant carries one.
    /// `Other` (opaque anyhow errors) has no structured reason and is
    /// always treated as non-retryable, fatal.
    pub fn reason(&self) -> Option<&ErrorReason> {
        match self {
            ElspethError::Configuration(r)
            | ElspethError::Validation(r)
            | ElspethError::Transform(r)
            | ElspethError::Aggregation(r)
            | ElspethError::Coalesce(r)
            | ElspethError::Infrastructure(r)
            | ElspethError::Invariant(r) => Some(r),
            ElspethError::Other(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason().map(|r| r.retryable).unwrap_or(false)
    }
}
