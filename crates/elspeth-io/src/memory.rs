//! In-process `Source`/`Sink` pair for tests and small pipelines. Mirrors
//! `elspeth-audit::memory`'s shape: every row lives behind a single mutex,
//! with no ordering guarantees beyond insertion order.

use std::sync::Mutex;

use async_trait::async_trait;
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::traits::{ArtifactDescriptor, RoutePolicy, SourceRow};
use elspeth_core::{Operator, RowData, RunContext, SchemaConfig, SchemaContract, Sink, Source};

fn invariant(message: impl Into<String>) -> ElspethError {
    ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, message, false))
}

/// A fixed, pre-loaded row set played back one row at a time. Rows that
/// fail `contract.validate_output_against_contract` are surfaced as
/// quarantined rather than silently dropped, the same as a real source
/// would.
pub struct InMemorySource {
    id: String,
    contract: SchemaContract,
    on_validation_failure: RoutePolicy,
    rows: Mutex<Vec<RowData>>,
    cursor: usize,
}

impl InMemorySource {
    pub fn new(id: impl Into<String>, contract: SchemaContract, on_validation_failure: RoutePolicy, rows: Vec<RowData>) -> Self {
        InMemorySource { id: id.into(), contract, on_validation_failure, rows: Mutex::new(rows), cursor: 0 }
    }
}

#[async_trait]
impl Operator for InMemorySource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for InMemorySource {
    fn output_schema(&self) -> &SchemaContract {
        &self.contract
    }

    fn schema_config(&self) -> SchemaConfig {
        SchemaConfig::default()
    }

    fn on_validation_failure(&self) -> &RoutePolicy {
        &self.on_validation_failure
    }

    async fn open(&mut self, _ctx: &RunContext) -> Result<(), ElspethError> {
        Ok(())
    }

    async fn next_row(&mut self, _ctx: &RunContext) -> Result<Option<SourceRow>, ElspethError> {
        let row = {
            let rows = self.rows.lock().expect("poisoned");
            rows.get(self.cursor).cloned()
        };
        let Some(row) = row else { return Ok(None) };
        self.cursor += 1;

        let violations = self.contract.validate_output_against_contract(&row);
        let validation_errors = violations.iter().map(|v| format!("{v:?}")).collect();
        Ok(Some(SourceRow {
            row_id: format!("{}:{}", self.id, self.cursor - 1),
            row,
            is_quarantined: !violations.is_empty(),
            validation_errors,
        }))
    }
}

/// Collects every row written to it, for assertion after a run. `rows()`
/// returns a snapshot; the sink itself keeps accumulating until dropped.
#[derive(Default)]
pub struct InMemorySink {
    id: String,
    contract: SchemaContract,
    written: Mutex<Vec<RowData>>,
    flush_count: Mutex<u32>,
}

impl InMemorySink {
    pub fn new(id: impl Into<String>, contract: SchemaContract) -> Self {
        InMemorySink { id: id.into(), contract, written: Mutex::new(Vec::new()), flush_count: Mutex::new(0) }
    }

    pub fn rows(&self) -> Vec<RowData> {
        self.written.lock().expect("poisoned").clone()
    }

    pub fn flush_count(&self) -> u32 {
        *self.flush_count.lock().expect("poisoned")
    }
}

#[async_trait]
impl Operator for InMemorySink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for InMemorySink {
    fn input_schema(&self) -> &SchemaContract {
        &self.contract
    }

    fn set_output_contract(&mut self, contract: SchemaContract) {
        self.contract = contract;
    }

    async fn write(&mut self, rows: Vec<RowData>, _ctx: &RunContext) -> Result<ArtifactDescriptor, ElspethError> {
        let count = rows.len();
        self.written.lock().map_err(|_| invariant("InMemorySink mutex poisoned"))?.extend(rows);
        Ok(ArtifactDescriptor { sink_name: self.id.clone(), rows_written: count, details: None })
    }

    async fn flush(&mut self) -> Result<(), ElspethError> {
        *self.flush_count.lock().expect("poisoned") += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ElspethError> {
        Ok(())
    }
}
