//! CSV file source: a row-at-a-time reader producing `Value`/`RowData`
//! rows against a declared schema.
//!
//! Columns are mapped to the declared schema by position, not by header
//! name — a CSV with a header row still has that row skipped when
//! `has_header` is set, but the header text itself is not consulted for
//! field matching. Values are parsed according to each field's declared
//! `ValueType`; a column that fails to parse is kept as a raw string,
//! which then surfaces as a `TypeMismatch` violation and quarantines the
//! row rather than panicking or silently coercing.

use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::schema::DeclaredSchema;
use elspeth_core::traits::{RoutePolicy, SourceRow};
use elspeth_core::{Operator, RowData, RunContext, SchemaConfig, SchemaContract, Source, Value, ValueType};
use tracing::{info, warn};

fn io_err(context: &str, err: impl std::fmt::Display) -> ElspethError {
    ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("{context}: {err}"), false))
}

fn parse_value(raw: &str, expected: ValueType) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    match expected {
        ValueType::Int => raw.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::String(raw.to_string())),
        ValueType::Float => raw.parse::<f64>().map(Value::Float).unwrap_or_else(|_| Value::String(raw.to_string())),
        ValueType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        ValueType::String | ValueType::Bytes | ValueType::List | ValueType::Map | ValueType::Object | ValueType::Null => {
            Value::String(raw.to_string())
        }
    }
}

pub struct CsvSource {
    id: String,
    path: PathBuf,
    has_header: bool,
    delimiter: u8,
    contract: SchemaContract,
    on_validation_failure: RoutePolicy,
    reader: Option<csv::Reader<File>>,
    row_index: u64,
}

impl CsvSource {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        declared_schema: &DeclaredSchema,
        has_header: bool,
        delimiter: u8,
        on_validation_failure: RoutePolicy,
    ) -> Self {
        CsvSource {
            id: id.into(),
            path: path.into(),
            has_header,
            delimiter,
            contract: SchemaContract::create_output_contract_from_schema(declared_schema),
            on_validation_failure,
            reader: None,
            row_index: 0,
        }
    }
}

#[async_trait]
impl Operator for CsvSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for CsvSource {
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
        info!(source = %self.id, path = %self.path.display(), "opening CSV source");
        let file = File::open(&self.path).map_err(|e| io_err(&format!("opening {}", self.path.display()), e))?;
        let reader = csv::ReaderBuilder::new().has_headers(self.has_header).delimiter(self.delimiter).from_reader(file);
        self.reader = Some(reader);
        Ok(())
    }

    async fn next_row(&mut self, _ctx: &RunContext) -> Result<Option<SourceRow>, ElspethError> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            ElspethError::Invariant(ErrorReason::new(ErrorKind::InvariantViolation, "CsvSource::next_row called before open", false))
        })?;

        let mut record = csv::StringRecord::new();
        let has_more = reader.read_record(&mut record).map_err(|e| io_err("reading CSV record", e))?;
        if !has_more {
            info!(source = %self.id, rows_read = self.row_index, "CSV source exhausted");
            return Ok(None);
        }
        self.row_index += 1;

        let mut row = RowData::new();
        for (field, raw) in self.contract.fields.iter().zip(record.iter()) {
            row.insert(field.normalized_name.clone(), parse_value(raw, field.value_type));
        }

        let violations = self.contract.validate_output_against_contract(&row);
        if !violations.is_empty() {
            warn!(source = %self.id, row_index = self.row_index, ?violations, "row quarantined by schema contract");
        }
        let validation_errors = violations.iter().map(|v| format!("{v:?}")).collect();
        Ok(Some(SourceRow {
            row_id: format!("{}:{}", self.id, self.row_index),
            row,
            is_quarantined: !violations.is_empty(),
            validation_errors,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_core::schema::DeclaredField;
    use elspeth_core::{Clock, SystemClock};
    use std::io::Write;
    use std::sync::Arc;

    fn declared() -> DeclaredSchema {
        DeclaredSchema {
            fields: vec![
                DeclaredField { normalized_name: "id".into(), original_name: None, value_type: ValueType::Int, required: true },
                DeclaredField { normalized_name: "name".into(), original_name: None, value_type: ValueType::String, required: true },
            ],
            allow_extras: false,
        }
    }

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn ctx() -> RunContext {
        struct NoopAudit;
        #[async_trait]
        impl elspeth_core::audit::AuditRecorder for NoopAudit {
            async fn begin_run(&self, _r: elspeth_core::audit::RunRecord) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn register_node(&self, _n: elspeth_core::audit::NodeRegistration) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn record_node_state(&self, _r: elspeth_core::audit::NodeStateRecord) -> Result<i64, ElspethError> {
                Ok(0)
            }
            async fn record_external_call(&self, _r: elspeth_core::audit::ExternalCallRecord) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn record_routing(&self, _r: elspeth_core::audit::RoutingEventRecord) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn record_batch(&self, _r: elspeth_core::audit::BatchRecord) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn record_secret_resolution(&self, _r: elspeth_core::audit::SecretResolutionRecord) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn record_validation_error(&self, _r: elspeth_core::audit::ValidationErrorRecord) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn get_incomplete_batches(&self, _run_id: uuid::Uuid) -> Result<Vec<elspeth_core::audit::BatchRecord>, ElspethError> {
                Ok(Vec::new())
            }
            async fn update_batch_status(&self, _batch_id: &str, _status: elspeth_core::audit::BatchStatus) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn retry_batch(&self, _batch_id: &str) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn max_call_index(&self, _run_id: uuid::Uuid, _node_id: &str) -> Result<u64, ElspethError> {
                Ok(0)
            }
            async fn complete_run(&self, _run_id: uuid::Uuid, _status: elspeth_core::audit::RunStatus) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn export_records(&self, _run_id: uuid::Uuid) -> Result<elspeth_core::audit::AuditExport, ElspethError> {
                Ok(elspeth_core::audit::AuditExport::default())
            }
        }
        RunContext::new(uuid::Uuid::new_v4(), Arc::new(NoopAudit), Arc::new(SystemClock) as Arc<dyn Clock>, &elspeth_core::config::RunConfig::default())
    }

    #[tokio::test]
    async fn reads_rows_in_order_skipping_header() {
        let file = write_csv("id,name\n1,alice\n2,bob\n");
        let mut source = CsvSource::new("csv", file.path(), &declared(), true, b',', RoutePolicy::Discard);
        let ctx = ctx();
        source.open(&ctx).await.unwrap();

        let first = source.next_row(&ctx).await.unwrap().unwrap();
        assert!(!first.is_quarantined);
        assert_eq!(first.row.get("id"), Some(&Value::Int(1)));
        assert_eq!(first.row.get("name"), Some(&Value::String("alice".into())));

        let second = source.next_row(&ctx).await.unwrap().unwrap();
        assert_eq!(second.row.get("id"), Some(&Value::Int(2)));

        assert!(source.next_row(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_int_column_quarantines_the_row() {
        let file = write_csv("id,name\nnotanint,alice\n");
        let mut source = CsvSource::new("csv", file.path(), &declared(), true, b',', RoutePolicy::Discard);
        let ctx = ctx();
        source.open(&ctx).await.unwrap();
        let row = source.next_row(&ctx).await.unwrap().unwrap();
        assert!(row.is_quarantined);
    }
}
