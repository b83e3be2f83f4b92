//! JSON Lines sink: a row-at-a-time writer that can target stdout or a
//! file. Each row is written as one compact JSON object per line, the
//! common interchange format for downstream tailing and `jq`-style
//! inspection.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::traits::ArtifactDescriptor;
use elspeth_core::{Operator, RowData, RunContext, SchemaConfig, SchemaContract, Sink, Value};
use tracing::debug;

fn io_err(context: &str, err: impl std::fmt::Display) -> ElspethError {
    ElspethError::Infrastructure(ErrorReason::new(ErrorKind::Infrastructure, format!("{context}: {err}"), false))
}

/// Render a `Value` the way a consumer of the JSONL file would want it —
/// plain JSON, not the `{"type": ..., "value": ...}` tagged shape
/// `Value`'s own `Serialize` impl produces for internal round-tripping.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect()),
        Value::Object(json) => json.clone(),
        Value::Null => serde_json::Value::Null,
    }
}

fn row_to_json(row: &RowData) -> serde_json::Value {
    serde_json::Value::Object(row.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect())
}

enum Writer {
    Stdout,
    File(BufWriter<File>),
}

pub struct JsonLinesSink {
    id: String,
    contract: SchemaContract,
    writer: Writer,
    rows_written: usize,
}

impl JsonLinesSink {
    pub fn stdout(id: impl Into<String>, contract: SchemaContract) -> Self {
        JsonLinesSink { id: id.into(), contract, writer: Writer::Stdout, rows_written: 0 }
    }

    pub fn try_file(id: impl Into<String>, contract: SchemaContract, path: impl Into<PathBuf>) -> Result<Self, ElspethError> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| io_err(&format!("creating {}", path.display()), e))?;
        Ok(JsonLinesSink { id: id.into(), contract, writer: Writer::File(BufWriter::new(file)), rows_written: 0 })
    }
}

#[async_trait]
impl Operator for JsonLinesSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn input_schema(&self) -> &SchemaContract {
        &self.contract
    }

    fn set_output_contract(&mut self, contract: SchemaContract) {
        self.contract = contract;
    }

    async fn write(&mut self, rows: Vec<RowData>, _ctx: &RunContext) -> Result<ArtifactDescriptor, ElspethError> {
        let count = rows.len();
        for row in &rows {
            let line = serde_json::to_string(&row_to_json(row))
                .map_err(|e| io_err("serializing row to JSON", e))?;
            match &mut self.writer {
                Writer::Stdout => println!("{line}"),
                Writer::File(w) => writeln!(w, "{line}").map_err(|e| io_err("writing JSONL line", e))?,
            }
        }
        self.rows_written += count;
        debug!(sink = %self.id, rows_written_this_call = count, rows_written_total = self.rows_written, "wrote rows to JSON Lines sink");
        Ok(ArtifactDescriptor { sink_name: self.id.clone(), rows_written: count, details: None })
    }

    async fn flush(&mut self) -> Result<(), ElspethError> {
        match &mut self.writer {
            Writer::Stdout => io::stdout().flush().map_err(|e| io_err("flushing stdout", e)),
            Writer::File(w) => w.flush().map_err(|e| io_err("flushing JSONL file", e)),
        }
    }

    async fn close(&mut self) -> Result<(), ElspethError> {
        self.flush().await
    }
}
