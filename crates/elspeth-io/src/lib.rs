//! # Elspeth I/O
//!
//! Reference `Source`/`Sink` implementations satisfying the
//! `elspeth-core::traits` contracts: an in-memory pair for tests and
//! small pipelines, a CSV file source, and a JSON Lines sink. These are
//! not the only plugins a real deployment would run — they exist so the
//! engine is exercisable end to end without a proprietary connector.

pub mod memory;
pub mod sink_jsonl;
pub mod source_csv;

pub use memory::{InMemorySink, InMemorySource};
pub use sink_jsonl::JsonLinesSink;
pub use source_csv::CsvSource;
