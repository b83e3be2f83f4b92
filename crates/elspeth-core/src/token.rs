//! Token model: immutable per-row identity and lineage.
//!
//! A `Token` is the unit of work that moves through a pipeline. It carries
//! the row data for one hop; transforms never mutate a token in place —
//! they produce a new one (see `Lineage`).

use uuid::Uuid;

use crate::value::RowData;

/// How a token came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lineage {
    Normal,
    ForkChild,
    AggregationOutput,
    CoalesceMerged,
    DeaggregationChild,
}

/// A row-scoped identity carrying data and lineage through the pipeline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub token_id: Uuid,
    pub row_id: String,
    pub row_data: RowData,
    pub branch_name: Option<String>,
    pub parent_token_id: Option<Uuid>,
    pub lineage: Lineage,
}

impl Token {
    /// Create the token for a freshly loaded source row.
    pub fn new_source_token(row_id: impl Into<String>, row_data: RowData) -> Self {
        Token {
            token_id: Uuid::new_v4(),
            row_id: row_id.into(),
            row_data,
            branch_name: None,
            parent_token_id: None,
            lineage: Lineage::Normal,
        }
    }

    /// Spawn a fork child. If `row_data` is omitted the child shares the
    /// parent's row data (the branch only differs by `branch_name` until a
    /// downstream transform on that branch produces new data).
    pub fn fork_child(parent: &Token, branch_name: impl Into<String>, row_data: Option<RowData>) -> Self {
        Token {
            token_id: Uuid::new_v4(),
            row_id: parent.row_id.clone(),
            row_data: row_data.unwrap_or_else(|| parent.row_data.clone()),
            branch_name: Some(branch_name.into()),
            parent_token_id: Some(parent.token_id),
            lineage: Lineage::ForkChild,
        }
    }

    /// Build the output token for a flushed aggregation batch.
    ///
    /// `row_id` is the batch id; for `transform`/`passthrough` output
    /// modes the executor instead
    /// calls `new_source_token`-style construction per buffered token, so
    /// this constructor is used only for `single`-mode batch outputs.
    pub fn aggregation_output(batch_id: impl Into<String>, row_data: RowData) -> Self {
        Token {
            token_id: Uuid::new_v4(),
            row_id: batch_id.into(),
            row_data,
            branch_name: None,
            parent_token_id: None,
            lineage: Lineage::AggregationOutput,
        }
    }

    /// Build a deaggregation (expansion) child, preserving the parent's
    /// `row_id` unless the caller explicitly reassigns it.
    pub fn deaggregation_child(parent: &Token, row_data: RowData, row_id: Option<String>) -> Self {
        Token {
            token_id: Uuid::new_v4(),
            row_id: row_id.unwrap_or_else(|| parent.row_id.clone()),
            row_data,
            branch_name: parent.branch_name.clone(),
            parent_token_id: Some(parent.token_id),
            lineage: Lineage::DeaggregationChild,
        }
    }

    /// Build the merged token produced by a coalesce barrier.
    pub fn coalesce_merged(root_token_id: Uuid, root_row_id: impl Into<String>, row_data: RowData) -> Self {
        Token {
            token_id: Uuid::new_v4(),
            row_id: root_row_id.into(),
            row_data,
            branch_name: None,
            parent_token_id: Some(root_token_id),
            lineage: Lineage::CoalesceMerged,
        }
    }
}
