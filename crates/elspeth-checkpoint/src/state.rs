//! Checkpoint content: committed token ids per sink, last source offset,
//! per-aggregation node state (serialized), and run counters. Serialized
//! with the same canonical encoding used for audit fingerprints so that
//! restore is exact.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run-wide progress counters, mirrored in the checkpoint so resume can
/// continue reporting accurate totals instead of restarting from zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counters {
    pub rows_loaded: u64,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub rows_quarantined: u64,
    pub rows_discarded: u64,
}

/// A point-in-time snapshot of run progress. Checkpoints are append-only;
/// the latest one for a run wins on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    /// Canonical hash of the source's normalized field set + types,
    /// recorded at first run. Resume fails fast if the current source's
    /// fingerprint does not match.
    pub source_schema_fingerprint: String,
    pub last_source_offset: u64,
    /// Last committed token per consumer (sink) path, keyed by sink name.
    pub committed_token_ids: HashMap<String, Uuid>,
    /// Serialized aggregation buffer state per aggregation node id.
    pub aggregation_state: HashMap<String, serde_json::Value>,
    pub counters: Counters,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: Uuid, source_schema_fingerprint: impl Into<String>, written_at: DateTime<Utc>) -> Self {
        Checkpoint {
            run_id,
            source_schema_fingerprint: source_schema_fingerprint.into(),
            last_source_offset: 0,
            committed_token_ids: HashMap::new(),
            aggregation_state: HashMap::new(),
            counters: Counters::default(),
            written_at,
        }
    }

    /// Pre-existing checkpoints from before the current source schema are
    /// incompatible and must fail with a clear error.
    pub fn verify_schema_fingerprint(&self, current_fingerprint: &str) -> Result<(), ElspethError> {
        if self.source_schema_fingerprint != current_fingerprint {
            return Err(ElspethError::Invariant(ErrorReason::new(
                ErrorKind::InvariantViolation,
                format!(
                    "checkpoint schema fingerprint {} does not match current source fingerprint {}",
                    self.source_schema_fingerprint, current_fingerprint
                ),
                false,
            )));
        }
        Ok(())
    }
}
