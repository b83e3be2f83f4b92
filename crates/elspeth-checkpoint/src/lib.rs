//! # Elspeth Checkpoint
//!
//! Periodic persistence of processed-token offsets and aggregation
//! state, so a crashed or interrupted run can resume by replaying only
//! its unprocessed tail.

pub mod manager;
pub mod state;

pub use manager::{CheckpointManager, SqliteCheckpointManager};
pub use state::{Checkpoint, Counters};
