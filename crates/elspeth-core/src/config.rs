//! Configuration surface: the ambient knobs that control checkpointing
//! cadence, retry/backoff, rate limiting, aggregation triggers, coalesce
//! policy, audit export, and secret resolution.
//!
//! Loaded straight from YAML via `serde_yaml::from_str`, but kept
//! independent of any particular graph shape so `elspeth-graph` can embed
//! it per-node.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_rows")]
    pub every_n_rows: u64,
    #[serde(default = "default_checkpoint_seconds")]
    pub every_n_seconds: u64,
}

fn default_checkpoint_rows() -> u64 {
    1000
}
fn default_checkpoint_seconds() -> u64 {
    30
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig { every_n_rows: default_checkpoint_rows(), every_n_seconds: default_checkpoint_seconds() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub rate: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, RateLimitBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationOutputMode {
    Single,
    Transform,
    Passthrough,
}

/// Trigger expression tree: composite triggers are an explicit And/Or of
/// leaf triggers, evaluated short-circuit left to right.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerExpr {
    Count { threshold: usize },
    Timeout { seconds: u64 },
    EndOfSource,
    And { of: Vec<TriggerExpr> },
    Or { of: Vec<TriggerExpr> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub trigger: TriggerExpr,
    pub output_mode: AggregationOutputMode,
    /// Idle window before a `quiet_seconds`-only trigger is considered
    /// satisfied independent of a timeout leaf (reserved for future
    /// trigger kinds; currently unused by `Timeout`/`Count`/`EndOfSource`).
    #[serde(default)]
    pub quiet_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    FirstWins,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergePolicy {
    AllBranches,
    Quorum { n: usize },
    First,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnIncomplete {
    Fail,
    Route { sink: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceConfig {
    pub merge_policy: MergePolicy,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub on_incomplete: OnIncomplete,
    /// Per-field merge rule beyond first-wins. `branch_priority`, when
    /// set, overrides `rule` for fields present on more than one arriving
    /// branch: later-listed branches win.
    #[serde(default = "default_merge_rule")]
    pub rule: MergeRule,
    #[serde(default)]
    pub branch_priority: Option<Vec<String>>,
}

fn default_merge_rule() -> MergeRule {
    MergeRule::FirstWins
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub sink: String,
    pub format: ExportFormat,
    #[serde(default)]
    pub sign: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    Env,
    Keyvault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    pub source: SecretSource,
    #[serde(default)]
    pub vault_url: Option<String>,
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

/// Top-level run configuration: the ambient knobs, independent of the
/// graph topology itself (sources/transforms/sinks live in
/// `elspeth-graph`'s `GraphSpec`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub export: Option<ExportConfig>,
    #[serde(default)]
    pub secrets: Option<SecretsConfig>,
    /// Rows buffered per sink before the orchestrator issues a `Sink::write`
    /// call. Independent of checkpoint cadence: a sink can flush several
    /// times between two checkpoints.
    #[serde(default = "default_sink_batch_size")]
    pub sink_batch_size: usize,
}

fn default_sink_batch_size() -> usize {
    500
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            checkpoint: CheckpointConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            export: None,
            secrets: None,
            sink_batch_size: default_sink_batch_size(),
        }
    }
}

impl RunConfig {
    /// Canonical-hash fingerprint of this configuration, used to detect
    /// drift on resume and as the run's `config_fingerprint` audit field.
    pub fn config_fingerprint(&self) -> String {
        canonical_json(self).expect("RunConfig always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_fingerprint_is_stable_across_calls() {
        let config = RunConfig::default();
        assert_eq!(config.config_fingerprint(), config.config_fingerprint());
    }

    #[test]
    fn config_fingerprint_differs_for_different_configs() {
        let mut a = RunConfig::default();
        let mut b = RunConfig::default();
        a.checkpoint.every_n_rows = 10;
        b.checkpoint.every_n_rows = 20;
        assert_ne!(a.config_fingerprint(), b.config_fingerprint());
    }

    #[test]
    fn trigger_expr_deserializes_composite() {
        let yaml = "kind: or\nof:\n  - kind: count\n    threshold: 5\n  - kind: end_of_source\n";
        let expr: TriggerExpr = serde_yaml::from_str(yaml).unwrap();
        match expr {
            TriggerExpr::Or { of } => assert_eq!(of.len(), 2),
            _ => panic!("expected Or"),
        }
    }
}
