//! Coalesce Executor: fork/join barriers. Buffers branch arrivals per
//! merge correlation key (the root token_id ancestor before the fork)
//! and emits a single merged token when the configured merge policy is
//! satisfied.
//!
//! State is owned exclusively by this executor — a
//! `HashMap<Uuid, CoalesceEntry>` keyed by correlation key, with no other
//! component reaching in to mutate it.

use std::collections::HashMap;

use elspeth_core::config::{CoalesceConfig, MergePolicy, OnIncomplete};
use elspeth_core::token::Token;
use elspeth_core::value::RowData;
use uuid::Uuid;

/// Why a coalesce key failed to reach quorum before its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceFailureReason {
    QuorumNotMet,
    IncompleteBranches,
}

/// Result of handing an arriving token to the executor.
#[derive(Debug, Clone)]
pub enum CoalesceArrival {
    /// This arrival satisfied the merge policy; here is the merged token.
    Emitted(Token),
    /// Absorbed: either still waiting on more branches, or a duplicate
    /// arrival for a branch already recorded.
    Absorbed { duplicate: bool },
    /// The key's timeout elapsed before the policy was satisfied.
    Failed(CoalesceFailureReason),
}

struct CoalesceEntry {
    root_row_id: String,
    arrivals: HashMap<String, Token>,
    /// Insertion order of branch names, so first-wins / branch-priority
    /// merges have a deterministic arrival order to fall back on.
    arrival_order: Vec<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    emitted: bool,
}

/// Per-coalesce-node state. One instance per coalesce node in the graph.
pub struct CoalesceExecutor {
    config: CoalesceConfig,
    /// The full set of branch labels expected to arrive, for
    /// `MergePolicy::AllBranches`. Derived from the graph at construction
    /// (every distinct inbound edge label).
    expected_branches: Vec<String>,
    entries: HashMap<Uuid, CoalesceEntry>,
}

impl CoalesceExecutor {
    pub fn new(config: CoalesceConfig, expected_branches: Vec<String>) -> Self {
        CoalesceExecutor { config, expected_branches, entries: HashMap::new() }
    }

    /// The root correlation key for a branch token: its `parent_token_id`
    /// if it's a direct fork child, else its own id (a token that never
    /// went through a fork arrives at coalesce as its own root).
    fn correlation_key(token: &Token) -> Uuid {
        token.parent_token_id.unwrap_or(token.token_id)
    }

    /// Hand an arriving branch token to the executor. `now` is injected so
    /// trigger evaluation is testable without wall-clock dependence (the
    /// caller passes `ctx.clock`).
    pub fn arrive(&mut self, token: Token, now: chrono::DateTime<chrono::Utc>) -> CoalesceArrival {
        let key = Self::correlation_key(&token);
        let branch = token.branch_name.clone().unwrap_or_else(|| "default".to_string());

        let entry = self.entries.entry(key).or_insert_with(|| CoalesceEntry {
            root_row_id: token.row_id.clone(),
            arrivals: HashMap::new(),
            arrival_order: Vec::new(),
            started_at: now,
            emitted: false,
        });

        if entry.emitted {
            // Extra arrivals after emission are absorbed without side
            // effects, beyond recording that this branch has now been
            // seen so the entry can be dropped once every branch has
            // either merged or arrived late.
            entry.arrivals.entry(branch).or_insert(token);
            if self.all_branches_accounted_for(key) {
                self.clear(key);
            }
            return CoalesceArrival::Absorbed { duplicate: true };
        }

        if entry.arrivals.contains_key(&branch) {
            // Same branch twice for the same key: absorbed, recorded by
            // the caller as a duplicate routing event.
            return CoalesceArrival::Absorbed { duplicate: true };
        }

        entry.arrivals.insert(branch.clone(), token);
        entry.arrival_order.push(branch);

        if self.policy_satisfied(key) {
            let merged = self.emit(key);
            // A policy like `first`/`quorum` can be satisfied before every
            // branch has shown up; only clear once the remaining branches
            // have also arrived (as late duplicates), so one of them
            // can't re-create the entry from scratch and re-satisfy the
            // policy a second time.
            if self.all_branches_accounted_for(key) {
                self.clear(key);
            }
            return CoalesceArrival::Emitted(merged);
        }

        CoalesceArrival::Absorbed { duplicate: false }
    }

    /// Whether every branch this node could ever see has now arrived at
    /// least once for `key`, pre- or post-emission — the point at which no
    /// future arrival could recreate a fresh entry for it. Nodes with no
    /// declared branch set (a single inbound edge) are never auto-cleared
    /// this way and rely on `check_timeouts` for stuck entries instead.
    fn all_branches_accounted_for(&self, key: Uuid) -> bool {
        !self.expected_branches.is_empty()
            && self
                .entries
                .get(&key)
                .map(|entry| self.expected_branches.iter().all(|b| entry.arrivals.contains_key(b)))
                .unwrap_or(false)
    }

    fn policy_satisfied(&self, key: Uuid) -> bool {
        let entry = &self.entries[&key];
        match &self.config.merge_policy {
            MergePolicy::AllBranches => {
                self.expected_branches.iter().all(|b| entry.arrivals.contains_key(b))
            }
            MergePolicy::Quorum { n } => entry.arrivals.len() >= *n,
            MergePolicy::First => true,
        }
    }

    /// Check every pending key against its configured timeout, emitting a
    /// failure for any that has expired without satisfying its policy.
    /// Called by the orchestrator alongside aggregation timeout checks.
    ///
    /// Returns, per expired key, the failure reason and a token built from
    /// whatever branches did arrive (via the same merge rule `emit` would
    /// have used), so the caller has row data to route or fail on.
    pub fn check_timeouts(&mut self, now: chrono::DateTime<chrono::Utc>) -> Vec<(Uuid, CoalesceFailureReason, Token)> {
        let Some(timeout) = self.config.timeout_seconds else { return Vec::new() };
        let mut expired = Vec::new();
        for (key, entry) in self.entries.iter() {
            if entry.emitted {
                continue;
            }
            let elapsed = (now - entry.started_at).num_seconds();
            if elapsed >= timeout as i64 {
                let reason = match &self.config.merge_policy {
                    MergePolicy::Quorum { n } if entry.arrivals.len() < *n => CoalesceFailureReason::QuorumNotMet,
                    MergePolicy::AllBranches => CoalesceFailureReason::IncompleteBranches,
                    _ => CoalesceFailureReason::IncompleteBranches,
                };
                let merged_row = self.merge_rows(entry);
                let partial = Token::coalesce_merged(*key, entry.root_row_id.clone(), merged_row);
                expired.push((*key, reason, partial));
            }
        }
        for (key, _, _) in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// The configured fallback for a key that timed out incomplete:
    /// `fail` or `route:<sink>`.
    pub fn on_incomplete(&self) -> &OnIncomplete {
        &self.config.on_incomplete
    }

    /// Merge every arrived token's row data for `key` and produce the
    /// merged token. Field conflicts are resolved per `config.rule`:
    /// first-arriving-wins, or (if `branch_priority` is set) later-listed
    /// branches in the priority list override earlier ones.
    fn emit(&mut self, key: Uuid) -> Token {
        self.entries.get_mut(&key).expect("key present").emitted = true;

        let entry = self.entries.get(&key).expect("key present");
        let merged_row = self.merge_rows(entry);
        let root_row_id = entry.root_row_id.clone();
        // No back-pointer needed beyond the correlation key itself.
        Token::coalesce_merged(key, root_row_id, merged_row)
    }

    fn merge_rows(&self, entry: &CoalesceEntry) -> RowData {
        let order: Vec<&String> = match &self.config.branch_priority {
            Some(priority) => priority.iter().filter(|b| entry.arrivals.contains_key(*b)).collect(),
            None => entry.arrival_order.iter().collect(),
        };

        let mut merged = RowData::new();
        for branch in order {
            if let Some(token) = entry.arrivals.get(branch) {
                for (field, value) in &token.row_data {
                    // First-wins by default; branch-priority overrides by
                    // walking the priority list so later entries replace
                    // earlier ones (later-listed branches win, per
                    // config docs).
                    if self.config.branch_priority.is_some() {
                        merged.insert(field.clone(), value.clone());
                    } else {
                        merged.entry(field.clone()).or_insert_with(|| value.clone());
                    }
                }
            }
        }
        merged
    }

    /// Drop any state for `key`, e.g. after the caller has routed a
    /// failure result downstream. A no-op if the key is unknown or
    /// already removed (e.g. by `check_timeouts`).
    pub fn clear(&mut self, key: Uuid) {
        self.entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_core::config::OnIncomplete;
    use elspeth_core::value::Value;

    fn config(policy: MergePolicy, timeout: Option<u64>) -> CoalesceConfig {
        CoalesceConfig {
            merge_policy: policy,
            timeout_seconds: timeout,
            on_incomplete: OnIncomplete::Fail,
            rule: elspeth_core::config::MergeRule::FirstWins,
            branch_priority: None,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> RowData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn all_branches_emits_only_once_every_branch_arrived() {
        let mut executor = CoalesceExecutor::new(
            config(MergePolicy::AllBranches, None),
            vec!["a".into(), "b".into()],
        );
        let root = Token::new_source_token("1", row(&[("text", Value::String("hello".into()))]));
        let branch_a = Token::fork_child(&root, "a", Some(row(&[("score_a", Value::Float(0.9))])));
        let branch_b = Token::fork_child(&root, "b", Some(row(&[("score_b", Value::Float(0.1))])));

        let now = chrono::Utc::now();
        let first = executor.arrive(branch_a, now);
        assert!(matches!(first, CoalesceArrival::Absorbed { duplicate: false }));

        let second = executor.arrive(branch_b, now);
        match second {
            CoalesceArrival::Emitted(token) => {
                assert_eq!(token.row_data.get("score_a"), Some(&Value::Float(0.9)));
                assert_eq!(token.row_data.get("score_b"), Some(&Value::Float(0.1)));
                assert_eq!(token.branch_name, None);
                assert_eq!(token.row_id, root.row_id);
            }
            other => panic!("expected Emitted, got {other:?}"),
        }
    }

    #[test]
    fn first_policy_emits_on_first_arrival_and_absorbs_rest() {
        let mut executor = CoalesceExecutor::new(config(MergePolicy::First, Some(0)), vec!["fast".into(), "slow".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let fast = Token::fork_child(&root, "fast", None);
        let slow = Token::fork_child(&root, "slow", None);

        let now = chrono::Utc::now();
        let first = executor.arrive(fast, now);
        assert!(matches!(first, CoalesceArrival::Emitted(_)));

        let second = executor.arrive(slow, now);
        assert!(matches!(second, CoalesceArrival::Absorbed { duplicate: true }));
    }

    #[test]
    fn quorum_emits_once_n_distinct_branches_arrive() {
        let mut executor = CoalesceExecutor::new(config(MergePolicy::Quorum { n: 2 }, None), vec!["a".into(), "b".into(), "c".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();
        assert!(matches!(executor.arrive(Token::fork_child(&root, "a", None), now), CoalesceArrival::Absorbed { .. }));
        assert!(matches!(executor.arrive(Token::fork_child(&root, "b", None), now), CoalesceArrival::Emitted(_)));
    }

    #[test]
    fn duplicate_branch_arrival_is_absorbed_without_state_change() {
        let mut executor = CoalesceExecutor::new(config(MergePolicy::AllBranches, None), vec!["a".into(), "b".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();
        executor.arrive(Token::fork_child(&root, "a", None), now);
        let dup = executor.arrive(Token::fork_child(&root, "a", None), now);
        assert!(matches!(dup, CoalesceArrival::Absorbed { duplicate: true }));
    }

    #[test]
    fn timeout_fails_incomplete_key_and_removes_it() {
        let mut executor = CoalesceExecutor::new(config(MergePolicy::AllBranches, Some(0)), vec!["a".into(), "b".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();
        executor.arrive(Token::fork_child(&root, "a", None), now);

        let later = now + chrono::Duration::seconds(1);
        let expired = executor.check_timeouts(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, CoalesceFailureReason::IncompleteBranches);
        assert_eq!(expired[0].2.row_id, root.row_id);

        // A subsequent arrival for the same key starts fresh.
        let arrival = executor.arrive(Token::fork_child(&root, "b", None), later);
        assert!(matches!(arrival, CoalesceArrival::Absorbed { duplicate: false }));
    }

    #[test]
    fn all_branches_entry_is_cleared_once_the_merge_emits() {
        let mut executor = CoalesceExecutor::new(config(MergePolicy::AllBranches, None), vec!["a".into(), "b".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();
        executor.arrive(Token::fork_child(&root, "a", None), now);
        executor.arrive(Token::fork_child(&root, "b", None), now);
        // Every branch arrived by the time the merge fired, so nothing is
        // left behind for this key to leak.
        assert_eq!(executor.entries.len(), 0);
    }

    #[test]
    fn first_policy_entry_survives_until_the_late_branch_arrives_then_clears() {
        let mut executor = CoalesceExecutor::new(config(MergePolicy::First, None), vec!["fast".into(), "slow".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();

        let first = executor.arrive(Token::fork_child(&root, "fast", None), now);
        assert!(matches!(first, CoalesceArrival::Emitted(_)));
        // `first` fired before every branch showed up — the entry must
        // stay around so the late `slow` arrival is recognized as a
        // duplicate rather than recreating the key from scratch.
        assert_eq!(executor.entries.len(), 1);

        let late = executor.arrive(Token::fork_child(&root, "slow", None), now);
        assert!(matches!(late, CoalesceArrival::Absorbed { duplicate: true }));
        assert_eq!(executor.entries.len(), 0, "every expected branch has now arrived, so the entry should be gone");
    }

    #[test]
    fn late_arrival_after_first_policy_emission_does_not_re_emit() {
        // A naive clear-on-emit would let this late arrival recreate the
        // entry from scratch and re-satisfy `First`, emitting a second
        // merged token for the same correlation key.
        let mut executor = CoalesceExecutor::new(config(MergePolicy::First, None), vec!["fast".into(), "slow".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();

        executor.arrive(Token::fork_child(&root, "fast", None), now);
        let late = executor.arrive(Token::fork_child(&root, "slow", None), now);
        assert!(!matches!(late, CoalesceArrival::Emitted(_)), "a late branch must never trigger a second emission for the same key");
    }

    #[test]
    fn branch_priority_overrides_first_wins_on_conflicting_fields() {
        let mut config = config(MergePolicy::AllBranches, None);
        config.branch_priority = Some(vec!["a".into(), "b".into()]);
        let mut executor = CoalesceExecutor::new(config, vec!["a".into(), "b".into()]);
        let root = Token::new_source_token("1", RowData::new());
        let now = chrono::Utc::now();
        executor.arrive(Token::fork_child(&root, "a", Some(row(&[("status", Value::String("a".into()))]))), now);
        let arrival = executor.arrive(Token::fork_child(&root, "b", Some(row(&[("status", Value::String("b".into()))]))), now);
        match arrival {
            CoalesceArrival::Emitted(token) => assert_eq!(token.row_data.get("status"), Some(&Value::String("b".into()))),
            other => panic!("expected Emitted, got {other:?}"),
        }
    }
}
