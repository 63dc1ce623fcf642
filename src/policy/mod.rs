//! Epsilon-greedy tool selection with accuracy tracking and quarantine.
//!
//! Each prediction tool carries an accuracy record; selection explores
//! with probability epsilon and otherwise exploits the highest weighted
//! accuracy. Tools that fail repeatedly are quarantined for a while.
//! Selection is deterministic given the quorum-agreed randomness, so all
//! replicas pick the same tool.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::types::ConcordError;

// ---------------------------------------------------------------------------
// Per-tool records
// ---------------------------------------------------------------------------

/// The accuracy information of a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyInfo {
    /// Responses this tool has produced.
    pub requests: u64,
    /// Valid responses awaiting market resolution.
    pub pending: i64,
    /// Running average of resolved predictions that won, in [0, 1].
    pub accuracy: f64,
    /// Resolutions folded into the running average.
    #[serde(default)]
    pub resolutions: u64,
}

/// Consecutive-failure bookkeeping driving quarantine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsecutiveFailures {
    pub n_failures: u32,
    /// When the counter last moved (quarantine entry time once the
    /// threshold is reached).
    pub timestamp: i64,
}

impl ConsecutiveFailures {
    fn advance(&mut self, now: i64) {
        self.n_failures += 1;
        self.timestamp = now;
    }

    fn reset(&mut self, now: i64) {
        self.n_failures = 0;
        self.timestamp = now;
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// An epsilon-greedy policy for tool selection based on tool accuracy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EGreedyPolicy {
    pub eps: f64,
    pub consecutive_failures_threshold: u32,
    pub quarantine_duration_secs: i64,
    pub accuracy_store: BTreeMap<String, AccuracyInfo>,
    pub consecutive_failures: BTreeMap<String, ConsecutiveFailures>,
    pub weighted_accuracy: BTreeMap<String, f64>,
    /// When this policy last recorded a response.
    pub updated_at: i64,
}

impl EGreedyPolicy {
    /// Build a zero-initialized policy over the given tools.
    pub fn new(
        eps: f64,
        consecutive_failures_threshold: u32,
        quarantine_duration_secs: i64,
        tools: &[String],
    ) -> Result<Self, ConcordError> {
        if !(0.0..=1.0).contains(&eps) {
            return Err(ConcordError::Policy(format!(
                "cannot initialize the policy with an epsilon of {eps}; must be in [0, 1]"
            )));
        }
        let mut policy = Self {
            eps,
            consecutive_failures_threshold,
            quarantine_duration_secs,
            accuracy_store: tools
                .iter()
                .map(|tool| (tool.clone(), AccuracyInfo::default()))
                .collect(),
            consecutive_failures: tools
                .iter()
                .map(|tool| (tool.clone(), ConsecutiveFailures::default()))
                .collect(),
            weighted_accuracy: BTreeMap::new(),
            updated_at: 0,
        };
        policy.update_weighted_accuracy();
        Ok(policy)
    }

    pub fn serialize(&self) -> Result<String, ConcordError> {
        serde_json::to_string(self)
            .map_err(|e| ConcordError::Policy(format!("failed to serialize policy: {e}")))
    }

    pub fn deserialize(raw: &str) -> Result<Self, ConcordError> {
        serde_json::from_str(raw)
            .map_err(|e| ConcordError::Policy(format!("failed to parse policy: {e}")))
    }

    pub fn tools(&self) -> Vec<&str> {
        self.accuracy_store.keys().map(|s| s.as_str()).collect()
    }

    pub fn n_requests(&self) -> u64 {
        self.accuracy_store.values().map(|info| info.requests).sum()
    }

    /// Whether the policy has ever been updated since its genesis.
    pub fn has_updated(&self) -> bool {
        self.n_requests() > 0
    }

    /// Recompute the per-tool weighted accuracy.
    pub fn update_weighted_accuracy(&mut self) {
        let total = self.n_requests() as f64;
        self.weighted_accuracy = self
            .accuracy_store
            .iter()
            .map(|(tool, info)| {
                let weighted = if total == 0.0 {
                    0.0
                } else {
                    info.accuracy * (info.requests as f64 - info.pending as f64) / total
                };
                (tool.clone(), weighted)
            })
            .collect();
    }

    // -- Quarantine ------------------------------------------------------

    /// Whether a tool is currently excluded from selection.
    pub fn is_quarantined(&self, tool: &str, now: i64) -> bool {
        match self.consecutive_failures.get(tool) {
            Some(failures) => {
                failures.n_failures >= self.consecutive_failures_threshold
                    && now - failures.timestamp < self.quarantine_duration_secs
            }
            None => false,
        }
    }

    /// Tools eligible for selection, in stable (sorted) name order.
    pub fn available_tools(&self, now: i64) -> Vec<&str> {
        self.accuracy_store
            .keys()
            .filter(|tool| !self.is_quarantined(tool, now))
            .map(|s| s.as_str())
            .collect()
    }

    // -- Selection -------------------------------------------------------

    /// Select a tool deterministically from the agreed randomness.
    ///
    /// With probability `eps` (or before the first update ever) this
    /// explores uniformly among non-quarantined tools; otherwise it picks
    /// the non-quarantined tool with the highest weighted accuracy, ties
    /// broken by name order. Zero available tools is a hard failure.
    pub fn select_tool(&self, randomness: &str, now: i64) -> Result<String, ConcordError> {
        let available = self.available_tools(now);
        if available.is_empty() {
            return Err(ConcordError::NoToolAvailable);
        }

        let (draw, index_seed) = derive_draw(randomness);
        debug!(draw, eps = self.eps, "Tool selection draw");

        if !self.has_updated() || draw < self.eps {
            let tool = available[index_seed % available.len()];
            info!(tool, "Exploring a tool");
            return Ok(tool.to_string());
        }

        let best = available
            .iter()
            .max_by(|a, b| {
                let wa = self.weighted_accuracy.get(**a).copied().unwrap_or(0.0);
                let wb = self.weighted_accuracy.get(**b).copied().unwrap_or(0.0);
                // strictly-greater keeps the first name on ties, and the
                // candidate list is already name-sorted
                wa.total_cmp(&wb).then(std::cmp::Ordering::Greater)
            })
            .copied()
            .unwrap_or(available[0]);
        info!(tool = best, "Exploiting the best tool");
        Ok(best.to_string())
    }

    // -- Updates ---------------------------------------------------------

    /// Record a tool's response. Invalid responses advance the
    /// consecutive-failure counter and never touch accuracy; valid ones
    /// reset it and enter the pending (awaiting-resolution) set.
    pub fn record_response(&mut self, tool: &str, timestamp: i64, was_invalid: bool) {
        let Some(info) = self.accuracy_store.get_mut(tool) else {
            return;
        };
        info.requests += 1;
        let failures = self.consecutive_failures.entry(tool.to_string()).or_default();
        if was_invalid {
            failures.advance(timestamp);
            if failures.n_failures >= self.consecutive_failures_threshold {
                info!(
                    tool,
                    failures = failures.n_failures,
                    "Tool entered quarantine"
                );
            }
        } else {
            info.pending += 1;
            failures.reset(timestamp);
        }
        self.updated_at = timestamp;
        self.update_weighted_accuracy();
    }

    /// Fold a settled prediction into the tool's running accuracy.
    pub fn record_resolution(&mut self, tool: &str, won: bool) {
        let Some(info) = self.accuracy_store.get_mut(tool) else {
            return;
        };
        info.pending -= 1;
        info.resolutions += 1;
        let n = info.resolutions as f64;
        info.accuracy += ((won as u8 as f64) - info.accuracy) / n;
        self.update_weighted_accuracy();
    }

    /// Import remote accuracy data, on the first-ever run only. A tool's
    /// record is overwritten when the remote policy is newer than the
    /// local one minus `offset_secs`; tools without remote data keep
    /// their local record.
    pub fn merge_remote(&mut self, remote: &EGreedyPolicy, offset_secs: i64) {
        if self.has_updated() {
            debug!("Policy already updated locally; skipping remote merge");
            return;
        }
        if remote.updated_at <= self.updated_at - offset_secs {
            debug!(
                remote_ts = remote.updated_at,
                local_ts = self.updated_at,
                "Remote accuracy data too old; skipping remote merge"
            );
            return;
        }
        let mut imported = 0usize;
        for (tool, info) in &remote.accuracy_store {
            if let Some(local) = self.accuracy_store.get_mut(tool) {
                *local = info.clone();
                imported += 1;
            }
        }
        self.updated_at = remote.updated_at;
        self.update_weighted_accuracy();
        info!(imported, "Imported remote accuracy data");
    }
}

impl fmt::Display for EGreedyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "eps={} tools={} requests={}",
            self.eps,
            self.accuracy_store.len(),
            self.n_requests(),
        )
    }
}

/// Derive a unit-interval draw and an exploration index from the agreed
/// randomness string.
fn derive_draw(randomness: &str) -> (f64, usize) {
    let digest = Sha256::digest(randomness.as_bytes());
    let draw_bits = u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
    let index_bits = u64::from_be_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
    // top 53 bits give a uniform float in [0, 1)
    let draw = (draw_bits >> 11) as f64 / (1u64 << 53) as f64;
    (draw, index_bits as usize)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn tools() -> Vec<String> {
        vec!["tool-a".to_string(), "tool-b".to_string()]
    }

    fn policy(eps: f64) -> EGreedyPolicy {
        EGreedyPolicy::new(eps, 3, 10_800, &tools()).unwrap()
    }

    fn with_accuracy(mut policy: EGreedyPolicy, tool: &str, accuracy: f64) -> EGreedyPolicy {
        let info = policy.accuracy_store.get_mut(tool).unwrap();
        info.requests = 100;
        info.accuracy = accuracy;
        policy.update_weighted_accuracy();
        policy
    }

    // -- Construction tests --

    #[test]
    fn test_new_rejects_bad_epsilon() {
        assert!(EGreedyPolicy::new(1.5, 3, 10, &tools()).is_err());
        assert!(EGreedyPolicy::new(-0.1, 3, 10, &tools()).is_err());
    }

    #[test]
    fn test_new_zero_initialized() {
        let policy = policy(0.1);
        assert_eq!(policy.n_requests(), 0);
        assert!(!policy.has_updated());
        assert_eq!(policy.tools(), vec!["tool-a", "tool-b"]);
    }

    // -- Selection tests --

    #[test]
    fn test_selection_deterministic() {
        let policy = with_accuracy(policy(0.1), "tool-a", 0.9);
        let first = policy.select_tool("beacon-1", NOW).unwrap();
        for _ in 0..5 {
            assert_eq!(policy.select_tool("beacon-1", NOW).unwrap(), first);
        }
    }

    #[test]
    fn test_zero_epsilon_exploits_best() {
        let policy = with_accuracy(policy(0.0), "tool-b", 0.9);
        // tool-b carries all the accuracy; any draw must pick it
        for beacon in ["a", "b", "c", "d"] {
            assert_eq!(policy.select_tool(beacon, NOW).unwrap(), "tool-b");
        }
    }

    #[test]
    fn test_quarantined_best_tool_never_selected() {
        // tool-a at 0.9 live, tool-b at 0.95 but quarantined → always A
        let mut policy = with_accuracy(policy(0.0), "tool-a", 0.9);
        policy = with_accuracy(policy, "tool-b", 0.95);
        policy.consecutive_failures.insert(
            "tool-b".to_string(),
            ConsecutiveFailures {
                n_failures: 3,
                timestamp: NOW,
            },
        );

        assert!(policy.is_quarantined("tool-b", NOW));
        for beacon in ["a", "b", "c", "d", "e"] {
            assert_eq!(policy.select_tool(beacon, NOW).unwrap(), "tool-a");
        }
    }

    #[test]
    fn test_quarantine_expires() {
        let mut policy = policy(0.0);
        policy.consecutive_failures.insert(
            "tool-b".to_string(),
            ConsecutiveFailures {
                n_failures: 3,
                timestamp: NOW,
            },
        );
        assert!(policy.is_quarantined("tool-b", NOW + 10_799));
        assert!(!policy.is_quarantined("tool-b", NOW + 10_800));
    }

    #[test]
    fn test_no_available_tool_is_hard_failure() {
        let mut policy = policy(0.0);
        for tool in ["tool-a", "tool-b"] {
            policy.consecutive_failures.insert(
                tool.to_string(),
                ConsecutiveFailures {
                    n_failures: 3,
                    timestamp: NOW,
                },
            );
        }
        let err = policy.select_tool("beacon", NOW).unwrap_err();
        assert!(matches!(err, ConcordError::NoToolAvailable));
    }

    #[test]
    fn test_fresh_policy_explores() {
        // has_updated is false — selection explores uniformly even with
        // eps = 0, and stays deterministic per beacon
        let policy = policy(0.0);
        let selected = policy.select_tool("beacon-7", NOW).unwrap();
        assert!(["tool-a", "tool-b"].contains(&selected.as_str()));
        assert_eq!(policy.select_tool("beacon-7", NOW).unwrap(), selected);
    }

    #[test]
    fn test_tie_breaks_by_name_order() {
        let mut policy = with_accuracy(policy(0.0), "tool-a", 0.5);
        policy = with_accuracy(policy, "tool-b", 0.5);
        assert_eq!(policy.select_tool("any", NOW).unwrap(), "tool-a");
    }

    // -- Update tests --

    #[test]
    fn test_record_response_counts_and_failures() {
        let mut policy = policy(0.1);
        policy.record_response("tool-a", NOW, true);
        policy.record_response("tool-a", NOW + 1, true);
        policy.record_response("tool-a", NOW + 2, true);

        let info = &policy.accuracy_store["tool-a"];
        assert_eq!(info.requests, 3);
        assert_eq!(info.pending, 0);
        assert!(policy.is_quarantined("tool-a", NOW + 3));

        // a valid response resets the streak
        policy.record_response("tool-b", NOW + 3, false);
        assert_eq!(policy.accuracy_store["tool-b"].pending, 1);
        assert_eq!(policy.consecutive_failures["tool-b"].n_failures, 0);
    }

    #[test]
    fn test_invalid_response_never_moves_accuracy() {
        let mut policy = policy(0.1);
        policy.record_response("tool-a", NOW, false);
        policy.record_resolution("tool-a", true);
        let before = policy.accuracy_store["tool-a"].accuracy;

        policy.record_response("tool-a", NOW + 1, true);
        assert!((policy.accuracy_store["tool-a"].accuracy - before).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolution_running_average() {
        let mut policy = policy(0.1);
        for _ in 0..4 {
            policy.record_response("tool-a", NOW, false);
        }
        policy.record_resolution("tool-a", true);
        policy.record_resolution("tool-a", true);
        policy.record_resolution("tool-a", false);
        policy.record_resolution("tool-a", true);

        let info = &policy.accuracy_store["tool-a"];
        assert_eq!(info.pending, 0);
        assert!((info.accuracy - 0.75).abs() < 1e-10);
    }

    #[test]
    fn test_weighted_accuracy_formula() {
        let mut policy = policy(0.1);
        {
            let a = policy.accuracy_store.get_mut("tool-a").unwrap();
            a.requests = 60;
            a.pending = 10;
            a.accuracy = 0.8;
        }
        {
            let b = policy.accuracy_store.get_mut("tool-b").unwrap();
            b.requests = 40;
            b.pending = 0;
            b.accuracy = 0.9;
        }
        policy.update_weighted_accuracy();

        // total = 100; a: 0.8 * 50 / 100 = 0.40; b: 0.9 * 40 / 100 = 0.36
        assert!((policy.weighted_accuracy["tool-a"] - 0.40).abs() < 1e-10);
        assert!((policy.weighted_accuracy["tool-b"] - 0.36).abs() < 1e-10);
    }

    // -- Remote merge tests --

    #[test]
    fn test_merge_remote_first_run_only() {
        let mut local = policy(0.1);
        let mut remote = policy(0.1);
        remote.accuracy_store.get_mut("tool-a").unwrap().accuracy = 0.77;
        remote.accuracy_store.get_mut("tool-a").unwrap().requests = 10;
        remote.updated_at = NOW;

        local.merge_remote(&remote, 300);
        assert!((local.accuracy_store["tool-a"].accuracy - 0.77).abs() < 1e-10);

        // once the local policy has updated, remote data is ignored
        let mut updated = policy(0.1);
        updated.record_response("tool-a", NOW, false);
        updated.merge_remote(&remote, 300);
        assert!((updated.accuracy_store["tool-a"].accuracy - 0.0).abs() < 1e-10);
    }

    #[test]
    fn test_merge_remote_stale_data_skipped() {
        let mut local = policy(0.1);
        local.updated_at = NOW;
        let mut remote = policy(0.1);
        remote.accuracy_store.get_mut("tool-a").unwrap().accuracy = 0.77;
        remote.updated_at = NOW - 1_000;

        local.merge_remote(&remote, 300);
        assert!((local.accuracy_store["tool-a"].accuracy - 0.0).abs() < 1e-10);
    }

    #[test]
    fn test_merge_remote_keeps_unknown_tools_local() {
        let mut local = policy(0.1);
        let mut remote =
            EGreedyPolicy::new(0.1, 3, 10_800, &["tool-a".to_string()]).unwrap();
        remote.accuracy_store.get_mut("tool-a").unwrap().accuracy = 0.5;
        remote.updated_at = NOW;

        local.merge_remote(&remote, 300);
        // tool-b had no remote record and keeps its zero-initialized one
        assert_eq!(local.accuracy_store["tool-b"], AccuracyInfo::default());
    }

    // -- Serialization tests --

    #[test]
    fn test_policy_serialization_roundtrip() {
        let mut policy = with_accuracy(policy(0.25), "tool-a", 0.6);
        policy.record_response("tool-b", NOW, true);
        let raw = policy.serialize().unwrap();
        let parsed = EGreedyPolicy::deserialize(&raw).unwrap();
        assert_eq!(parsed.accuracy_store, policy.accuracy_store);
        assert_eq!(parsed.consecutive_failures, policy.consecutive_failures);
        assert!((parsed.eps - 0.25).abs() < 1e-10);
    }
}
