//! The round engine — the substrate every consensus round compiles to.
//!
//! A round collects one payload per participating replica, waits until
//! the same payload value has been submitted by at least a quorum of
//! replicas, and then deterministically maps the agreed value to a new
//! [`SynchronizedData`] and exactly one [`Event`]. Following the design
//! of the cross-replica agree-on-a-value pattern, a round is an explicit
//! state object plus a quorum-counting map — not a class hierarchy.

pub mod fsm;
pub mod sync_data;

pub use sync_data::SynchronizedData;

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use tracing::{debug, warn};

use crate::types::{ConcordError, ReplicaId};

/// Bound for types usable as round identifiers in the engine.
pub trait RoundId: Copy + Eq + Hash + fmt::Debug + fmt::Display {}
impl<T: Copy + Eq + Hash + fmt::Debug + fmt::Display> RoundId for T {}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events a round evaluation can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Done,
    /// Quorum reached on an explicitly-null value.
    None,
    /// Attempts exhausted without quorum.
    NoMajority,
    /// Wall-clock deadline exceeded while waiting.
    RoundTimeout,
    /// The market fetch failed for the whole cycle.
    FetchError,
    BenchmarkingEnabled,
    BenchmarkingDisabled,
    /// The benchmark dataset is exhausted.
    BenchmarkingFinished,
    /// The prediction tool responded with an error or garbage.
    MechResponseError,
    /// The prediction tied; there is nothing to vote for.
    Tie,
    /// The prospective bet does not cover the profit threshold.
    Unprofitable,
    /// The sampled position should be sold instead of extended.
    Sell,
    CalcBuyAmountFailed,
    CalcSellAmountFailed,
    InsufficientBalance,
    /// The failed transaction should blacklist the sampled bet.
    Blacklist,
    /// The failed transaction needs no compensating action.
    NoOp,
    /// Nothing to redeem this cycle.
    NoRedeeming,
    /// The redeem round has its own, longer deadline.
    RedeemRoundTimeout,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Done => "done",
            Event::None => "none",
            Event::NoMajority => "no_majority",
            Event::RoundTimeout => "round_timeout",
            Event::FetchError => "fetch_error",
            Event::BenchmarkingEnabled => "benchmarking_enabled",
            Event::BenchmarkingDisabled => "benchmarking_disabled",
            Event::BenchmarkingFinished => "benchmarking_finished",
            Event::MechResponseError => "mech_response_error",
            Event::Tie => "tie",
            Event::Unprofitable => "unprofitable",
            Event::Sell => "sell",
            Event::CalcBuyAmountFailed => "calc_buy_amount_failed",
            Event::CalcSellAmountFailed => "calc_sell_amount_failed",
            Event::InsufficientBalance => "insufficient_balance",
            Event::Blacklist => "blacklist",
            Event::NoOp => "no_op",
            Event::NoRedeeming => "no_redeeming",
            Event::RedeemRoundTimeout => "redeem_round_timeout",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// The values a replica submits for a round, keyed by payload field.
/// A `BTreeMap` keeps the serialized form canonical, so payload equality
/// across replicas is well-defined.
pub type PayloadValues = BTreeMap<String, Value>;

/// Canonical serialized form used for quorum counting.
fn canonical(payload: &PayloadValues) -> String {
    serde_json::to_string(payload).unwrap_or_default()
}

/// Whether every field of the payload is explicitly null.
fn is_null_payload(payload: &PayloadValues) -> bool {
    !payload.is_empty() && payload.values().all(|value| value.is_null())
}

// ---------------------------------------------------------------------------
// Round specification and state
// ---------------------------------------------------------------------------

/// Optional hook re-routing a `done` outcome based on side conditions of
/// the agreed payload (e.g. a transaction round whose agreed hash is
/// empty re-emits a calculation-failed event).
pub type PostProcess = fn(&PayloadValues) -> Option<Event>;

/// The static description of a round type.
#[derive(Debug, Clone)]
pub struct RoundSpec<R> {
    pub id: R,
    /// Payload fields every replica is expected to submit.
    pub payload_keys: &'static [&'static str],
    /// Agreed sub-fields merged into the synchronized data on `done`.
    pub selection_keys: &'static [&'static str],
    /// Event emitted on quorum over an explicitly-null value.
    pub none_event: Option<Event>,
    /// Event emitted when quorum has become impossible.
    pub no_majority_event: Option<Event>,
    /// Event emitted when the round deadline passes.
    pub timeout_event: Event,
    /// Round deadline in seconds.
    pub timeout_secs: i64,
    pub post_process: Option<PostProcess>,
    /// Events the post-processing hook may re-route `done` to.
    pub extra_events: &'static [Event],
}

impl<R: RoundId> RoundSpec<R> {
    /// The events this round can emit (used for FSM totality checks).
    pub fn emittable_events(&self) -> Vec<Event> {
        let mut events = vec![Event::Done, self.timeout_event];
        if let Some(event) = self.none_event {
            events.push(event);
        }
        if let Some(event) = self.no_majority_event {
            events.push(event);
        }
        events.extend_from_slice(self.extra_events);
        events
    }
}

/// Outcome of one round evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// Quorum not yet reached; re-evaluate on the next tick.
    Waiting,
    Decided {
        data: SynchronizedData,
        event: Event,
    },
}

/// A live round: its spec plus the collected per-replica payloads.
#[derive(Debug, Clone)]
pub struct RoundState<R> {
    pub spec: RoundSpec<R>,
    collection: BTreeMap<ReplicaId, PayloadValues>,
    replica_count: usize,
    quorum: usize,
    /// Unix deadline for this round.
    deadline: i64,
}

impl<R: RoundId> RoundState<R> {
    pub fn new(spec: RoundSpec<R>, replica_count: usize, quorum: usize, now: i64) -> Self {
        let deadline = now + spec.timeout_secs;
        Self {
            spec,
            collection: BTreeMap::new(),
            replica_count,
            quorum,
            deadline,
        }
    }

    pub fn collected(&self) -> usize {
        self.collection.len()
    }

    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    /// Record a replica's payload for this round.
    ///
    /// Re-submitting an identical payload is idempotent; a conflicting
    /// re-submission is rejected (a replica votes once per round).
    pub fn submit(
        &mut self,
        replica: &ReplicaId,
        payload: PayloadValues,
    ) -> Result<(), ConcordError> {
        let submitted: Vec<&str> = payload.keys().map(|k| k.as_str()).collect();
        let mut expected = self.spec.payload_keys.to_vec();
        expected.sort_unstable();
        if submitted != expected {
            return Err(ConcordError::Consensus {
                round: self.spec.id.to_string(),
                message: format!(
                    "payload keys {submitted:?} do not match the round's {expected:?}"
                ),
            });
        }
        if let Some(existing) = self.collection.get(replica) {
            if canonical(existing) != canonical(&payload) {
                return Err(ConcordError::Consensus {
                    round: self.spec.id.to_string(),
                    message: format!("replica {replica} already submitted a different payload"),
                });
            }
            return Ok(());
        }
        self.collection.insert(replica.clone(), payload);
        Ok(())
    }

    /// Evaluate the round against the collected payloads.
    pub fn process(&self, data: &SynchronizedData) -> RoundOutcome {
        // count identical payload values
        let mut counts: BTreeMap<String, (usize, &PayloadValues)> = BTreeMap::new();
        for payload in self.collection.values() {
            let entry = counts.entry(canonical(payload)).or_insert((0, payload));
            entry.0 += 1;
        }

        let agreed = counts
            .values()
            .find(|(count, _)| *count >= self.quorum)
            .map(|(_, payload)| *payload);

        if let Some(payload) = agreed {
            return self.decide(payload, data);
        }

        // quorum is impossible once the leading value plus the replicas
        // still to report cannot reach it
        let leading = counts.values().map(|(count, _)| *count).max().unwrap_or(0);
        let outstanding = self.replica_count - self.collection.len();
        if leading + outstanding < self.quorum {
            let event = self.spec.no_majority_event.unwrap_or(Event::NoMajority);
            warn!(round = %self.spec.id, leading, "No majority can be reached");
            return RoundOutcome::Decided {
                data: data.clone(),
                event,
            };
        }

        RoundOutcome::Waiting
    }

    /// The outcome to use when the deadline has passed while waiting.
    pub fn timeout_outcome(&self, data: &SynchronizedData, now: i64) -> Option<RoundOutcome> {
        if now < self.deadline {
            return None;
        }
        warn!(round = %self.spec.id, "Round deadline exceeded");
        Some(RoundOutcome::Decided {
            data: data.clone(),
            event: self.spec.timeout_event,
        })
    }

    fn decide(&self, payload: &PayloadValues, data: &SynchronizedData) -> RoundOutcome {
        if is_null_payload(payload) {
            let event = self.spec.none_event.unwrap_or(Event::Done);
            debug!(round = %self.spec.id, "Quorum on a null value");
            return RoundOutcome::Decided {
                data: data.clone(),
                event,
            };
        }

        // project the agreed sub-fields into the synchronized data
        let selected = self
            .spec
            .selection_keys
            .iter()
            .filter_map(|key| {
                payload
                    .get(*key)
                    .map(|value| ((*key).to_string(), value.clone()))
            })
            .collect::<Vec<_>>();
        let new_data = data.update(selected);

        let mut event = Event::Done;
        if let Some(post_process) = self.spec.post_process {
            if let Some(overridden) = post_process(payload) {
                debug!(round = %self.spec.id, event = %overridden, "Post-processing re-routed the outcome");
                event = overridden;
            }
        }

        RoundOutcome::Decided {
            data: new_data,
            event,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn spec(post_process: Option<PostProcess>) -> RoundSpec<&'static str> {
        RoundSpec {
            id: "test_round",
            payload_keys: &["value"],
            selection_keys: &["value"],
            none_event: Some(Event::None),
            no_majority_event: Some(Event::NoMajority),
            timeout_event: Event::RoundTimeout,
            timeout_secs: 30,
            post_process,
            extra_events: &[],
        }
    }

    fn payload(value: Value) -> PayloadValues {
        let mut payload = PayloadValues::new();
        payload.insert("value".to_string(), value);
        payload
    }

    fn state(replica_count: usize, quorum: usize) -> RoundState<&'static str> {
        RoundState::new(spec(None), replica_count, quorum, NOW)
    }

    #[test]
    fn test_sub_quorum_never_decides() {
        let mut round = state(4, 3);
        round.submit(&"r0".to_string(), payload(json!(7))).unwrap();
        round.submit(&"r1".to_string(), payload(json!(7))).unwrap();
        assert_eq!(round.process(&SynchronizedData::new()), RoundOutcome::Waiting);
    }

    #[test]
    fn test_quorum_identical_emits_done_once() {
        let mut round = state(4, 3);
        for replica in ["r0", "r1", "r2"] {
            round.submit(&replica.to_string(), payload(json!(7))).unwrap();
        }
        match round.process(&SynchronizedData::new()) {
            RoundOutcome::Decided { data, event } => {
                assert_eq!(event, Event::Done);
                assert_eq!(data.get("value"), Some(&json!(7)));
            }
            RoundOutcome::Waiting => panic!("quorum must decide"),
        }
    }

    #[test]
    fn test_quorum_on_null_emits_none() {
        let mut round = state(4, 3);
        for replica in ["r0", "r1", "r2"] {
            round
                .submit(&replica.to_string(), payload(Value::Null))
                .unwrap();
        }
        match round.process(&SynchronizedData::new()) {
            RoundOutcome::Decided { data, event } => {
                assert_eq!(event, Event::None);
                // null outcomes are not merged
                assert_eq!(data.get("value"), None);
            }
            RoundOutcome::Waiting => panic!("quorum must decide"),
        }
    }

    #[test]
    fn test_no_majority_when_quorum_impossible() {
        let mut round = state(4, 3);
        round.submit(&"r0".to_string(), payload(json!(1))).unwrap();
        round.submit(&"r1".to_string(), payload(json!(2))).unwrap();
        round.submit(&"r2".to_string(), payload(json!(3))).unwrap();
        // best case: one more vote for any value gives 2 < 3
        match round.process(&SynchronizedData::new()) {
            RoundOutcome::Decided { event, .. } => assert_eq!(event, Event::NoMajority),
            RoundOutcome::Waiting => panic!("no majority must be detected"),
        }
    }

    #[test]
    fn test_still_waiting_while_quorum_possible() {
        let mut round = state(4, 3);
        round.submit(&"r0".to_string(), payload(json!(1))).unwrap();
        round.submit(&"r1".to_string(), payload(json!(2))).unwrap();
        // two replicas outstanding — value 1 could still reach 3
        assert_eq!(round.process(&SynchronizedData::new()), RoundOutcome::Waiting);
    }

    #[test]
    fn test_duplicate_submission_idempotent_conflict_rejected() {
        let mut round = state(4, 3);
        let replica = "r0".to_string();
        round.submit(&replica, payload(json!(7))).unwrap();
        round.submit(&replica, payload(json!(7))).unwrap();
        assert!(round.submit(&replica, payload(json!(8))).is_err());
        assert_eq!(round.collected(), 1);
    }

    #[test]
    fn test_submit_rejects_wrong_payload_shape() {
        let mut round = state(4, 3);
        let mut wrong = PayloadValues::new();
        wrong.insert("other".to_string(), json!(1));
        assert!(round.submit(&"r0".to_string(), wrong).is_err());
    }

    #[test]
    fn test_timeout_outcome() {
        let round = state(4, 3);
        let data = SynchronizedData::new();
        assert!(round.timeout_outcome(&data, NOW + 29).is_none());
        match round.timeout_outcome(&data, NOW + 30) {
            Some(RoundOutcome::Decided { event, .. }) => {
                assert_eq!(event, Event::RoundTimeout)
            }
            other => panic!("expected a timeout outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_post_process_reroutes_done() {
        fn empty_hash_fails(payload: &PayloadValues) -> Option<Event> {
            match payload.get("value") {
                Some(Value::String(s)) if s.is_empty() => Some(Event::CalcBuyAmountFailed),
                _ => None,
            }
        }

        let mut round = RoundState::new(spec(Some(empty_hash_fails)), 4, 3, NOW);
        for replica in ["r0", "r1", "r2"] {
            round
                .submit(&replica.to_string(), payload(json!("")))
                .unwrap();
        }
        match round.process(&SynchronizedData::new()) {
            RoundOutcome::Decided { event, .. } => {
                assert_eq!(event, Event::CalcBuyAmountFailed)
            }
            RoundOutcome::Waiting => panic!("quorum must decide"),
        }
    }

    #[test]
    fn test_selection_key_projection() {
        let spec = RoundSpec {
            id: "projection",
            payload_keys: &["kept", "dropped"],
            selection_keys: &["kept"],
            none_event: None,
            no_majority_event: Some(Event::NoMajority),
            timeout_event: Event::RoundTimeout,
            timeout_secs: 30,
            post_process: None,
            extra_events: &[],
        };
        let mut round = RoundState::new(spec, 3, 3, NOW);
        for replica in ["r0", "r1", "r2"] {
            let mut payload = PayloadValues::new();
            payload.insert("kept".to_string(), json!("a"));
            payload.insert("dropped".to_string(), json!("b"));
            round.submit(&replica.to_string(), payload).unwrap();
        }
        match round.process(&SynchronizedData::new()) {
            RoundOutcome::Decided { data, .. } => {
                assert_eq!(data.get("kept"), Some(&json!("a")));
                assert_eq!(data.get("dropped"), None);
            }
            RoundOutcome::Waiting => panic!("quorum must decide"),
        }
    }
}
