//! The decision pipeline — the concrete graph of rounds composed from
//! the round engine.
//!
//! sample a bet → select a tool → request a prediction → receive it →
//! decide profitability (or sell) → place the bet → settle/redeem, with
//! failed transactions routed to a blacklist-or-retry round.

pub mod behaviours;
pub mod rounds;
pub mod runner;

pub use runner::{CycleOutcome, ReplicaRunner};

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::consensus::fsm::FsmSpec;
use crate::consensus::sync_data::keys;
use crate::consensus::Event;

/// The rounds of the decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundId {
    CheckBenchmarking,
    UpdateBets,
    Sampling,
    Randomness,
    ToolSelection,
    DecisionRequest,
    DecisionReceive,
    Blacklisting,
    BetPlacement,
    SellOutcomeTokens,
    Redeem,
    HandleFailedTx,
    // terminal rounds
    FinishedDecision,
    FinishedWithoutDecision,
    FinishedWithoutRedeeming,
    RefillRequired,
    Impossible,
    BenchmarkingDone,
}

impl RoundId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundId::CheckBenchmarking => "check_benchmarking",
            RoundId::UpdateBets => "update_bets",
            RoundId::Sampling => "sampling",
            RoundId::Randomness => "randomness",
            RoundId::ToolSelection => "tool_selection",
            RoundId::DecisionRequest => "decision_request",
            RoundId::DecisionReceive => "decision_receive",
            RoundId::Blacklisting => "blacklisting",
            RoundId::BetPlacement => "bet_placement",
            RoundId::SellOutcomeTokens => "sell_outcome_tokens",
            RoundId::Redeem => "redeem",
            RoundId::HandleFailedTx => "handle_failed_tx",
            RoundId::FinishedDecision => "finished_decision",
            RoundId::FinishedWithoutDecision => "finished_without_decision",
            RoundId::FinishedWithoutRedeeming => "finished_without_redeeming",
            RoundId::RefillRequired => "refill_required",
            RoundId::Impossible => "impossible",
            RoundId::BenchmarkingDone => "benchmarking_done",
        }
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the validated pipeline state machine.
///
/// `no_majority` and `round_timeout` self-loop back into the same round
/// (retry), except for the degenerate cases called out below which end
/// the run instead.
pub fn build_fsm(
    round_timeout_secs: i64,
    redeem_round_timeout_secs: i64,
) -> Result<FsmSpec<RoundId>, crate::types::ConcordError> {
    use Event::*;
    use RoundId::*;

    let specs = rounds::round_specs(round_timeout_secs, redeem_round_timeout_secs);

    let mut transitions = HashMap::new();
    let mut edge = |from: RoundId, event: Event, to: RoundId| {
        transitions.insert((from, event), to);
    };

    edge(CheckBenchmarking, BenchmarkingEnabled, Randomness);
    edge(CheckBenchmarking, BenchmarkingDisabled, UpdateBets);
    edge(CheckBenchmarking, Done, UpdateBets);
    edge(CheckBenchmarking, NoMajority, CheckBenchmarking);
    edge(CheckBenchmarking, RoundTimeout, CheckBenchmarking);

    edge(UpdateBets, Done, Sampling);
    edge(UpdateBets, FetchError, FinishedWithoutDecision);
    edge(UpdateBets, NoMajority, UpdateBets);
    edge(UpdateBets, RoundTimeout, UpdateBets);

    edge(Sampling, Done, Randomness);
    edge(Sampling, None, FinishedWithoutDecision);
    edge(Sampling, NoMajority, Sampling);
    edge(Sampling, RoundTimeout, Sampling);

    edge(Randomness, Done, ToolSelection);
    edge(Randomness, NoMajority, Randomness);
    edge(Randomness, RoundTimeout, Randomness);

    edge(ToolSelection, Done, DecisionRequest);
    edge(ToolSelection, None, ToolSelection);
    edge(ToolSelection, NoMajority, ToolSelection);
    edge(ToolSelection, RoundTimeout, ToolSelection);

    edge(DecisionRequest, Done, DecisionReceive);
    edge(DecisionRequest, MechResponseError, Blacklisting);
    edge(DecisionRequest, NoMajority, DecisionRequest);
    edge(DecisionRequest, RoundTimeout, DecisionRequest);

    edge(DecisionReceive, Done, BetPlacement);
    edge(DecisionReceive, Sell, SellOutcomeTokens);
    edge(DecisionReceive, Tie, Blacklisting);
    edge(DecisionReceive, Unprofitable, Blacklisting);
    edge(DecisionReceive, MechResponseError, Blacklisting);
    edge(DecisionReceive, BenchmarkingFinished, BenchmarkingDone);
    edge(DecisionReceive, NoMajority, DecisionReceive);
    // loop on the same round until the tool delivers
    edge(DecisionReceive, RoundTimeout, DecisionReceive);

    edge(Blacklisting, Done, FinishedWithoutDecision);
    edge(Blacklisting, NoMajority, Blacklisting);
    edge(Blacklisting, RoundTimeout, Blacklisting);

    edge(BetPlacement, Done, FinishedDecision);
    edge(BetPlacement, CalcBuyAmountFailed, Blacklisting);
    // degenerate on purpose: the owner must refill the safe
    edge(BetPlacement, InsufficientBalance, RefillRequired);
    edge(BetPlacement, NoMajority, BetPlacement);
    edge(BetPlacement, RoundTimeout, BetPlacement);

    edge(SellOutcomeTokens, Done, FinishedDecision);
    edge(SellOutcomeTokens, CalcSellAmountFailed, Blacklisting);
    edge(SellOutcomeTokens, NoMajority, SellOutcomeTokens);
    edge(SellOutcomeTokens, RoundTimeout, SellOutcomeTokens);

    edge(Redeem, Done, FinishedDecision);
    edge(Redeem, NoRedeeming, FinishedWithoutRedeeming);
    // a redeem timeout likely means something is wrong with the RPC;
    // do not stay stuck trying to redeem
    edge(Redeem, RedeemRoundTimeout, FinishedWithoutRedeeming);
    edge(Redeem, NoMajority, Redeem);

    edge(HandleFailedTx, Blacklist, Blacklisting);
    edge(HandleFailedTx, NoOp, Redeem);
    edge(HandleFailedTx, Done, Redeem);
    edge(HandleFailedTx, NoMajority, HandleFailedTx);
    edge(HandleFailedTx, RoundTimeout, HandleFailedTx);

    let terminal = HashSet::from([
        FinishedDecision,
        FinishedWithoutDecision,
        FinishedWithoutRedeeming,
        RefillRequired,
        Impossible,
        BenchmarkingDone,
    ]);

    let mut pre_conditions: HashMap<RoundId, Vec<&'static str>> = HashMap::new();
    pre_conditions.insert(Sampling, vec![keys::BETS_HASH]);
    pre_conditions.insert(ToolSelection, vec![keys::RANDOMNESS]);
    pre_conditions.insert(DecisionRequest, vec![keys::MECH_TOOL]);
    pre_conditions.insert(DecisionReceive, vec![keys::DECISION_REQUEST_ID]);
    pre_conditions.insert(BetPlacement, vec![keys::VOTE, keys::BET_AMOUNT]);
    pre_conditions.insert(HandleFailedTx, vec![keys::TX_SUBMITTER]);

    let mut post_conditions: HashMap<RoundId, Vec<&'static str>> = HashMap::new();
    post_conditions.insert(FinishedDecision, vec![keys::TX_SUBMITTER, keys::TX_HASH]);
    post_conditions.insert(FinishedWithoutDecision, vec![]);

    let fsm = FsmSpec::new(CheckBenchmarking, &specs, transitions, terminal)
        .with_pre_conditions(pre_conditions)
        .with_post_conditions(post_conditions);
    fsm.validate()?;
    Ok(fsm)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
