//! The concrete round table of the pipeline.
//!
//! Each entry declares the payload shape replicas must agree on, the
//! sub-fields projected into the synchronized data on `done`, and the
//! post-processing hooks that re-route `done` based on side conditions
//! of the agreed value.

use serde_json::Value;

use super::RoundId;
use crate::consensus::sync_data::keys;
use crate::consensus::{Event, PayloadValues, RoundSpec};

/// Identifier stored under `tx_submitter` by the bet placement round.
pub const BET_PLACEMENT_SUBMITTER: &str = "bet_placement";
/// Identifier stored under `tx_submitter` by the sell round.
pub const SELL_SUBMITTER: &str = "sell_outcome_tokens";
/// Identifier stored under `tx_submitter` by the redeem round.
pub const REDEEM_SUBMITTER: &str = "redeem";

/// Payload field carrying the decision-receive benchmark marker.
pub const BENCHMARKING_FINISHED_FIELD: &str = "benchmarking_finished";
/// Payload field carrying the failed-transaction vote.
pub const BLACKLIST_VOTE_FIELD: &str = "blacklist_vote";
/// Payload fields carrying the balance check of the bet placement round.
pub const WALLET_BALANCE_FIELD: &str = "wallet_balance";
pub const TOKEN_BALANCE_FIELD: &str = "token_balance";

/// The full round table, with the standard and redeem deadlines applied.
pub fn round_specs(
    round_timeout_secs: i64,
    redeem_round_timeout_secs: i64,
) -> Vec<RoundSpec<RoundId>> {
    let spec = |id: RoundId| RoundSpec {
        id,
        payload_keys: &[],
        selection_keys: &[],
        none_event: None,
        no_majority_event: Some(Event::NoMajority),
        timeout_event: Event::RoundTimeout,
        timeout_secs: round_timeout_secs,
        post_process: None,
        extra_events: &[],
    };

    vec![
        RoundSpec {
            payload_keys: &[keys::BENCHMARKING_ENABLED],
            selection_keys: &[keys::BENCHMARKING_ENABLED],
            post_process: Some(route_benchmarking_mode),
            extra_events: &[Event::BenchmarkingEnabled, Event::BenchmarkingDisabled],
            ..spec(RoundId::CheckBenchmarking)
        },
        RoundSpec {
            payload_keys: &[keys::BETS_HASH],
            selection_keys: &[keys::BETS_HASH],
            // agreeing on a null hash means the market fetch failed
            none_event: Some(Event::FetchError),
            ..spec(RoundId::UpdateBets)
        },
        RoundSpec {
            payload_keys: &[keys::BETS_HASH, keys::SAMPLED_BET_INDEX],
            selection_keys: &[keys::BETS_HASH, keys::SAMPLED_BET_INDEX],
            // no processable bet this cycle — not an error
            none_event: Some(Event::None),
            ..spec(RoundId::Sampling)
        },
        RoundSpec {
            payload_keys: &[keys::RANDOMNESS],
            selection_keys: &[keys::RANDOMNESS],
            ..spec(RoundId::Randomness)
        },
        RoundSpec {
            payload_keys: &[keys::MECH_TOOL, keys::POLICY],
            selection_keys: &[keys::MECH_TOOL, keys::POLICY],
            none_event: Some(Event::None),
            ..spec(RoundId::ToolSelection)
        },
        RoundSpec {
            payload_keys: &[keys::DECISION_REQUEST_ID],
            selection_keys: &[keys::DECISION_REQUEST_ID],
            // the request could not be made at all
            none_event: Some(Event::MechResponseError),
            ..spec(RoundId::DecisionRequest)
        },
        RoundSpec {
            payload_keys: &[
                keys::BET_AMOUNT,
                keys::BETS_HASH,
                keys::CONFIDENCE,
                keys::IS_PROFITABLE,
                keys::SELL_AMOUNT,
                keys::VOTE,
                BENCHMARKING_FINISHED_FIELD,
            ],
            selection_keys: &[
                keys::BET_AMOUNT,
                keys::BETS_HASH,
                keys::CONFIDENCE,
                keys::IS_PROFITABLE,
                keys::SELL_AMOUNT,
                keys::VOTE,
            ],
            none_event: Some(Event::MechResponseError),
            post_process: Some(route_decision),
            extra_events: &[
                Event::Tie,
                Event::Unprofitable,
                Event::Sell,
                Event::MechResponseError,
                Event::BenchmarkingFinished,
            ],
            ..spec(RoundId::DecisionReceive)
        },
        RoundSpec {
            payload_keys: &[keys::BETS_HASH, keys::POLICY],
            selection_keys: &[keys::BETS_HASH, keys::POLICY],
            ..spec(RoundId::Blacklisting)
        },
        RoundSpec {
            payload_keys: &[
                TOKEN_BALANCE_FIELD,
                keys::TX_HASH,
                keys::TX_SUBMITTER,
                WALLET_BALANCE_FIELD,
            ],
            selection_keys: &[keys::TX_HASH, keys::TX_SUBMITTER],
            // an all-null payload is the agreed balance shortfall
            none_event: Some(Event::InsufficientBalance),
            post_process: Some(route_bet_placement),
            extra_events: &[Event::CalcBuyAmountFailed],
            ..spec(RoundId::BetPlacement)
        },
        RoundSpec {
            payload_keys: &[keys::SELL_AMOUNT, keys::TX_HASH, keys::TX_SUBMITTER],
            selection_keys: &[keys::SELL_AMOUNT, keys::TX_HASH, keys::TX_SUBMITTER],
            none_event: Some(Event::CalcSellAmountFailed),
            post_process: Some(route_sell),
            extra_events: &[Event::CalcSellAmountFailed],
            ..spec(RoundId::SellOutcomeTokens)
        },
        RoundSpec {
            payload_keys: &[
                keys::POLICY,
                keys::REDEEMED_AMOUNT,
                keys::TX_HASH,
                keys::TX_SUBMITTER,
            ],
            selection_keys: &[
                keys::POLICY,
                keys::REDEEMED_AMOUNT,
                keys::TX_HASH,
                keys::TX_SUBMITTER,
            ],
            none_event: Some(Event::NoRedeeming),
            timeout_event: Event::RedeemRoundTimeout,
            timeout_secs: redeem_round_timeout_secs,
            ..spec(RoundId::Redeem)
        },
        RoundSpec {
            payload_keys: &[BLACKLIST_VOTE_FIELD],
            selection_keys: &[],
            post_process: Some(route_failed_tx),
            extra_events: &[Event::Blacklist, Event::NoOp],
            ..spec(RoundId::HandleFailedTx)
        },
    ]
}

// ---------------------------------------------------------------------------
// Post-processing hooks
// ---------------------------------------------------------------------------

fn route_benchmarking_mode(payload: &PayloadValues) -> Option<Event> {
    match payload.get(keys::BENCHMARKING_ENABLED) {
        Some(Value::Bool(true)) => Some(Event::BenchmarkingEnabled),
        _ => Some(Event::BenchmarkingDisabled),
    }
}

/// Classify the agreed decision. Checked in order: benchmark exhaustion,
/// tie, sell, profitability.
fn route_decision(payload: &PayloadValues) -> Option<Event> {
    if payload.get(BENCHMARKING_FINISHED_FIELD) == Some(&Value::Bool(true)) {
        return Some(Event::BenchmarkingFinished);
    }
    match payload.get(keys::VOTE) {
        Some(Value::Null) => return Some(Event::Tie),
        Some(_) => {}
        None => return Some(Event::MechResponseError),
    }
    if payload
        .get(keys::SELL_AMOUNT)
        .map(|v| !v.is_null())
        .unwrap_or(false)
    {
        return Some(Event::Sell);
    }
    match payload.get(keys::IS_PROFITABLE) {
        Some(Value::Bool(true)) => None, // plain done
        Some(Value::Bool(false)) => Some(Event::Unprofitable),
        _ => Some(Event::MechResponseError),
    }
}

/// A bet placement that reached quorum on `done` but whose agreed hash
/// is empty must re-emit the calculation-failed event instead.
fn route_bet_placement(payload: &PayloadValues) -> Option<Event> {
    match payload.get(keys::TX_HASH) {
        Some(Value::String(hash)) if !hash.is_empty() => None,
        _ => Some(Event::CalcBuyAmountFailed),
    }
}

fn route_sell(payload: &PayloadValues) -> Option<Event> {
    match payload.get(keys::TX_HASH) {
        Some(Value::String(hash)) if !hash.is_empty() => None,
        _ => Some(Event::CalcSellAmountFailed),
    }
}

/// Voting outcome of the failed-transaction round: `true` votes for
/// blacklisting the sampled bet, `false` for a plain retry.
fn route_failed_tx(payload: &PayloadValues) -> Option<Event> {
    match payload.get(BLACKLIST_VOTE_FIELD) {
        Some(Value::Bool(true)) => Some(Event::Blacklist),
        _ => Some(Event::NoOp),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
