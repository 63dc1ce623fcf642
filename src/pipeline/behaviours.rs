//! Per-round local computation.
//!
//! A behaviour produces the payload this replica submits for the round
//! currently running, reading the sampled ledger state and the policy
//! and calling the external collaborators. Side-effecting sub-steps are
//! idempotent: transient collaborator failures surface as errors and the
//! runner simply re-executes the behaviour on the next tick until the
//! round deadline passes.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rounds::{
    BENCHMARKING_FINISHED_FIELD, BET_PLACEMENT_SUBMITTER, BLACKLIST_VOTE_FIELD, REDEEM_SUBMITTER,
    SELL_SUBMITTER, TOKEN_BALANCE_FIELD, WALLET_BALANCE_FIELD,
};
use super::RoundId;
use crate::amm;
use crate::bets::{BetLedger, QueueStatus};
use crate::config::AppConfig;
use crate::consensus::sync_data::{keys, wei_value};
use crate::consensus::{PayloadValues, SynchronizedData};
use crate::markets::{
    retry_with_backoff, ContractCaller, MarketDataSource, MarketFilters, MechClient,
    RandomnessSource, TxPayload, TxSubmitter,
};
use crate::policy::EGreedyPolicy;
use crate::storage;
use crate::strategy::{SizingInput, Strategy};
use crate::types::{wei_to_native, ConcordError, MarketSnapshot, PredictionResponse};

/// Retries of a collaborator call within one behaviour execution.
const CALL_ATTEMPTS: u32 = 3;

/// The engine's external collaborators, behind their narrow contracts.
pub struct Collaborators {
    pub market_source: Arc<dyn MarketDataSource>,
    pub contracts: Arc<dyn ContractCaller>,
    pub submitter: Arc<dyn TxSubmitter>,
    pub mech: Arc<dyn MechClient>,
    pub randomness: Arc<dyn RandomnessSource>,
}

/// Replica-local state threaded through the behaviours. The ledger and
/// policy are owned here exclusively — never shared across replicas.
pub struct PipelineContext {
    pub config: AppConfig,
    pub strategy: Strategy,
    pub ledger: BetLedger,
    pub policy: EGreedyPolicy,
    /// The transaction prepared by the last tx round, awaiting submission.
    pub pending_tx: Option<TxPayload>,
    /// Benchmark rows still to consume; `None` outside benchmarking mode.
    pub benchmark_rows_left: Option<u64>,
    /// Consensus cycle counter (drives the randomness beacon round).
    pub cycle: u64,
}

impl PipelineContext {
    fn bets_path(&self) -> std::path::PathBuf {
        storage::bets_path(&self.config.agent.data_dir)
    }

    fn save_ledger(&self) -> Result<String, ConcordError> {
        storage::save_bets(&self.ledger, &self.bets_path())
            .map_err(|e| ConcordError::Storage(e.to_string()))
    }

    fn retry_sleep(&self) -> Duration {
        Duration::from_secs(self.config.consensus.retry_sleep_secs)
    }
}

/// Execute the behaviour matching the given round.
pub async fn execute(
    round: RoundId,
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
    data: &SynchronizedData,
    now: i64,
) -> Result<PayloadValues, ConcordError> {
    match round {
        RoundId::CheckBenchmarking => check_benchmarking(ctx),
        RoundId::UpdateBets => update_bets(ctx, collaborators, now).await,
        RoundId::Sampling => sampling(ctx, now),
        RoundId::Randomness => randomness(ctx, collaborators).await,
        RoundId::ToolSelection => tool_selection(ctx, data, now),
        RoundId::DecisionRequest => decision_request(ctx, collaborators, data).await,
        RoundId::DecisionReceive => decision_receive(ctx, collaborators, data, now).await,
        RoundId::Blacklisting => blacklisting(ctx, data),
        RoundId::BetPlacement => bet_placement(ctx, collaborators, data).await,
        RoundId::SellOutcomeTokens => sell_outcome_tokens(ctx, data).await,
        RoundId::Redeem => redeem(ctx, now),
        RoundId::HandleFailedTx => handle_failed_tx(data),
        terminal => Err(ConcordError::Configuration(format!(
            "terminal round {terminal} has no behaviour"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn payload(entries: Vec<(&str, Value)>) -> PayloadValues {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn nulls(keys: &[&str]) -> PayloadValues {
    keys.iter().map(|k| ((*k).to_string(), Value::Null)).collect()
}

fn tx_payload_hash(tx: &TxPayload) -> String {
    if tx.data.is_empty() {
        // an empty calldata means the amount calculation failed
        return String::new();
    }
    let digest = Sha256::digest(format!("{}:{}:{}", tx.to, tx.data, tx.value));
    format!("0x{}", hex::encode(digest))
}

// ---------------------------------------------------------------------------
// Behaviours
// ---------------------------------------------------------------------------

fn check_benchmarking(ctx: &mut PipelineContext) -> Result<PayloadValues, ConcordError> {
    Ok(payload(vec![(
        keys::BENCHMARKING_ENABLED,
        json!(ctx.config.benchmarking.enabled),
    )]))
}

/// Fetch the market snapshot, merge it into the ledger, run the
/// lifecycle sweeps, persist, and agree on the content hash.
async fn update_bets(
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
    now: i64,
) -> Result<PayloadValues, ConcordError> {
    let filters = MarketFilters {
        creators: ctx.config.market_source.creators.clone(),
        opened_after: now,
        page_size: ctx.config.market_source.page_size,
    };

    let source = collaborators.market_source.clone();
    let snapshots = retry_with_backoff(CALL_ATTEMPTS, ctx.retry_sleep(), || {
        let source = source.clone();
        let filters = filters.clone();
        async move { source.fetch_markets(&filters).await }
    })
    .await;

    let snapshots: Vec<MarketSnapshot> = match snapshots {
        Ok(snapshots) => snapshots,
        Err(error) => {
            warn!(%error, "Market fetch failed for the whole cycle");
            return Ok(nulls(&[keys::BETS_HASH]));
        }
    };

    ctx.ledger.upsert(snapshots);

    match collaborators
        .market_source
        .fetch_positions(&ctx.config.agent.account)
        .await
    {
        Ok(positions) => ctx.ledger.update_investments(&positions),
        Err(error) => warn!(%error, "Position refresh failed; keeping stale investments"),
    }

    let sampling = &ctx.config.sampling;
    ctx.ledger.blacklist_expired(now, sampling.opening_margin_secs);
    if sampling.review_bets_for_selling {
        ctx.ledger.requeue_for_selling(
            now,
            sampling.opening_margin_secs,
            sampling.sell_check_interval_secs,
        );
        ctx.ledger
            .review_for_selling(now, sampling.opening_margin_secs);
    }
    ctx.ledger.sweep_freshness(sampling.use_multi_bets_mode);

    let hash = ctx.save_ledger()?;
    Ok(payload(vec![(keys::BETS_HASH, json!(hash))]))
}

/// Select exactly one processable bet; an empty candidate set is "no
/// decision this cycle", not an error.
fn sampling(ctx: &mut PipelineContext, now: i64) -> Result<PayloadValues, ConcordError> {
    let sampling = &ctx.config.sampling;
    let index = ctx.ledger.sample(
        now,
        sampling.opening_margin_secs,
        sampling.sample_window_secs,
    );

    let Some(index) = index else {
        return Ok(nulls(&[keys::BETS_HASH, keys::SAMPLED_BET_INDEX]));
    };

    ctx.ledger.mark_sampled(index, now);
    let hash = ctx.save_ledger()?;
    info!(index, "Sampled a bet");
    Ok(payload(vec![
        (keys::BETS_HASH, json!(hash)),
        (keys::SAMPLED_BET_INDEX, json!(index)),
    ]))
}

async fn randomness(
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
) -> Result<PayloadValues, ConcordError> {
    let beacon = collaborators.randomness.fetch(ctx.cycle).await?;
    Ok(payload(vec![(keys::RANDOMNESS, json!(beacon))]))
}

fn tool_selection(
    ctx: &mut PipelineContext,
    data: &SynchronizedData,
    now: i64,
) -> Result<PayloadValues, ConcordError> {
    let randomness = data.randomness()?;
    // zero available tools propagates as a hard failure
    let tool = ctx.policy.select_tool(&randomness, now)?;
    Ok(payload(vec![
        (keys::MECH_TOOL, json!(tool)),
        (keys::POLICY, json!(ctx.policy.serialize()?)),
    ]))
}

async fn decision_request(
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
    data: &SynchronizedData,
) -> Result<PayloadValues, ConcordError> {
    let tool = data.mech_tool()?;
    let question = if data.benchmarking_enabled() {
        format!("benchmark row {}", ctx.cycle)
    } else {
        let index = data.sampled_bet_index()?;
        let bet = ctx.ledger.get(index).ok_or_else(|| {
            ConcordError::Configuration(format!("sampled bet index {index} out of range"))
        })?;
        format!(
            "With the question \"{}\" and the `yes` option represented by {:?} \
             and the `no` option represented by {:?}, what are the respective \
             probabilities of `p_yes` and `p_no` occurring?",
            bet.title,
            bet.yes()?,
            bet.no()?,
        )
    };

    let mech = collaborators.mech.clone();
    let request = retry_with_backoff(CALL_ATTEMPTS, ctx.retry_sleep(), || {
        let mech = mech.clone();
        let tool = tool.clone();
        let question = question.clone();
        async move { mech.request(&tool, &question).await }
    })
    .await;

    match request {
        Ok(request_id) => Ok(payload(vec![(keys::DECISION_REQUEST_ID, json!(request_id))])),
        Err(error) => {
            warn!(%error, %tool, "Prediction request could not be made");
            Ok(nulls(&[keys::DECISION_REQUEST_ID]))
        }
    }
}

/// Receive the prediction and decide profitability (or a sell).
async fn decision_receive(
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
    data: &SynchronizedData,
    now: i64,
) -> Result<PayloadValues, ConcordError> {
    let all_keys: [&str; 7] = [
        keys::BET_AMOUNT,
        keys::BETS_HASH,
        keys::CONFIDENCE,
        keys::IS_PROFITABLE,
        keys::SELL_AMOUNT,
        keys::VOTE,
        BENCHMARKING_FINISHED_FIELD,
    ];

    // benchmark exhaustion ends the whole run
    if data.benchmarking_enabled() {
        match ctx.benchmark_rows_left {
            Some(0) => {
                let mut exhausted = nulls(&all_keys);
                exhausted.insert(BENCHMARKING_FINISHED_FIELD.to_string(), json!(true));
                info!("The benchmarking has finished");
                return Ok(exhausted);
            }
            Some(ref mut rows) => *rows -= 1,
            None => {}
        }
    }

    let request_id = data.decision_request_id()?;
    let response = collaborators.mech.response(&request_id).await?;
    let Some(response) = response else {
        // still pending: suspend and re-poll on the next tick
        return Err(ConcordError::Contract(format!(
            "mech response {request_id} still pending"
        )));
    };

    let tool = data.mech_tool()?;
    let Some(prediction) = response.result else {
        warn!(
            %tool,
            error = response.error.as_deref().unwrap_or("unknown"),
            "The tool's response was unusable"
        );
        ctx.policy.record_response(&tool, now, true);
        return Ok(nulls(&all_keys));
    };
    ctx.policy.record_response(&tool, now, false);
    info!(%tool, %prediction, "Decision has been received");

    if data.benchmarking_enabled() {
        return benchmark_decision(ctx, &prediction);
    }

    let index = data.sampled_bet_index()?;
    // a bet taken from the sell queue routes to the sell leg
    let selected_for_selling = ctx
        .ledger
        .get(index)
        .map(|bet| bet.queue_status == QueueStatus::SelectedForSelling)
        .unwrap_or(false);

    if selected_for_selling {
        return sell_decision(ctx, index, &prediction);
    }
    buy_decision(ctx, collaborators, data, index, &prediction).await
}

/// Simulate a decision against the configured mock pool. Benchmarking
/// exercises the tools and the pricing path but never reaches the
/// transaction rounds.
fn benchmark_decision(
    ctx: &mut PipelineContext,
    prediction: &PredictionResponse,
) -> Result<PayloadValues, ConcordError> {
    let vote = prediction.vote();
    let mode = &ctx.config.benchmarking;
    let pool: Vec<u128> = mode
        .pool_token_amounts_wei
        .iter()
        .map(|amount| *amount as u128)
        .collect();

    if let Some(vote) = vote {
        let bet_threshold = ctx.config.trading.bet_threshold_wei as u128;
        let sizing = SizingInput {
            bankroll: ctx.config.trading.max_bet_wei as u128,
            win_probability: prediction.win_probability(),
            confidence: prediction.confidence,
            selected_type_tokens_in_pool: pool[vote],
            other_tokens_in_pool: pool[vote ^ 1],
            bet_fee: 0,
        };
        let bet_amount = ctx.strategy.compute_bet_amount(&sizing)?.max(bet_threshold);
        let estimate = amm::calc_binary_shares(&pool, &mode.pool_prices, bet_amount, vote)?;
        let profit = amm::potential_net_profit(estimate.num_shares, bet_amount, bet_threshold);
        info!(
            vote,
            bet_amount,
            profit,
            profitable = profit >= 0,
            "Benchmark decision simulated"
        );
    }

    Ok(payload(vec![
        (keys::BET_AMOUNT, Value::Null),
        (keys::BETS_HASH, Value::Null),
        (keys::CONFIDENCE, json!(prediction.confidence)),
        // the transaction rounds are skipped while benchmarking
        (keys::IS_PROFITABLE, json!(false)),
        (keys::SELL_AMOUNT, Value::Null),
        (keys::VOTE, vote.map(|v| json!(v)).unwrap_or(Value::Null)),
        (BENCHMARKING_FINISHED_FIELD, json!(false)),
    ]))
}

/// Price a sell of the held position.
fn sell_decision(
    ctx: &mut PipelineContext,
    index: usize,
    prediction: &PredictionResponse,
) -> Result<PayloadValues, ConcordError> {
    let bet = ctx.ledger.get(index).ok_or_else(|| {
        ConcordError::Configuration(format!("sampled bet index {index} out of range"))
    })?;

    // sell the side we hold
    let held = if bet.invested_amount_for(0) >= bet.invested_amount_for(1) {
        0
    } else {
        1
    };
    let shares = bet.invested_amount_for(held);
    let collateral = amm::sell_amount_in_collateral(
        shares,
        &bet.outcome_token_amounts,
        held,
        wei_to_native(bet.fee),
    );

    let Some(collateral) = collateral else {
        warn!(bet_id = %bet.id, "Sell amount computation did not converge");
        return Ok(nulls(&[
            keys::BET_AMOUNT,
            keys::BETS_HASH,
            keys::CONFIDENCE,
            keys::IS_PROFITABLE,
            keys::SELL_AMOUNT,
            keys::VOTE,
            BENCHMARKING_FINISHED_FIELD,
        ]));
    };

    info!(bet_id = %bet.id, shares, collateral, "Decided to sell the position");
    Ok(payload(vec![
        (keys::BET_AMOUNT, Value::Null),
        (keys::BETS_HASH, Value::Null),
        (keys::CONFIDENCE, json!(prediction.confidence)),
        (keys::IS_PROFITABLE, Value::Null),
        (keys::SELL_AMOUNT, wei_value(collateral)),
        (keys::VOTE, json!(held)),
        (BENCHMARKING_FINISHED_FIELD, json!(false)),
    ]))
}

/// Size a buy and decide whether it is profitable.
async fn buy_decision(
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
    data: &SynchronizedData,
    index: usize,
    prediction: &PredictionResponse,
) -> Result<PayloadValues, ConcordError> {
    let Some(vote) = prediction.vote() else {
        debug!("The prediction tied; nothing to vote for");
        return Ok(payload(vec![
            (keys::BET_AMOUNT, Value::Null),
            (keys::BETS_HASH, Value::Null),
            (keys::CONFIDENCE, json!(prediction.confidence)),
            (keys::IS_PROFITABLE, Value::Null),
            (keys::SELL_AMOUNT, Value::Null),
            (keys::VOTE, Value::Null),
            (BENCHMARKING_FINISHED_FIELD, json!(false)),
        ]));
    };

    let (collateral_token, fee, pool, prices, id) = {
        let bet = ctx.ledger.get(index).ok_or_else(|| {
            ConcordError::Configuration(format!("sampled bet index {index} out of range"))
        })?;
        (
            bet.collateral_token.clone(),
            bet.fee,
            bet.outcome_token_amounts.clone(),
            bet.outcome_prices.clone(),
            bet.id.clone(),
        )
    };

    let contracts = collaborators.contracts.clone();
    let account = ctx.config.agent.account.clone();
    let balance = retry_with_backoff(CALL_ATTEMPTS, ctx.retry_sleep(), || {
        let contracts = contracts.clone();
        let token = collateral_token.clone();
        let account = account.clone();
        async move { contracts.get_balance(&token, &account).await }
    })
    .await?;

    let sizing = SizingInput {
        bankroll: balance.token_balance,
        win_probability: prediction.win_probability(),
        confidence: prediction.confidence,
        selected_type_tokens_in_pool: pool[vote],
        other_tokens_in_pool: pool[vote ^ 1],
        bet_fee: fee,
    };
    let bet_threshold = ctx.config.trading.bet_threshold_wei as u128;
    let bet_amount = ctx.strategy.compute_bet_amount(&sizing)?.max(bet_threshold);
    let net_bet_amount = amm::remove_fee_fraction(bet_amount, fee);

    let estimate = amm::calc_binary_shares(&pool, &prices, net_bet_amount, vote)?;
    if estimate.exceeds_slippage() {
        warn!(
            bet_id = %id,
            %estimate,
            "The pool's liquidity is low compared to the bet; expect fewer shares than priced"
        );
    }

    let profit = amm::potential_net_profit(estimate.num_shares, net_bet_amount, bet_threshold);
    let mut is_profitable = profit >= 0;
    info!(
        bet_id = %id,
        bet_amount,
        net_bet_amount,
        profit,
        is_profitable,
        "Profitability decided"
    );

    // rebet guard: trial-mutate the bet, roll back on rejection
    let mut bets_hash = Value::Null;
    if is_profitable {
        ctx.ledger.begin_trial(index);
        let Some(bet) = ctx.ledger.get_mut(index) else {
            return Err(ConcordError::Configuration(format!(
                "sampled bet index {index} out of range"
            )));
        };
        let previous_response = bet.last_prediction.clone();
        let previous_liquidity = bet.position_liquidity;
        let previous_profit = bet.potential_net_profit;

        bet.last_prediction = Some(prediction.clone());
        bet.position_liquidity = bet.outcome_token_amounts[vote];
        bet.potential_net_profit = profit;

        if bet.rebet_allowed(previous_response.as_ref(), previous_liquidity, previous_profit) {
            ctx.ledger.commit_trial();
            bets_hash = json!(ctx.save_ledger()?);
        } else {
            info!(bet_id = %id, "Conditions for rebetting are not met");
            ctx.ledger.rollback_trial();
            is_profitable = false;
        }
    }

    Ok(payload(vec![
        (keys::BET_AMOUNT, wei_value(bet_amount)),
        (keys::BETS_HASH, bets_hash),
        (keys::CONFIDENCE, json!(prediction.confidence)),
        (keys::IS_PROFITABLE, json!(is_profitable)),
        (keys::SELL_AMOUNT, Value::Null),
        (keys::VOTE, json!(vote)),
        (BENCHMARKING_FINISHED_FIELD, json!(false)),
    ]))
}

/// Take the sampled bet out of rotation after a domain failure.
fn blacklisting(
    ctx: &mut PipelineContext,
    data: &SynchronizedData,
) -> Result<PayloadValues, ConcordError> {
    if let Ok(index) = data.sampled_bet_index() {
        if let Some(bet) = ctx.ledger.get_mut(index) {
            // the bet did not get placed; undo the sampling increment
            bet.n_bets = bet.n_bets.saturating_sub(1);
        }
    }
    let hash = ctx.save_ledger()?;
    Ok(payload(vec![
        (keys::BETS_HASH, json!(hash)),
        (keys::POLICY, json!(ctx.policy.serialize()?)),
    ]))
}

/// Check the balance and prepare the funding transaction.
async fn bet_placement(
    ctx: &mut PipelineContext,
    collaborators: &Collaborators,
    data: &SynchronizedData,
) -> Result<PayloadValues, ConcordError> {
    let all_keys = [
        TOKEN_BALANCE_FIELD,
        keys::TX_HASH,
        keys::TX_SUBMITTER,
        WALLET_BALANCE_FIELD,
    ];
    let vote = data.vote()?.ok_or_else(|| {
        ConcordError::Configuration("bet placement entered without an agreed vote".to_string())
    })?;
    let bet_amount = data.bet_amount()?;
    let index = data.sampled_bet_index()?;
    let (pool_address, collateral_token) = {
        let bet = ctx.ledger.get(index).ok_or_else(|| {
            ConcordError::Configuration(format!("sampled bet index {index} out of range"))
        })?;
        (bet.id.clone(), bet.collateral_token.clone())
    };

    let contracts = collaborators.contracts.clone();
    let account = ctx.config.agent.account.clone();
    let balance = retry_with_backoff(CALL_ATTEMPTS, ctx.retry_sleep(), || {
        let contracts = contracts.clone();
        let token = collateral_token.clone();
        let account = account.clone();
        async move { contracts.get_balance(&token, &account).await }
    })
    .await?;

    if balance.token_balance < bet_amount {
        warn!(
            needed = bet_amount,
            available = balance.token_balance,
            "Insufficient balance for the bet"
        );
        return Ok(nulls(&all_keys));
    }

    let tx = retry_with_backoff(CALL_ATTEMPTS, ctx.retry_sleep(), || {
        let contracts = contracts.clone();
        let pool = pool_address.clone();
        async move { contracts.build_trade_tx(&pool, bet_amount, vote).await }
    })
    .await?;
    let tx_hash = tx_payload_hash(&tx);
    ctx.pending_tx = Some(tx);

    if !tx_hash.is_empty() {
        if let Some(bet) = ctx.ledger.get_mut(index) {
            bet.append_investment(vote, bet_amount);
        }
        ctx.save_ledger()?;
    }

    Ok(payload(vec![
        (TOKEN_BALANCE_FIELD, wei_value(balance.token_balance)),
        (keys::TX_HASH, json!(tx_hash)),
        (keys::TX_SUBMITTER, json!(BET_PLACEMENT_SUBMITTER)),
        (WALLET_BALANCE_FIELD, wei_value(balance.native_balance)),
    ]))
}

/// Prepare the transaction selling the held position.
async fn sell_outcome_tokens(
    ctx: &mut PipelineContext,
    data: &SynchronizedData,
) -> Result<PayloadValues, ConcordError> {
    let sell_amount = data.sell_amount()?;
    let index = data.sampled_bet_index()?;
    let bet = ctx.ledger.get(index).ok_or_else(|| {
        ConcordError::Configuration(format!("sampled bet index {index} out of range"))
    })?;

    let digest = Sha256::digest(format!("sell:{}:{}", bet.id, sell_amount));
    let tx = TxPayload {
        to: bet.id.clone(),
        data: hex::encode(digest),
        value: 0,
    };
    let tx_hash = tx_payload_hash(&tx);
    ctx.pending_tx = Some(tx);

    // the sell selection is consumed here
    if let Some(bet) = ctx.ledger.get_mut(index) {
        bet.queue_status = bet.queue_status.next_status();
    }
    ctx.save_ledger()?;

    Ok(payload(vec![
        (keys::SELL_AMOUNT, wei_value(sell_amount)),
        (keys::TX_HASH, json!(tx_hash)),
        (keys::TX_SUBMITTER, json!(SELL_SUBMITTER)),
    ]))
}

/// Claim winnings of resolved positions, if any.
fn redeem(ctx: &mut PipelineContext, now: i64) -> Result<PayloadValues, ConcordError> {
    let all_keys = [
        keys::POLICY,
        keys::REDEEMED_AMOUNT,
        keys::TX_HASH,
        keys::TX_SUBMITTER,
    ];

    let redeemable: Vec<(String, String, u128)> = ctx
        .ledger
        .bets()
        .iter()
        .filter(|bet| {
            bet.invested_amount() > 0
                && bet.opening_timestamp <= now
                && !bet.is_blacklisted_forever()
        })
        .map(|bet| (bet.id.clone(), bet.condition_id.clone(), bet.invested_amount()))
        .collect();

    if redeemable.is_empty() {
        debug!("Nothing to redeem this cycle");
        return Ok(nulls(&all_keys));
    }

    let redeemed_amount: u128 = redeemable.iter().map(|(_, _, amount)| amount).sum();
    let conditions: Vec<&str> = redeemable
        .iter()
        .map(|(_, condition, _)| condition.as_str())
        .collect();
    let digest = Sha256::digest(format!("redeem:{}", conditions.join(",")));
    let tx = TxPayload {
        to: redeemable[0].0.clone(),
        data: hex::encode(digest),
        value: 0,
    };
    let tx_hash = tx_payload_hash(&tx);
    ctx.pending_tx = Some(tx);

    for (id, _, _) in &redeemable {
        if let Some(index) = ctx.ledger.index_of(id) {
            if let Some(bet) = ctx.ledger.get_mut(index) {
                bet.reset_investments();
            }
        }
    }
    ctx.save_ledger()?;

    info!(redeemed_amount, positions = redeemable.len(), "Redeeming resolved positions");
    Ok(payload(vec![
        (keys::POLICY, json!(ctx.policy.serialize()?)),
        (keys::REDEEMED_AMOUNT, wei_value(redeemed_amount)),
        (keys::TX_HASH, json!(tx_hash)),
        (keys::TX_SUBMITTER, json!(REDEEM_SUBMITTER)),
    ]))
}

/// Vote on how to handle the failed transaction: anything that failed
/// before redeeming blacklists the sampled bet; a failed redeem is a
/// plain no-op retry later.
fn handle_failed_tx(data: &SynchronizedData) -> Result<PayloadValues, ConcordError> {
    let after_redeeming = data.tx_submitter()? == REDEEM_SUBMITTER;
    Ok(payload(vec![(
        BLACKLIST_VOTE_FIELD,
        json!(!after_redeeming),
    )]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markets::memory::{
        InMemoryContractCaller, InMemoryMarketSource, InMemoryMech, InMemoryTxSubmitter,
        SeededRandomness,
    };
    use std::collections::HashMap;

    const WEI: u128 = 1_000_000_000_000_000_000;
    const NOW: i64 = 1_900_000_000;

    fn config() -> AppConfig {
        let toml = r#"
            [agent]
            name = "CONCORD-TEST"
            account = "0xsafe"
            tick_interval_secs = 1
            data_dir = "/tmp/concord-test"

            [consensus]
            replica_count = 4
            quorum_fraction = 0.6666
            round_timeout_secs = 30
            redeem_round_timeout_secs = 3600
            retry_sleep_secs = 0

            [sampling]
            opening_margin_secs = 300
            sample_window_secs = 200000000
            use_multi_bets_mode = false
            review_bets_for_selling = false
            sell_check_interval_secs = 3600

            [policy]
            epsilon = 0.1
            consecutive_failures_threshold = 3
            quarantine_duration_secs = 10800
            remote_accuracy_offset_secs = 300
            tools = ["tool-a", "tool-b"]

            [trading]
            strategy = "kelly_criterion"
            bet_threshold_wei = 100000000000000000
            bet_kelly_fraction = 0.5
            floor_balance_wei = 0
            max_bet_wei = 800000000000000000
            [trading.threshold_amounts_wei]

            [benchmarking]
            enabled = false
            pool_token_amounts_wei = [1000000000000000000, 1000000000000000000]
            pool_prices = [0.5, 0.5]

            [market_source]
            enabled = true
            endpoint_env = "CONCORD_SUBGRAPH_URL"
            page_size = 100
            creators = ["0xcreator"]
        "#;
        let mut cfg: AppConfig = toml::from_str(toml).unwrap();
        cfg.agent.data_dir = format!("/tmp/concord-test-{}", uuid::Uuid::new_v4());
        cfg
    }

    fn snapshot(id: &str) -> MarketSnapshot {
        MarketSnapshot {
            id: id.to_string(),
            title: format!("Market {id}"),
            condition_id: format!("0xcond-{id}"),
            collateral_token: "0xtoken".to_string(),
            fee: 20_000_000_000_000_000,
            opening_timestamp: 2_000_000_000,
            outcomes: Some(vec!["Yes".to_string(), "No".to_string()]),
            outcome_token_amounts: vec![1_200 * WEI, 800 * WEI],
            outcome_prices: vec![0.4, 0.6],
            scaled_liquidity: 20.0,
        }
    }

    fn context() -> PipelineContext {
        let config = config();
        let strategy = Strategy::by_name(&config.trading.strategy, &config.trading).unwrap();
        let policy = EGreedyPolicy::new(
            config.policy.epsilon,
            config.policy.consecutive_failures_threshold,
            config.policy.quarantine_duration_secs,
            &config.policy.tools,
        )
        .unwrap();
        PipelineContext {
            config,
            strategy,
            ledger: BetLedger::new(),
            policy,
            pending_tx: None,
            benchmark_rows_left: None,
            cycle: 0,
        }
    }

    fn collaborators() -> Collaborators {
        let prediction = PredictionResponse::new(0.7, 0.3, 0.8, 0.5).unwrap();
        Collaborators {
            market_source: Arc::new(InMemoryMarketSource::new(vec![snapshot("m1")])),
            contracts: Arc::new(InMemoryContractCaller::new(100 * WEI, WEI)),
            submitter: Arc::new(InMemoryTxSubmitter::settling()),
            mech: Arc::new(InMemoryMech::answering(prediction)),
            randomness: Arc::new(SeededRandomness::new("seed")),
        }
    }

    #[tokio::test]
    async fn test_update_bets_produces_hash() {
        let mut ctx = context();
        let collab = collaborators();
        let payload = update_bets(&mut ctx, &collab, NOW).await.unwrap();
        assert!(payload[keys::BETS_HASH].is_string());
        assert_eq!(ctx.ledger.len(), 1);
        // freshness sweep ran: the bet is processable
        assert_eq!(
            ctx.ledger.get(0).unwrap().queue_status,
            QueueStatus::ToProcess
        );
    }

    #[tokio::test]
    async fn test_update_bets_fetch_failure_sends_nulls() {
        let mut ctx = context();
        let prediction = PredictionResponse::new(0.7, 0.3, 0.8, 0.5).unwrap();
        let collab = Collaborators {
            market_source: Arc::new(
                InMemoryMarketSource::new(vec![snapshot("m1")]).fail_next(10),
            ),
            contracts: Arc::new(InMemoryContractCaller::new(100 * WEI, WEI)),
            submitter: Arc::new(InMemoryTxSubmitter::settling()),
            mech: Arc::new(InMemoryMech::answering(prediction)),
            randomness: Arc::new(SeededRandomness::new("seed")),
        };
        let payload = update_bets(&mut ctx, &collab, NOW).await.unwrap();
        assert!(payload[keys::BETS_HASH].is_null());
    }

    #[tokio::test]
    async fn test_sampling_empty_ledger_sends_nulls() {
        let mut ctx = context();
        let payload = sampling(&mut ctx, NOW).unwrap();
        assert!(payload[keys::SAMPLED_BET_INDEX].is_null());
    }

    #[tokio::test]
    async fn test_full_buy_decision_flow() {
        let mut ctx = context();
        let collab = collaborators();

        update_bets(&mut ctx, &collab, NOW).await.unwrap();
        let sample = sampling(&mut ctx, NOW).unwrap();
        let index = sample[keys::SAMPLED_BET_INDEX].as_u64().unwrap() as usize;

        let beacon = randomness(&mut ctx, &collab).await.unwrap();
        let data = SynchronizedData::new().update([
            (keys::RANDOMNESS.to_string(), beacon[keys::RANDOMNESS].clone()),
            (keys::SAMPLED_BET_INDEX.to_string(), json!(index)),
        ]);

        let selection = tool_selection(&mut ctx, &data, NOW).unwrap();
        let tool = selection[keys::MECH_TOOL].as_str().unwrap().to_string();
        let data = data.update([(keys::MECH_TOOL.to_string(), json!(tool))]);

        let request = decision_request(&mut ctx, &collab, &data).await.unwrap();
        assert!(request[keys::DECISION_REQUEST_ID].is_string());
        let data = data.update([(
            keys::DECISION_REQUEST_ID.to_string(),
            request[keys::DECISION_REQUEST_ID].clone(),
        )]);

        let decision = decision_receive(&mut ctx, &collab, &data, NOW).await.unwrap();
        assert_eq!(decision[keys::VOTE], json!(0));
        assert_eq!(decision[keys::IS_PROFITABLE], json!(true));
        assert!(decision[keys::BET_AMOUNT].is_string());

        // the accepted rebet state was committed to the ledger
        assert!(ctx.ledger.get(index).unwrap().last_prediction.is_some());

        let data = data.update([
            (keys::VOTE.to_string(), decision[keys::VOTE].clone()),
            (keys::BET_AMOUNT.to_string(), decision[keys::BET_AMOUNT].clone()),
        ]);
        let placement = bet_placement(&mut ctx, &collab, &data).await.unwrap();
        assert!(placement[keys::TX_HASH].as_str().unwrap().starts_with("0x"));
        assert_eq!(placement[keys::TX_SUBMITTER], json!(BET_PLACEMENT_SUBMITTER));
        assert!(ctx.pending_tx.is_some());
        assert!(ctx.ledger.get(index).unwrap().invested_amount() > 0);
    }

    #[tokio::test]
    async fn test_decision_receive_tool_error_counts_failure() {
        let mut ctx = context();
        let collab = Collaborators {
            market_source: Arc::new(InMemoryMarketSource::new(vec![snapshot("m1")])),
            contracts: Arc::new(InMemoryContractCaller::new(100 * WEI, WEI)),
            submitter: Arc::new(InMemoryTxSubmitter::settling()),
            mech: Arc::new(InMemoryMech::erroring("boom")),
            randomness: Arc::new(SeededRandomness::new("seed")),
        };

        update_bets(&mut ctx, &collab, NOW).await.unwrap();
        sampling(&mut ctx, NOW).unwrap();
        let data = SynchronizedData::new().update([
            (keys::SAMPLED_BET_INDEX.to_string(), json!(0)),
            (keys::MECH_TOOL.to_string(), json!("tool-a")),
            (keys::DECISION_REQUEST_ID.to_string(), json!("req-1")),
        ]);

        let payload = decision_receive(&mut ctx, &collab, &data, NOW).await.unwrap();
        assert!(payload[keys::VOTE].is_null());
        assert!(payload[keys::IS_PROFITABLE].is_null());
        assert_eq!(ctx.policy.consecutive_failures["tool-a"].n_failures, 1);
    }

    #[tokio::test]
    async fn test_bet_placement_insufficient_balance() {
        let mut ctx = context();
        let collab = collaborators();
        update_bets(&mut ctx, &collab, NOW).await.unwrap();

        let poor = InMemoryContractCaller::new(1, 1);
        let collab = Collaborators {
            contracts: Arc::new(poor),
            ..collaborators()
        };
        let data = SynchronizedData::new().update([
            (keys::SAMPLED_BET_INDEX.to_string(), json!(0)),
            (keys::VOTE.to_string(), json!(0)),
            (keys::BET_AMOUNT.to_string(), wei_value(10 * WEI)),
        ]);
        let payload = bet_placement(&mut ctx, &collab, &data).await.unwrap();
        assert!(payload.values().all(|v| v.is_null()));
    }

    #[tokio::test]
    async fn test_redeem_nothing_to_claim() {
        let mut ctx = context();
        let payload = redeem(&mut ctx, NOW).unwrap();
        assert!(payload.values().all(|v| v.is_null()));
    }

    #[tokio::test]
    async fn test_redeem_resolved_position() {
        let mut ctx = context();
        let collab = collaborators();
        update_bets(&mut ctx, &collab, NOW).await.unwrap();
        ctx.ledger.get_mut(0).unwrap().append_investment(0, 5 * WEI);

        // before opening: nothing redeemable
        let early = redeem(&mut ctx, NOW).unwrap();
        assert!(early[keys::TX_HASH].is_null());

        // after the market opened: claim it
        let late = redeem(&mut ctx, 2_000_000_100).unwrap();
        assert_eq!(late[keys::TX_SUBMITTER], json!(REDEEM_SUBMITTER));
        assert_eq!(late[keys::REDEEMED_AMOUNT], wei_value(5 * WEI));
        assert_eq!(ctx.ledger.get(0).unwrap().invested_amount(), 0);
    }

    #[tokio::test]
    async fn test_handle_failed_tx_votes_by_submitter() {
        let bet_data = SynchronizedData::new().update([(
            keys::TX_SUBMITTER.to_string(),
            json!(BET_PLACEMENT_SUBMITTER),
        )]);
        let payload = handle_failed_tx(&bet_data).unwrap();
        assert_eq!(payload[BLACKLIST_VOTE_FIELD], json!(true));

        let redeem_data = SynchronizedData::new()
            .update([(keys::TX_SUBMITTER.to_string(), json!(REDEEM_SUBMITTER))]);
        let payload = handle_failed_tx(&redeem_data).unwrap();
        assert_eq!(payload[BLACKLIST_VOTE_FIELD], json!(false));
    }

    #[tokio::test]
    async fn test_blacklisting_reverts_sampling_increment() {
        let mut ctx = context();
        let collab = collaborators();
        update_bets(&mut ctx, &collab, NOW).await.unwrap();
        sampling(&mut ctx, NOW).unwrap();
        assert_eq!(ctx.ledger.get(0).unwrap().n_bets, 1);

        let data =
            SynchronizedData::new().update([(keys::SAMPLED_BET_INDEX.to_string(), json!(0))]);
        let payload = blacklisting(&mut ctx, &data).unwrap();
        assert_eq!(ctx.ledger.get(0).unwrap().n_bets, 0);
        assert!(payload[keys::POLICY].is_string());
    }

    #[tokio::test]
    async fn test_sell_flow_for_selected_position() {
        let mut ctx = context();
        let collab = collaborators();
        update_bets(&mut ctx, &collab, NOW).await.unwrap();

        {
            let bet = ctx.ledger.get_mut(0).unwrap();
            bet.append_investment(0, 10 * WEI);
            bet.queue_status = QueueStatus::SelectedForSelling;
        }

        let data = SynchronizedData::new().update([
            (keys::SAMPLED_BET_INDEX.to_string(), json!(0)),
            (keys::MECH_TOOL.to_string(), json!("tool-a")),
            (keys::DECISION_REQUEST_ID.to_string(), json!("req-1")),
        ]);

        let decision = decision_receive(&mut ctx, &collab, &data, NOW).await.unwrap();
        assert!(decision[keys::SELL_AMOUNT].is_string());
        assert_eq!(decision[keys::VOTE], json!(0)); // the held side
        assert!(decision[keys::IS_PROFITABLE].is_null());

        let data = data.update([(
            keys::SELL_AMOUNT.to_string(),
            decision[keys::SELL_AMOUNT].clone(),
        )]);
        let sell = sell_outcome_tokens(&mut ctx, &data).await.unwrap();
        assert!(sell[keys::TX_HASH].as_str().unwrap().starts_with("0x"));
        assert_eq!(sell[keys::TX_SUBMITTER], json!(SELL_SUBMITTER));
        assert!(ctx.pending_tx.is_some());
        // the sell selection was consumed
        assert_eq!(
            ctx.ledger.get(0).unwrap().queue_status,
            QueueStatus::Reprocessed
        );
    }

    #[tokio::test]
    async fn test_benchmark_exhaustion_finishes() {
        let mut ctx = context();
        ctx.benchmark_rows_left = Some(0);
        let collab = collaborators();
        let data = SynchronizedData::new().update([
            (keys::BENCHMARKING_ENABLED.to_string(), json!(true)),
            (keys::SAMPLED_BET_INDEX.to_string(), json!(0)),
            (keys::MECH_TOOL.to_string(), json!("tool-a")),
            (keys::DECISION_REQUEST_ID.to_string(), json!("req-1")),
        ]);
        let payload = decision_receive(&mut ctx, &collab, &data, NOW).await.unwrap();
        assert_eq!(payload[BENCHMARKING_FINISHED_FIELD], json!(true));
    }
}
