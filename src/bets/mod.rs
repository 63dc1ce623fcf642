//! The bet data model.
//!
//! A [`Bet`] is one tracked prediction market with its queue lifecycle,
//! investment history, and the latest prediction placed on it. Malformed
//! market data never produces an error here: the offending bet is
//! permanently blacklisted at construction instead, so one bad market
//! cannot abort a whole cycle.

pub mod ledger;

pub use ledger::BetLedger;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{ConcordError, MarketSnapshot, PredictionResponse, BINARY_OUTCOME_COUNT};

/// Marker value of `processed_timestamp` for permanently blacklisted bets.
/// Fresh market data must never overwrite an entry carrying this marker.
pub const BLACKLIST_FOREVER: i64 = i64::MAX;

// ---------------------------------------------------------------------------
// Queue status
// ---------------------------------------------------------------------------

/// The lifecycle stage of a tracked bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Terminal: never reprocessed.
    Expired,
    /// Never processed since the last freshness sweep.
    Fresh,
    ToProcess,
    Processed,
    /// Re-entrant state for repeat betting; `next_status` is idempotent here.
    Reprocessed,
    /// Queued for a sell review of an open position.
    CheckForSelling,
    /// The sell review decided to sell this position.
    SelectedForSelling,
    /// Terminal: the benchmark run consumed this entry.
    BenchmarkingDone,
}

impl QueueStatus {
    pub fn is_fresh(&self) -> bool {
        matches!(self, QueueStatus::Fresh)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, QueueStatus::Expired)
    }

    /// Whether this status can be forced to another state by policy.
    /// `Expired` and `BenchmarkingDone` are immutable.
    pub fn is_forcible(&self) -> bool {
        !matches!(self, QueueStatus::Expired | QueueStatus::BenchmarkingDone)
    }

    /// Whether a bet in this status is a sampling candidate.
    pub fn is_processable(&self) -> bool {
        matches!(
            self,
            QueueStatus::ToProcess
                | QueueStatus::Processed
                | QueueStatus::Reprocessed
                | QueueStatus::SelectedForSelling
        )
    }

    /// Re-queue: back to `Fresh`, unless the status is terminal.
    pub fn move_to_fresh(self) -> Self {
        if self.is_forcible() {
            QueueStatus::Fresh
        } else {
            self
        }
    }

    /// Freshness sweep promotion.
    pub fn move_to_process(self) -> Self {
        match self {
            QueueStatus::Fresh => QueueStatus::ToProcess,
            other => other,
        }
    }

    /// Queue for a sell review, unless the status is terminal.
    pub fn move_to_check_for_selling(self) -> Self {
        if self.is_forcible() {
            QueueStatus::CheckForSelling
        } else {
            self
        }
    }

    /// Mark as selected for selling, unless the status is terminal.
    pub fn move_to_selected_for_selling(self) -> Self {
        if self.is_forcible() {
            QueueStatus::SelectedForSelling
        } else {
            self
        }
    }

    /// Permanent blacklist, unless already terminal.
    pub fn move_to_expired(self) -> Self {
        match self {
            QueueStatus::BenchmarkingDone => self,
            _ => QueueStatus::Expired,
        }
    }

    /// Advance after a successful processing pass.
    pub fn next_status(self) -> Self {
        match self {
            QueueStatus::ToProcess => QueueStatus::Processed,
            QueueStatus::Processed
            | QueueStatus::Reprocessed
            | QueueStatus::CheckForSelling
            | QueueStatus::SelectedForSelling => QueueStatus::Reprocessed,
            other => other,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueStatus::Expired => "expired",
            QueueStatus::Fresh => "fresh",
            QueueStatus::ToProcess => "to-process",
            QueueStatus::Processed => "processed",
            QueueStatus::Reprocessed => "reprocessed",
            QueueStatus::CheckForSelling => "check-for-selling",
            QueueStatus::SelectedForSelling => "selected-for-selling",
            QueueStatus::BenchmarkingDone => "benchmarking-done",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Bet
// ---------------------------------------------------------------------------

/// One prediction market being tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub title: String,
    /// On-chain condition identifier used for settlement/redeeming.
    pub condition_id: String,
    pub collateral_token: String,
    /// Pool fee in wei, taken from each bet amount.
    pub fee: u128,
    pub opening_timestamp: i64,
    /// Always 2 for this system.
    pub outcome_count: usize,
    /// `None` marks a permanently blacklisted bet.
    pub outcomes: Option<Vec<String>>,
    pub outcome_token_amounts: Vec<u128>,
    pub outcome_prices: Vec<f64>,
    pub scaled_liquidity: f64,
    pub queue_status: QueueStatus,
    /// Per-outcome investment amounts in wei; both keys always present.
    pub investments: BTreeMap<usize, Vec<u128>>,
    /// When this bet was last processed; `BLACKLIST_FOREVER` marks a
    /// permanent blacklist.
    pub processed_timestamp: i64,
    /// Pool tokens of the voted outcome at the time of the last bet.
    pub position_liquidity: u128,
    /// Net profit computed for the last bet, in wei.
    pub potential_net_profit: i128,
    pub last_prediction: Option<PredictionResponse>,
    /// Times a bet was placed on this market.
    pub n_bets: u64,
    /// When this bet was last reviewed for selling.
    pub last_sell_check: i64,
}

impl Bet {
    /// Build a bet from a freshly fetched snapshot.
    ///
    /// Snapshots with missing outcomes, mismatched outcome-list lengths,
    /// or zero liquidity are accepted but permanently blacklisted.
    pub fn from_snapshot(snapshot: MarketSnapshot) -> Self {
        let mut investments = BTreeMap::new();
        for outcome in 0..BINARY_OUTCOME_COUNT {
            investments.insert(outcome, Vec::new());
        }

        let mut bet = Bet {
            id: snapshot.id,
            title: snapshot.title,
            condition_id: snapshot.condition_id,
            collateral_token: snapshot.collateral_token,
            fee: snapshot.fee,
            opening_timestamp: snapshot.opening_timestamp,
            outcome_count: BINARY_OUTCOME_COUNT,
            outcomes: snapshot.outcomes,
            outcome_token_amounts: snapshot.outcome_token_amounts,
            outcome_prices: snapshot.outcome_prices,
            scaled_liquidity: snapshot.scaled_liquidity,
            queue_status: QueueStatus::Fresh,
            investments,
            processed_timestamp: 0,
            position_liquidity: 0,
            potential_net_profit: 0,
            last_prediction: None,
            n_bets: 0,
            last_sell_check: 0,
        };
        bet.validate();
        bet
    }

    /// Blacklist at construction if the market data cannot be bet on.
    fn validate(&mut self) {
        let outcomes_ok = self
            .outcomes
            .as_ref()
            .map(|o| o.len() == self.outcome_count)
            .unwrap_or(false);
        let amounts_ok = self.outcome_token_amounts.len() == self.outcome_count;
        let prices_ok = self.outcome_prices.len() == self.outcome_count;

        if !outcomes_ok || !amounts_ok || !prices_ok || self.scaled_liquidity == 0.0 {
            self.blacklist_forever();
        }
    }

    /// Permanently blacklist this bet. Only for markets it is impossible
    /// or unsafe to ever bet on.
    pub fn blacklist_forever(&mut self) {
        self.outcomes = None;
        self.queue_status = QueueStatus::Expired;
        self.processed_timestamp = BLACKLIST_FOREVER;
    }

    pub fn is_blacklisted_forever(&self) -> bool {
        self.processed_timestamp == BLACKLIST_FOREVER
    }

    /// Refresh market data from a newer snapshot, keeping lifecycle state.
    pub fn update_market_info(&mut self, snapshot: &MarketSnapshot) {
        self.title = snapshot.title.clone();
        self.fee = snapshot.fee;
        self.opening_timestamp = snapshot.opening_timestamp;
        self.outcomes = snapshot.outcomes.clone();
        self.outcome_token_amounts = snapshot.outcome_token_amounts.clone();
        self.outcome_prices = snapshot.outcome_prices.clone();
        self.scaled_liquidity = snapshot.scaled_liquidity;
        self.validate();
    }

    /// Total invested amount across both outcomes, in wei.
    pub fn invested_amount(&self) -> u128 {
        self.investments
            .values()
            .flat_map(|amounts| amounts.iter())
            .sum()
    }

    /// Invested amount on a single outcome, in wei.
    pub fn invested_amount_for(&self, outcome: usize) -> u128 {
        self.investments
            .get(&outcome)
            .map(|amounts| amounts.iter().sum())
            .unwrap_or(0)
    }

    /// Drop all recorded investments (before a balance refresh).
    pub fn reset_investments(&mut self) {
        for amounts in self.investments.values_mut() {
            amounts.clear();
        }
    }

    /// Record an investment amount for an outcome.
    pub fn append_investment(&mut self, outcome: usize, amount: u128) {
        self.investments.entry(outcome).or_default().push(amount);
    }

    /// Get an outcome label by index.
    pub fn get_outcome(&self, index: usize) -> Result<&str, ConcordError> {
        let outcomes = self.outcomes.as_ref().ok_or_else(|| {
            ConcordError::MarketData {
                source_name: "ledger".to_string(),
                message: format!("bet {} has a blacklisted outcomes list", self.id),
            }
        })?;
        outcomes
            .get(index)
            .map(|s| s.as_str())
            .ok_or_else(|| ConcordError::MarketData {
                source_name: "ledger".to_string(),
                message: format!("no outcome with index {index} on bet {}", self.id),
            })
    }

    /// The "yes" outcome label.
    pub fn yes(&self) -> Result<&str, ConcordError> {
        self.get_outcome(0)
    }

    /// The "no" outcome label.
    pub fn no(&self) -> Result<&str, ConcordError> {
        self.get_outcome(1)
    }

    /// Whether an invested position can still be reviewed for selling:
    /// the market must not have entered its opening safety margin.
    pub fn is_ready_to_sell(&self, now: i64, opening_margin: i64) -> bool {
        self.invested_amount() > 0 && now < self.opening_timestamp - opening_margin
    }

    /// Rebet eligibility, guarding against flip-flopping on a market that
    /// already carries a position. `self` holds the *new* prediction,
    /// liquidity, and profit; the arguments hold the previous ones.
    pub fn rebet_allowed(
        &self,
        previous: Option<&PredictionResponse>,
        previous_liquidity: u128,
        previous_profit: i128,
    ) -> bool {
        let previous = match previous {
            // No prior bet: always allowed.
            None => return true,
            Some(previous) => previous,
        };
        let current = match self.last_prediction.as_ref() {
            None => return false,
            Some(current) => current,
        };

        if current.confidence < previous.confidence {
            return false;
        }

        let same_vote = current.vote() == previous.vote();
        if same_vote {
            self.position_liquidity >= previous_liquidity
        } else {
            self.potential_net_profit >= previous_profit
        }
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} | liquidity: {:.2} | invested: {} wei)",
            self.id,
            self.title,
            self.queue_status,
            self.scaled_liquidity,
            self.invested_amount(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
