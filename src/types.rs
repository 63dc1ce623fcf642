//! Shared types for the CONCORD engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that the ledger, pricing,
//! policy, and consensus modules can depend on them without
//! circular references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an agent replica participating in consensus.
pub type ReplicaId = String;

/// Binary markets always have exactly two outcome slots.
pub const BINARY_OUTCOME_COUNT: usize = 2;

/// Number of wei per native collateral unit.
pub const WEI_PER_NATIVE: f64 = 1e18;

/// Convert an amount in wei to native collateral units (for display/logs).
pub fn wei_to_native(wei: u128) -> f64 {
    wei as f64 / WEI_PER_NATIVE
}

/// Convert a signed wei amount to native collateral units.
pub fn wei_to_native_signed(wei: i128) -> f64 {
    wei as f64 / WEI_PER_NATIVE
}

// ---------------------------------------------------------------------------
// Prediction response
// ---------------------------------------------------------------------------

/// Tolerance used when checking that `p_yes + p_no == 1`.
const PROBABILITY_SUM_TOLERANCE: f64 = 1e-9;

/// A prediction tool's answer for a binary market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// Probability of the first ("yes") outcome, in [0, 1].
    pub p_yes: f64,
    /// Probability of the second ("no") outcome, in [0, 1].
    pub p_no: f64,
    /// The tool's self-reported confidence, in [0, 1].
    pub confidence: f64,
    /// How informative the tool judged the available data, in [0, 1].
    pub info_utility: f64,
}

impl PredictionResponse {
    /// Build a response, validating all fields at construction.
    pub fn new(
        p_yes: f64,
        p_no: f64,
        confidence: f64,
        info_utility: f64,
    ) -> Result<Self, ConcordError> {
        let probabilities = [p_yes, p_no, confidence, info_utility];
        if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(ConcordError::InvalidPrediction(format!(
                "all fields must be probabilities in [0, 1]: {probabilities:?}"
            )));
        }
        if (p_yes + p_no - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
            return Err(ConcordError::InvalidPrediction(format!(
                "p_yes + p_no must equal 1, got {}",
                p_yes + p_no
            )));
        }
        Ok(Self {
            p_yes,
            p_no,
            confidence,
            info_utility,
        })
    }

    /// The outcome index the prediction votes for: `Some(0)` for yes,
    /// `Some(1)` for no, `None` on a tie.
    pub fn vote(&self) -> Option<usize> {
        if self.p_yes > self.p_no {
            Some(0)
        } else if self.p_no > self.p_yes {
            Some(1)
        } else {
            None
        }
    }

    /// The probability of the voted outcome winning.
    pub fn win_probability(&self) -> f64 {
        self.p_yes.max(self.p_no)
    }
}

impl fmt::Display for PredictionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p_yes={:.2} p_no={:.2} conf={:.0}% util={:.2}",
            self.p_yes,
            self.p_no,
            self.confidence * 100.0,
            self.info_utility,
        )
    }
}

// ---------------------------------------------------------------------------
// Market snapshot
// ---------------------------------------------------------------------------

/// Freshly fetched market data, as delivered by a market data source.
///
/// This is the input to the bet ledger's upsert; the ledger owns the
/// longer-lived [`crate::bets::Bet`] built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub id: String,
    pub title: String,
    /// On-chain condition identifier used for settlement/redeeming.
    pub condition_id: String,
    pub collateral_token: String,
    /// Pool fee in wei, taken from each bet amount.
    pub fee: u128,
    /// Unix timestamp at which the market opens for resolution.
    pub opening_timestamp: i64,
    /// The two outcome labels, `None` when the source returned malformed data.
    pub outcomes: Option<Vec<String>>,
    /// Two-sided pool token amounts in wei.
    pub outcome_token_amounts: Vec<u128>,
    /// Two-sided marginal prices in [0, 1].
    pub outcome_prices: Vec<f64>,
    /// Liquidity measure scaled to collateral units.
    pub scaled_liquidity: f64,
}

impl fmt::Display for MarketSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (liquidity: {:.2}, opens: {})",
            self.id, self.title, self.scaled_liquidity, self.opening_timestamp,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CONCORD.
#[derive(Debug, thiserror::Error)]
pub enum ConcordError {
    #[error("Consensus error in round {round}: {message}")]
    Consensus { round: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No transition mapped for ({round}, {event})")]
    MissingTransition { round: String, event: String },

    #[error("Missing synchronized data key: {0}")]
    MissingKey(String),

    #[error("Invalid prediction response: {0}")]
    InvalidPrediction(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("No tool available for selection (all quarantined or none registered)")]
    NoToolAvailable,

    #[error("Market data error ({source_name}): {message}")]
    MarketData { source_name: String, message: String },

    #[error("Contract call error: {0}")]
    Contract(String),

    #[error("Insufficient balance: need {needed} wei, have {available} wei")]
    InsufficientBalance { needed: u128, available: u128 },

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ConcordError {
    /// Whether this error must stop the process instead of being handled
    /// by a dedicated round (programmer/configuration errors).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConcordError::Configuration(_) | ConcordError::MissingTransition { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
