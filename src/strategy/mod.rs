//! Bet-sizing strategies.
//!
//! A closed, statically compiled set of sizing implementations selected
//! by name — never by executing downloaded strategy code. Unknown names
//! are hard configuration errors.

use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::config::TradingConfig;
use crate::types::{wei_to_native, ConcordError, WEI_PER_NATIVE};

/// Everything a sizing strategy may look at.
#[derive(Debug, Clone)]
pub struct SizingInput {
    /// Spendable balance in wei.
    pub bankroll: u128,
    pub win_probability: f64,
    pub confidence: f64,
    /// Pool tokens of the voted outcome, in wei.
    pub selected_type_tokens_in_pool: u128,
    /// Pool tokens of the opposite outcome, in wei.
    pub other_tokens_in_pool: u128,
    /// Pool fee fraction in wei (e.g. 2e16 = 2%).
    pub bet_fee: u128,
}

/// A statically compiled sizing strategy.
#[derive(Debug, Clone)]
pub enum Strategy {
    KellyCriterion(KellyParams),
    BetAmountPerThreshold(ThresholdParams),
}

#[derive(Debug, Clone)]
pub struct KellyParams {
    /// Fraction of the computed Kelly amount actually bet.
    pub bet_kelly_fraction: f64,
    /// Balance in wei always kept out of the bankroll.
    pub floor_balance: u128,
    /// Hard cap on a single bet, in wei.
    pub max_bet: u128,
}

#[derive(Debug, Clone)]
pub struct ThresholdParams {
    /// Confidence floor → bet amount in wei. The largest floor not above
    /// the reported confidence wins; below the lowest floor bets nothing.
    pub amounts: BTreeMap<OrderedConfidence, u128>,
}

/// Confidence floors as map keys, ordered by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedConfidence(pub f64);

impl Eq for OrderedConfidence {}

impl PartialOrd for OrderedConfidence {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedConfidence {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Strategy {
    /// Resolve a strategy by its configured name.
    pub fn by_name(name: &str, config: &TradingConfig) -> Result<Self, ConcordError> {
        match name {
            "kelly_criterion" => Ok(Strategy::KellyCriterion(KellyParams {
                bet_kelly_fraction: config.bet_kelly_fraction,
                floor_balance: config.floor_balance_wei as u128,
                max_bet: config.max_bet_wei as u128,
            })),
            "bet_amount_per_threshold" => {
                let mut amounts = BTreeMap::new();
                for (floor, amount) in &config.threshold_amounts_wei {
                    let floor: f64 = floor.parse().map_err(|_| {
                        ConcordError::Configuration(format!(
                            "invalid confidence floor in threshold_amounts_wei: {floor}"
                        ))
                    })?;
                    amounts.insert(OrderedConfidence(floor), *amount as u128);
                }
                if amounts.is_empty() {
                    return Err(ConcordError::Configuration(
                        "bet_amount_per_threshold needs a non-empty threshold table".to_string(),
                    ));
                }
                Ok(Strategy::BetAmountPerThreshold(ThresholdParams { amounts }))
            }
            unknown => Err(ConcordError::Configuration(format!(
                "unknown bet-sizing strategy: {unknown}"
            ))),
        }
    }

    /// Compute the bet amount in wei. Zero means "do not bet".
    pub fn compute_bet_amount(&self, input: &SizingInput) -> Result<u128, ConcordError> {
        match self {
            Strategy::KellyCriterion(params) => Ok(kelly_bet_amount(params, input)),
            Strategy::BetAmountPerThreshold(params) => {
                Ok(threshold_bet_amount(params, input.confidence))
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::KellyCriterion(_) => write!(f, "kelly_criterion"),
            Strategy::BetAmountPerThreshold(_) => write!(f, "bet_amount_per_threshold"),
        }
    }
}

// ---------------------------------------------------------------------------
// Kelly criterion
// ---------------------------------------------------------------------------

/// Closed-form Kelly amount for a two-pool constant-product market.
///
/// `x`/`y` are the selected/other outcome pool amounts, `p` the win
/// probability, `c` the confidence, `b` the adjusted bankroll and `f`
/// the fee factor (1 - fee), all in native units.
fn calculate_kelly_bet_amount(x: f64, y: f64, p: f64, c: f64, b: f64, f: f64) -> f64 {
    if b == 0.0 {
        return 0.0;
    }
    let pcf = p * c * f;
    let radicand = (4.0 * x * x * y - b * y * y * pcf - 2.0 * b * x * y * pcf - b * x * x * pcf
        + 2.0 * b * y * y * f
        + 2.0 * b * x * y * f)
        .powi(2)
        - 4.0 * (x * x * f - y * y * f)
            * (-4.0 * b * x * y * y * p * c - 4.0 * b * x * x * y * p * c + 4.0 * b * x * y * y);
    if radicand < 0.0 {
        return 0.0;
    }
    let numerator = -4.0 * x * x * y + b * y * y * pcf + 2.0 * b * x * y * pcf + b * x * x * pcf
        - 2.0 * b * y * y * f
        - 2.0 * b * x * y * f
        + radicand.sqrt();
    let denominator = 2.0 * (x * x * f - y * y * f);
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

fn kelly_bet_amount(params: &KellyParams, input: &SizingInput) -> u128 {
    // keep the floor balance out of the bankroll
    let bankroll_adj = input
        .bankroll
        .saturating_sub(params.floor_balance)
        .min(params.max_bet);
    if bankroll_adj == 0 {
        warn!(
            bankroll = input.bankroll,
            floor = params.floor_balance,
            "Bankroll does not cover the floor balance; betting nothing"
        );
        return 0;
    }

    let fee_fraction = 1.0 - wei_to_native(input.bet_fee);
    let kelly = calculate_kelly_bet_amount(
        wei_to_native(input.selected_type_tokens_in_pool),
        wei_to_native(input.other_tokens_in_pool),
        input.win_probability,
        input.confidence,
        wei_to_native(bankroll_adj),
        fee_fraction,
    );
    if kelly <= 0.0 {
        debug!(kelly, "Non-positive Kelly amount; betting nothing");
        return 0;
    }

    let adjusted = kelly * params.bet_kelly_fraction * WEI_PER_NATIVE;
    debug!(
        kelly_native = kelly,
        fraction = params.bet_kelly_fraction,
        "Kelly amount sized"
    );
    adjusted as u128
}

// ---------------------------------------------------------------------------
// Confidence-threshold table
// ---------------------------------------------------------------------------

fn threshold_bet_amount(params: &ThresholdParams, confidence: f64) -> u128 {
    params
        .amounts
        .range(..=OrderedConfidence(confidence))
        .next_back()
        .map(|(_, amount)| *amount)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
