//! Constant-product pricing for two-outcome pools.
//!
//! Sizes buys and sells against an `x * y = k` market maker and simulates
//! the resulting pool liquidity. All pool/token amounts are integers in
//! the smallest collateral unit (wei); prices are floats in [0, 1]; every
//! division on the integer path truncates toward zero.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::types::{ConcordError, BINARY_OUTCOME_COUNT};

/// Obtained shares above `available * SLIPPAGE_TOLERANCE` flag the trade
/// as high slippage (a warning, not a rejection).
pub const SLIPPAGE_TOLERANCE: f64 = 1.05;

/// Wei per native unit, as a `Decimal` scaling factor.
const WEI_SCALE: Decimal = dec!(1_000_000_000_000_000_000);

// ---------------------------------------------------------------------------
// Wide integer arithmetic
// ---------------------------------------------------------------------------

/// Full 256-bit product of two `u128` values as `(hi, lo)` limbs.
fn mul_wide(a: u128, b: u128) -> (u128, u128) {
    const MASK: u128 = (1 << 64) - 1;
    let (a_hi, a_lo) = (a >> 64, a & MASK);
    let (b_hi, b_lo) = (b >> 64, b & MASK);

    let ll = a_lo * b_lo;
    let lh = a_lo * b_hi;
    let hl = a_hi * b_lo;
    let hh = a_hi * b_hi;

    let (mid, mid_carry) = lh.overflowing_add(hl);
    let (lo, lo_carry) = ll.overflowing_add((mid & MASK) << 64);
    let hi = hh + (mid >> 64) + ((mid_carry as u128) << 64) + lo_carry as u128;
    (hi, lo)
}

/// `floor(a * b / divisor)` without intermediate overflow.
///
/// The pool invariant `k = amount_yes * amount_no` does not fit in 128
/// bits for realistic wei-denominated pools, so the product is kept as
/// two limbs and divided by bitwise long division.
fn mul_div_floor(a: u128, b: u128, divisor: u128) -> u128 {
    debug_assert!(divisor > 0);
    let (hi, lo) = mul_wide(a, b);
    if hi == 0 {
        return lo / divisor;
    }

    let mut remainder: u128 = 0;
    let mut quotient: u128 = 0;
    for bit in (0..256).rev() {
        let carry = remainder >> 127;
        let next = if bit >= 128 {
            (hi >> (bit - 128)) & 1
        } else {
            (lo >> bit) & 1
        };
        remainder = (remainder << 1) | next;
        if carry == 1 || remainder >= divisor {
            remainder = remainder.wrapping_sub(divisor);
            if bit < 128 {
                quotient |= 1 << bit;
            }
        }
    }
    quotient
}

fn decimal_from_wei(wei: u128) -> Decimal {
    // Amounts above Decimal's range do not occur with 18-decimals
    // collateral; saturate rather than panic if they somehow do.
    Decimal::from_u128(wei).unwrap_or(Decimal::MAX)
}

// ---------------------------------------------------------------------------
// Share estimation (buy side)
// ---------------------------------------------------------------------------

/// Result of sizing a buy against the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareEstimate {
    /// Outcome tokens the trader ends up holding.
    pub num_shares: u128,
    /// Liquidity-based upper bound on sensible share counts.
    pub available_shares: u128,
}

impl ShareEstimate {
    /// Whether the trade exceeds the slippage tolerance.
    pub fn exceeds_slippage(&self) -> bool {
        self.num_shares as f64 > self.available_shares as f64 * SLIPPAGE_TOLERANCE
    }
}

impl fmt::Display for ShareEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shares={} available={} high_slippage={}",
            self.num_shares,
            self.available_shares,
            self.exceeds_slippage(),
        )
    }
}

/// Calculate the claimed shares for a buy. Only valid for binary markets.
///
/// The market trades an equal split of the net bet amount into each of
/// the pool's tokens, then swaps the opposite-outcome tokens back into
/// the selected outcome, preserving `k`.
pub fn calc_binary_shares(
    token_amounts: &[u128],
    prices: &[f64],
    net_bet_amount: u128,
    vote: usize,
) -> Result<ShareEstimate, ConcordError> {
    if token_amounts.len() != BINARY_OUTCOME_COUNT || prices.len() != BINARY_OUTCOME_COUNT {
        return Err(ConcordError::Strategy(format!(
            "binary share calculation needs two-sided pools, got {} amounts / {} prices",
            token_amounts.len(),
            prices.len()
        )));
    }
    if vote >= BINARY_OUTCOME_COUNT {
        return Err(ConcordError::Strategy(format!(
            "vote index {vote} out of range for a binary market"
        )));
    }
    if prices.iter().any(|p| *p <= 0.0) {
        return Err(ConcordError::Strategy(format!(
            "non-positive marginal price in {prices:?}"
        )));
    }

    // bet amount traded into each of the pool's tokens
    let bet_per_token = decimal_from_wei(net_bet_amount) / Decimal::from(BINARY_OUTCOME_COUNT as u32);

    let traded: Vec<u128> = prices
        .iter()
        .map(|price| {
            let price = Decimal::from_f64(*price).unwrap_or(Decimal::ONE);
            (bet_per_token / price).floor().to_u128().unwrap_or(0)
        })
        .collect();

    let selected_shares = traded[vote];
    let other_shares = traded[vote ^ 1];
    let selected_pool = token_amounts[vote];
    let other_pool = token_amounts[vote ^ 1];

    // swap the opposite tokens back, preserving k = x * y
    let remaining_in_pool = mul_div_floor(selected_pool, other_pool, other_pool + other_shares);
    let swapped_shares = selected_pool - remaining_in_pool;
    let num_shares = selected_shares + swapped_shares;

    let price = Decimal::from_f64(prices[vote]).unwrap_or(Decimal::ONE);
    let available_shares = (decimal_from_wei(selected_pool) * price)
        .floor()
        .to_u128()
        .unwrap_or(0);

    debug!(
        traded = ?traded,
        swapped_shares,
        num_shares,
        available_shares,
        "Binary shares sized"
    );

    Ok(ShareEstimate {
        num_shares,
        available_shares,
    })
}

/// Net profit of taking the position: obtained shares minus the net bet
/// amount minus the profit threshold. Profitable iff non-negative.
pub fn potential_net_profit(num_shares: u128, net_bet_amount: u128, bet_threshold: u128) -> i128 {
    num_shares as i128 - net_bet_amount as i128 - bet_threshold as i128
}

/// Strip the pool fee from a bet amount. `fee_wei` is the fee fraction
/// expressed in wei (e.g. 2e16 = 2%).
pub fn remove_fee_fraction(amount: u128, fee_wei: u128) -> u128 {
    let amount = decimal_from_wei(amount);
    let fee = decimal_from_wei(fee_wei) / WEI_SCALE;
    (amount * (Decimal::ONE - fee)).floor().to_u128().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Liquidity simulation
// ---------------------------------------------------------------------------

/// Snapshot of a pool's two-sided token amounts before/after a simulated
/// trade. Intermediate value only — never persisted independently of the
/// owning bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityInfo {
    pub yes_before: u128,
    pub no_before: u128,
    pub yes_after: u128,
    pub no_after: u128,
}

impl LiquidityInfo {
    /// The post-trade pool amounts, yes side first.
    pub fn end_amounts(&self) -> [u128; 2] {
        [self.yes_after, self.no_after]
    }

    /// Marginal prices implied by the post-trade amounts.
    pub fn new_prices(&self) -> [f64; 2] {
        let total = self.yes_after as f64 + self.no_after as f64;
        if total == 0.0 {
            return [0.5, 0.5];
        }
        // a CPMM's marginal price of an outcome is the share of the
        // *other* side in the pool
        [
            self.no_after as f64 / total,
            self.yes_after as f64 / total,
        ]
    }
}

impl fmt::Display for LiquidityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}) -> ({}, {})",
            self.yes_before, self.no_before, self.yes_after, self.no_after,
        )
    }
}

/// Simulate the pool after a bet of `bet_amount` on outcome `vote`,
/// rebalancing the opposite side along `k`.
pub fn new_liquidity(token_amounts: &[u128], bet_amount: u128, vote: usize) -> LiquidityInfo {
    let selected = token_amounts[vote];
    let other = token_amounts[vote ^ 1];
    let new_selected = selected + bet_amount;
    let new_other = mul_div_floor(other, selected, new_selected);

    if vote == 0 {
        LiquidityInfo {
            yes_before: selected,
            no_before: other,
            yes_after: new_selected,
            no_after: new_other,
        }
    } else {
        LiquidityInfo {
            yes_before: other,
            no_before: selected,
            yes_after: new_other,
            no_after: new_selected,
        }
    }
}

// ---------------------------------------------------------------------------
// Sell sizing
// ---------------------------------------------------------------------------

/// Approximate the collateral returned for selling `shares_to_sell`
/// outcome shares, by Newton-Raphson over the fixed-product relation
///
/// `f(r) = (y - R) * (x + a - R) - x * y` with `R = r / (1 - fee)`,
///
/// where `x`/`y` are the selling/other outcome pool amounts and `a` the
/// shares being sold. Returns `None` when the iteration does not
/// converge or the inputs are degenerate.
pub fn sell_amount_in_collateral(
    shares_to_sell: u128,
    token_amounts: &[u128],
    selling_outcome: usize,
    market_fee: f64,
) -> Option<u128> {
    if !(0.0..1.0).contains(&market_fee) {
        return None;
    }
    if token_amounts.len() != BINARY_OUTCOME_COUNT || selling_outcome >= BINARY_OUTCOME_COUNT {
        return None;
    }

    // work in native units so intermediate products stay in Decimal range
    let scale = WEI_SCALE;
    let x = decimal_from_wei(token_amounts[selling_outcome]) / scale;
    let y = decimal_from_wei(token_amounts[selling_outcome ^ 1]) / scale;
    let a = decimal_from_wei(shares_to_sell) / scale;
    let fee_factor = Decimal::ONE - Decimal::from_f64(market_fee)?;

    let f = |r: Decimal| -> Decimal {
        let gross = r / fee_factor;
        (y - gross) * (x + a - gross) - x * y
    };

    let tolerance = Decimal::new(1, 12); // 1e-12 native units
    let mut r = a / Decimal::TWO;
    for _ in 0..100 {
        let value = f(r);
        if value.abs() <= tolerance {
            break;
        }
        // numerical derivative with a step proportional to |r|
        let h = (r.abs() * Decimal::new(1, 12)).max(Decimal::new(1, 18));
        let derivative = (f(r + h) - f(r - h)) / (h * Decimal::TWO);
        if derivative.is_zero() {
            return None;
        }
        let next = r - value / derivative;
        if (next - r).abs() <= tolerance {
            r = next;
            break;
        }
        r = next;
    }

    if f(r).abs() > Decimal::new(1, 6) {
        // did not converge
        return None;
    }
    if r.is_sign_negative() {
        return None;
    }
    (r * scale).round().to_u128()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
