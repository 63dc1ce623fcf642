//! The quorum-replicated key/value store all rounds read and write.
//!
//! Keys are typed accessors; a round may only update the store by
//! returning a new logical copy, never by mutating a peer's copy.
//! Amounts in wei are stored as decimal strings so that values larger
//! than a JSON number survive the trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::ConcordError;

/// The well-known keys rounds agree on.
pub mod keys {
    pub const BETS_HASH: &str = "bets_hash";
    pub const SAMPLED_BET_INDEX: &str = "sampled_bet_index";
    pub const RANDOMNESS: &str = "randomness";
    pub const MECH_TOOL: &str = "mech_tool";
    pub const POLICY: &str = "policy";
    pub const VOTE: &str = "vote";
    pub const CONFIDENCE: &str = "confidence";
    pub const BET_AMOUNT: &str = "bet_amount";
    pub const IS_PROFITABLE: &str = "is_profitable";
    pub const DECISION_REQUEST_ID: &str = "decision_request_id";
    pub const TX_SUBMITTER: &str = "tx_submitter";
    pub const TX_HASH: &str = "tx_hash";
    pub const FINAL_TX_HASH: &str = "final_tx_hash";
    pub const BENCHMARKING_ENABLED: &str = "benchmarking_enabled";
    pub const SELL_AMOUNT: &str = "sell_amount";
    pub const REDEEMED_AMOUNT: &str = "redeemed_amount";
}

/// The append-only, quorum-replicated store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedData {
    values: BTreeMap<String, Value>,
}

impl SynchronizedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Strict access: absence of the key is an error (a precondition the
    /// populating round was supposed to guarantee).
    pub fn get_strict(&self, key: &str) -> Result<&Value, ConcordError> {
        self.values
            .get(key)
            .ok_or_else(|| ConcordError::MissingKey(key.to_string()))
    }

    /// Produce a new logical copy with the given entries merged in.
    pub fn update(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut values = self.values.clone();
        values.extend(entries);
        Self { values }
    }

    // -- Typed accessors -------------------------------------------------

    pub fn bets_hash(&self) -> Result<String, ConcordError> {
        self.string(keys::BETS_HASH)
    }

    pub fn sampled_bet_index(&self) -> Result<usize, ConcordError> {
        let value = self.get_strict(keys::SAMPLED_BET_INDEX)?;
        value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| type_error(keys::SAMPLED_BET_INDEX, value))
    }

    pub fn randomness(&self) -> Result<String, ConcordError> {
        self.string(keys::RANDOMNESS)
    }

    pub fn mech_tool(&self) -> Result<String, ConcordError> {
        self.string(keys::MECH_TOOL)
    }

    pub fn policy(&self) -> Result<String, ConcordError> {
        self.string(keys::POLICY)
    }

    /// The agreed vote; `Ok(None)` when the stored vote is null (a tie).
    pub fn vote(&self) -> Result<Option<usize>, ConcordError> {
        let value = self.get_strict(keys::VOTE)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| type_error(keys::VOTE, value))
    }

    pub fn decision_request_id(&self) -> Result<String, ConcordError> {
        self.string(keys::DECISION_REQUEST_ID)
    }

    pub fn confidence(&self) -> Result<f64, ConcordError> {
        let value = self.get_strict(keys::CONFIDENCE)?;
        value
            .as_f64()
            .ok_or_else(|| type_error(keys::CONFIDENCE, value))
    }

    /// The agreed bet amount in wei (stored as a decimal string).
    pub fn bet_amount(&self) -> Result<u128, ConcordError> {
        self.wei_amount(keys::BET_AMOUNT)
    }

    pub fn sell_amount(&self) -> Result<u128, ConcordError> {
        self.wei_amount(keys::SELL_AMOUNT)
    }

    pub fn is_profitable(&self) -> Result<bool, ConcordError> {
        let value = self.get_strict(keys::IS_PROFITABLE)?;
        value
            .as_bool()
            .ok_or_else(|| type_error(keys::IS_PROFITABLE, value))
    }

    /// The round that submitted the in-flight transaction.
    pub fn tx_submitter(&self) -> Result<String, ConcordError> {
        self.string(keys::TX_SUBMITTER)
    }

    pub fn tx_hash(&self) -> Result<String, ConcordError> {
        self.string(keys::TX_HASH)
    }

    pub fn final_tx_hash(&self) -> Result<String, ConcordError> {
        self.string(keys::FINAL_TX_HASH)
    }

    pub fn benchmarking_enabled(&self) -> bool {
        self.get(keys::BENCHMARKING_ENABLED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    // -- Helpers ---------------------------------------------------------

    fn string(&self, key: &str) -> Result<String, ConcordError> {
        let value = self.get_strict(key)?;
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| type_error(key, value))
    }

    fn wei_amount(&self, key: &str) -> Result<u128, ConcordError> {
        let value = self.get_strict(key)?;
        let raw = value.as_str().ok_or_else(|| type_error(key, value))?;
        raw.parse::<u128>().map_err(|_| type_error(key, value))
    }
}

fn type_error(key: &str, value: &Value) -> ConcordError {
    ConcordError::Consensus {
        round: "synchronized_data".to_string(),
        message: format!("key {key} holds an unexpected value: {value}"),
    }
}

/// Encode a wei amount for storage.
pub fn wei_value(amount: u128) -> Value {
    Value::String(amount.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
