//! Contracts to the engine's external collaborators.
//!
//! Blockchain plumbing, market-data services, the prediction "mech",
//! randomness beacons, and transaction submission all live behind these
//! narrow request/response traits. Their internals are out of scope for
//! the core; the in-memory implementations in [`memory`] back the local
//! simulation and the tests, and [`subgraph`] provides one thin HTTP
//! reference client for market data.

pub mod memory;
pub mod subgraph;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::types::{ConcordError, MarketSnapshot, PredictionResponse};

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Filters applied by a market data source.
#[derive(Debug, Clone, Default)]
pub struct MarketFilters {
    /// Only markets created by these addresses.
    pub creators: Vec<String>,
    /// Only markets opening at or after this unix timestamp.
    pub opened_after: i64,
    pub page_size: u32,
}

/// Per-market position balances: bet id → (outcome, amount in wei).
pub type PositionBalances = HashMap<String, Vec<(usize, u128)>>;

/// A source of market snapshots. Fetches must be idempotent per id.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_markets(
        &self,
        filters: &MarketFilters,
    ) -> Result<Vec<MarketSnapshot>, ConcordError>;

    /// The account's open positions, for refreshing ledger investments.
    async fn fetch_positions(&self, account: &str) -> Result<PositionBalances, ConcordError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// On-chain contract layer
// ---------------------------------------------------------------------------

/// One prepared transaction of a submission batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPayload {
    pub to: String,
    /// Hex-encoded calldata.
    pub data: String,
    pub value: u128,
}

/// Token and native balances of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceInfo {
    pub token_balance: u128,
    pub native_balance: u128,
}

/// The narrow contract-call surface the core needs. Any call may fail
/// transiently; callers retry with backoff, never treating the first
/// failure as fatal.
#[async_trait]
pub trait ContractCaller: Send + Sync {
    /// Estimate the outcome tokens received for a trade.
    async fn estimate_trade(
        &self,
        pool_address: &str,
        amount: u128,
        outcome_index: usize,
    ) -> Result<u128, ConcordError>;

    /// Build the calldata funding a trade.
    async fn build_trade_tx(
        &self,
        pool_address: &str,
        amount: u128,
        outcome_index: usize,
    ) -> Result<TxPayload, ConcordError>;

    async fn get_balance(&self, token: &str, account: &str)
        -> Result<BalanceInfo, ConcordError>;
}

// ---------------------------------------------------------------------------
// Transaction submission
// ---------------------------------------------------------------------------

/// The structured result of submitting a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxSettlement {
    Settled { tx_hash: String },
    Failed { step: String, reason: String },
}

/// Accepts a batch of prepared transactions. Atomicity across a batch is
/// never assumed unless the submitter guarantees it.
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn submit(&self, batch: &[TxPayload]) -> Result<TxSettlement, ConcordError>;
}

// ---------------------------------------------------------------------------
// Prediction tools ("mech")
// ---------------------------------------------------------------------------

/// A tool's answer, or the reason there is none.
#[derive(Debug, Clone)]
pub struct MechResponse {
    pub result: Option<PredictionResponse>,
    pub error: Option<String>,
}

/// The prediction-request service behind the selection policy.
#[async_trait]
pub trait MechClient: Send + Sync {
    /// Send a prediction request; returns a request id to poll with.
    async fn request(&self, tool: &str, question: &str) -> Result<String, ConcordError>;

    /// Poll for a response; `None` while the request is still pending.
    async fn response(&self, request_id: &str) -> Result<Option<MechResponse>, ConcordError>;
}

// ---------------------------------------------------------------------------
// Randomness beacon
// ---------------------------------------------------------------------------

/// Source of the per-cycle randomness all replicas agree on.
#[async_trait]
pub trait RandomnessSource: Send + Sync {
    async fn fetch(&self, round: u64) -> Result<String, ConcordError>;
}

// ---------------------------------------------------------------------------
// Retry helper
// ---------------------------------------------------------------------------

/// Retry a transient-failure-prone call with a fixed sleep between
/// attempts. The caller's round deadline bounds the overall wait.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    sleep: Duration,
    mut call: F,
) -> Result<T, ConcordError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ConcordError>>,
{
    let mut last_error = None;
    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                warn!(attempt, %error, "Collaborator call failed; retrying");
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ConcordError::Contract("no attempts made".to_string())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
