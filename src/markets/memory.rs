//! In-memory collaborator implementations.
//!
//! Back the local quorum simulation and the tests. Behaviour is
//! programmable per instance so failure paths (transient RPC errors,
//! failed settlements, erroring tools) can be exercised deterministically.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    BalanceInfo, ContractCaller, MarketDataSource, MarketFilters, MechClient, MechResponse,
    PositionBalances, RandomnessSource, TxPayload, TxSettlement, TxSubmitter,
};
use crate::types::{ConcordError, MarketSnapshot, PredictionResponse};

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Serves a fixed snapshot list; optionally fails the first N fetches.
pub struct InMemoryMarketSource {
    snapshots: Vec<MarketSnapshot>,
    positions: Mutex<PositionBalances>,
    failures_left: AtomicU64,
}

impl InMemoryMarketSource {
    pub fn new(snapshots: Vec<MarketSnapshot>) -> Self {
        Self {
            snapshots,
            positions: Mutex::new(HashMap::new()),
            failures_left: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` fetches with a transient error.
    pub fn fail_next(self, n: u64) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_positions(&self, positions: PositionBalances) {
        *self.positions.lock().expect("positions lock") = positions;
    }
}

#[async_trait]
impl MarketDataSource for InMemoryMarketSource {
    async fn fetch_markets(
        &self,
        filters: &MarketFilters,
    ) -> Result<Vec<MarketSnapshot>, ConcordError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(ConcordError::MarketData {
                source_name: self.name().to_string(),
                message: "simulated transient failure".to_string(),
            });
        }
        Ok(self
            .snapshots
            .iter()
            .filter(|s| s.opening_timestamp >= filters.opened_after)
            .cloned()
            .collect())
    }

    async fn fetch_positions(&self, _account: &str) -> Result<PositionBalances, ConcordError> {
        Ok(self.positions.lock().expect("positions lock").clone())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

// ---------------------------------------------------------------------------
// Contract layer
// ---------------------------------------------------------------------------

/// Programmable balances and trade estimates.
pub struct InMemoryContractCaller {
    balance: Mutex<BalanceInfo>,
}

impl InMemoryContractCaller {
    pub fn new(token_balance: u128, native_balance: u128) -> Self {
        Self {
            balance: Mutex::new(BalanceInfo {
                token_balance,
                native_balance,
            }),
        }
    }

    pub fn set_balance(&self, token_balance: u128, native_balance: u128) {
        *self.balance.lock().expect("balance lock") = BalanceInfo {
            token_balance,
            native_balance,
        };
    }
}

#[async_trait]
impl ContractCaller for InMemoryContractCaller {
    async fn estimate_trade(
        &self,
        _pool_address: &str,
        amount: u128,
        _outcome_index: usize,
    ) -> Result<u128, ConcordError> {
        // flat 2:1 share estimate is enough for the simulation
        Ok(amount * 2)
    }

    async fn build_trade_tx(
        &self,
        pool_address: &str,
        amount: u128,
        outcome_index: usize,
    ) -> Result<TxPayload, ConcordError> {
        let digest = Sha256::digest(format!("{pool_address}:{amount}:{outcome_index}"));
        Ok(TxPayload {
            to: pool_address.to_string(),
            data: hex::encode(digest),
            value: amount,
        })
    }

    async fn get_balance(
        &self,
        _token: &str,
        _account: &str,
    ) -> Result<BalanceInfo, ConcordError> {
        Ok(*self.balance.lock().expect("balance lock"))
    }
}

// ---------------------------------------------------------------------------
// Transaction submission
// ---------------------------------------------------------------------------

/// Settles every batch, or fails them in a configured step.
pub struct InMemoryTxSubmitter {
    failing_step: Option<String>,
    submitted: Mutex<Vec<Vec<TxPayload>>>,
}

impl InMemoryTxSubmitter {
    pub fn settling() -> Self {
        Self {
            failing_step: None,
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(step: &str) -> Self {
        Self {
            failing_step: Some(step.to_string()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn submitted_batches(&self) -> usize {
        self.submitted.lock().expect("submitted lock").len()
    }
}

#[async_trait]
impl TxSubmitter for InMemoryTxSubmitter {
    async fn submit(&self, batch: &[TxPayload]) -> Result<TxSettlement, ConcordError> {
        self.submitted
            .lock()
            .expect("submitted lock")
            .push(batch.to_vec());
        if let Some(step) = &self.failing_step {
            return Ok(TxSettlement::Failed {
                step: step.clone(),
                reason: "simulated settlement failure".to_string(),
            });
        }
        let digest = Sha256::digest(format!("{batch:?}"));
        Ok(TxSettlement::Settled {
            tx_hash: format!("0x{}", hex::encode(digest)),
        })
    }
}

// ---------------------------------------------------------------------------
// Prediction tools
// ---------------------------------------------------------------------------

/// Answers every request with a fixed prediction (or error), after a
/// configurable number of pending polls.
pub struct InMemoryMech {
    response: MechResponse,
    pending_polls: AtomicU64,
}

impl InMemoryMech {
    pub fn answering(prediction: PredictionResponse) -> Self {
        Self {
            response: MechResponse {
                result: Some(prediction),
                error: None,
            },
            pending_polls: AtomicU64::new(0),
        }
    }

    pub fn erroring(reason: &str) -> Self {
        Self {
            response: MechResponse {
                result: None,
                error: Some(reason.to_string()),
            },
            pending_polls: AtomicU64::new(0),
        }
    }

    /// Stay pending for the next `n` polls before answering.
    pub fn pending_for(self, n: u64) -> Self {
        self.pending_polls.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl MechClient for InMemoryMech {
    async fn request(&self, tool: &str, question: &str) -> Result<String, ConcordError> {
        let digest = Sha256::digest(format!("{tool}:{question}"));
        Ok(hex::encode(&digest[..8]))
    }

    async fn response(&self, _request_id: &str) -> Result<Option<MechResponse>, ConcordError> {
        if self.pending_polls.load(Ordering::SeqCst) > 0 {
            self.pending_polls.fetch_sub(1, Ordering::SeqCst);
            return Ok(None);
        }
        Ok(Some(self.response.clone()))
    }
}

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

/// Deterministic beacon: the hash of the round number and a fixed seed.
/// Every replica derives the identical value, as a real beacon would
/// provide.
pub struct SeededRandomness {
    seed: String,
}

impl SeededRandomness {
    pub fn new(seed: &str) -> Self {
        Self {
            seed: seed.to_string(),
        }
    }
}

#[async_trait]
impl RandomnessSource for SeededRandomness {
    async fn fetch(&self, round: u64) -> Result<String, ConcordError> {
        let digest = Sha256::digest(format!("{}:{round}", self.seed));
        Ok(hex::encode(digest))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
