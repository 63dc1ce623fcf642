//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Anything secret-shaped (API endpoints with keys) is referenced by
//! env-var name in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub consensus: ConsensusConfig,
    pub sampling: SamplingConfig,
    pub policy: PolicyConfig,
    pub trading: TradingConfig,
    pub benchmarking: BenchmarkingConfig,
    pub market_source: MarketSourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Address of the account holding the collateral (the safe).
    pub account: String,
    /// Seconds between scheduler ticks of the replica runner.
    pub tick_interval_secs: u64,
    /// Directory holding the persisted bets and policy blobs.
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsensusConfig {
    /// Number of participating replicas.
    pub replica_count: usize,
    /// Fraction of replicas that must agree before a round concludes.
    /// The byzantine threshold is strictly more than this fraction,
    /// i.e. `floor(n * quorum_fraction) + 1` replicas.
    pub quorum_fraction: f64,
    /// Wall-clock deadline for a round, in seconds.
    pub round_timeout_secs: u64,
    /// Extended deadline for the redeem round, in seconds.
    pub redeem_round_timeout_secs: u64,
    /// Sleep between retries of externally-dependent sub-steps, in seconds.
    pub retry_sleep_secs: u64,
}

impl ConsensusConfig {
    /// Minimum number of identical payloads required to conclude a round.
    pub fn quorum(&self) -> usize {
        (self.replica_count as f64 * self.quorum_fraction).floor() as usize + 1
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    /// Safety margin before a market's opening time, in seconds. Markets
    /// within the margin are expired rather than processed.
    pub opening_margin_secs: i64,
    /// How far into the future a market may open and still be sampled,
    /// in seconds.
    pub sample_window_secs: i64,
    /// Multi-bet mode promotes fresh bets only as a whole cohort.
    pub use_multi_bets_mode: bool,
    /// Whether invested positions are periodically reviewed for selling.
    pub review_bets_for_selling: bool,
    /// Minimum seconds between sell reviews of the same bet.
    pub sell_check_interval_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// The exploration probability of the epsilon-greedy policy.
    pub epsilon: f64,
    /// Consecutive invalid responses before a tool is quarantined.
    pub consecutive_failures_threshold: u32,
    /// How long a quarantined tool stays excluded, in seconds.
    pub quarantine_duration_secs: i64,
    /// Tolerated clock offset when importing remote accuracy data, in seconds.
    pub remote_accuracy_offset_secs: i64,
    /// The statically known prediction tools.
    pub tools: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    /// Name of the statically compiled bet-sizing strategy to use.
    pub strategy: String,
    /// Profit threshold in wei; a bet is profitable only if the potential
    /// net profit covers it.
    pub bet_threshold_wei: u64,
    /// Fraction of the computed Kelly amount to actually bet.
    pub bet_kelly_fraction: f64,
    /// Balance in wei always kept out of the bankroll.
    pub floor_balance_wei: u64,
    /// Hard cap on a single bet, in wei.
    pub max_bet_wei: u64,
    /// Confidence-bucket table for the `bet_amount_per_threshold` strategy:
    /// maps a stringified confidence floor (e.g. "0.7") to a bet amount in wei.
    pub threshold_amounts_wei: HashMap<String, u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BenchmarkingConfig {
    pub enabled: bool,
    /// Dataset of mocked market rows consumed one per cycle.
    pub dataset_path: Option<String>,
    /// Initial two-sided pool used for mocked markets, in wei.
    pub pool_token_amounts_wei: Vec<u64>,
    /// Initial two-sided marginal prices for mocked markets.
    pub pool_prices: Vec<f64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketSourceConfig {
    pub enabled: bool,
    /// Env var holding the subgraph endpoint URL.
    pub endpoint_env: String,
    /// Markets fetched per page.
    pub page_size: u32,
    /// Only markets created by these addresses are tracked.
    pub creators: Vec<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Reject configurations the engine cannot run with.
    fn validate(&self) -> Result<()> {
        if self.consensus.replica_count == 0 {
            anyhow::bail!("consensus.replica_count must be positive");
        }
        if !(0.5..1.0).contains(&self.consensus.quorum_fraction) {
            anyhow::bail!(
                "consensus.quorum_fraction must be in [0.5, 1.0), got {}",
                self.consensus.quorum_fraction
            );
        }
        if !(0.0..=1.0).contains(&self.policy.epsilon) {
            anyhow::bail!("policy.epsilon must be in [0, 1], got {}", self.policy.epsilon);
        }
        if self.policy.tools.is_empty() {
            anyhow::bail!("policy.tools must list at least one prediction tool");
        }
        Ok(())
    }
}
