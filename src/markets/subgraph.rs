//! Subgraph-backed market data source.
//!
//! Reference implementation of [`MarketDataSource`] against a
//! Graph-protocol style JSON endpoint serving fixed-product market maker
//! entities. Amounts arrive as decimal strings and are parsed into wei.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{MarketDataSource, MarketFilters, PositionBalances};
use crate::types::{ConcordError, MarketSnapshot};

const SOURCE_NAME: &str = "subgraph";

/// Query returning open fixed-product markets, oldest-opening first.
const MARKETS_QUERY: &str = r#"
query Markets($creators: [Bytes!], $openedAfter: Int!, $first: Int!) {
  fixedProductMarketMakers(
    where: {creator_in: $creators, openingTimestamp_gt: $openedAfter, outcomeSlotCount: 2}
    orderBy: openingTimestamp
    first: $first
  ) {
    id
    title
    conditions { id }
    collateralToken
    fee
    openingTimestamp
    outcomes
    outcomeTokenAmounts
    outcomeTokenMarginalPrices
    scaledLiquidityMeasure
  }
}
"#;

const POSITIONS_QUERY: &str = r#"
query Positions($account: String!) {
  userPositions(where: {user: $account}) {
    position { conditionIds indexSets }
    balance
    marketId
    outcomeIndex
  }
}
"#;

// ---------------------------------------------------------------------------
// Response types (subgraph JSON → Rust)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MarketsData {
    #[serde(rename = "fixedProductMarketMakers")]
    markets: Vec<RawMarket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMarket {
    id: String,
    title: Option<String>,
    #[serde(default)]
    conditions: Vec<RawCondition>,
    collateral_token: Option<String>,
    fee: Option<String>,
    opening_timestamp: Option<String>,
    outcomes: Option<Vec<String>>,
    outcome_token_amounts: Option<Vec<String>>,
    outcome_token_marginal_prices: Option<Vec<String>>,
    scaled_liquidity_measure: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    #[serde(rename = "userPositions")]
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    market_id: String,
    outcome_index: usize,
    balance: String,
}

impl RawMarket {
    /// Convert the raw entity into a snapshot. Fields the subgraph left
    /// null become the snapshot shapes the ledger blacklists on.
    fn into_snapshot(self) -> MarketSnapshot {
        MarketSnapshot {
            condition_id: self
                .conditions
                .first()
                .map(|c| c.id.clone())
                .unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            collateral_token: self.collateral_token.unwrap_or_default(),
            fee: parse_wei(self.fee.as_deref()),
            opening_timestamp: self
                .opening_timestamp
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            outcomes: self.outcomes,
            outcome_token_amounts: self
                .outcome_token_amounts
                .unwrap_or_default()
                .iter()
                .map(|s| s.parse().unwrap_or(0))
                .collect(),
            outcome_prices: self
                .outcome_token_marginal_prices
                .unwrap_or_default()
                .iter()
                .map(|s| s.parse().unwrap_or(0.0))
                .collect(),
            scaled_liquidity: self
                .scaled_liquidity_measure
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            id: self.id,
        }
    }
}

fn parse_wei(raw: Option<&str>) -> u128 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Market data client over a subgraph endpoint.
pub struct SubgraphClient {
    http: Client,
    endpoint: String,
}

impl SubgraphClient {
    pub fn new(endpoint: String) -> Result<Self, ConcordError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("CONCORD/0.1.0 (prediction-market-agent)")
            .build()
            .map_err(|e| ConcordError::MarketData {
                source_name: SOURCE_NAME.to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, endpoint })
    }

    async fn query<T: for<'de> Deserialize<'de>>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, ConcordError> {
        debug!(endpoint = %self.endpoint, "Querying subgraph");
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| transient(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(transient(format!("HTTP {}", response.status())));
        }

        let body: GraphResponse<T> = response
            .json()
            .await
            .map_err(|e| transient(format!("malformed response body: {e}")))?;

        if let Some(errors) = body.errors {
            warn!(?errors, "Subgraph returned errors");
        }
        body.data
            .ok_or_else(|| transient("response carried no data".to_string()))
    }
}

fn transient(message: String) -> ConcordError {
    ConcordError::MarketData {
        source_name: SOURCE_NAME.to_string(),
        message,
    }
}

#[async_trait]
impl MarketDataSource for SubgraphClient {
    async fn fetch_markets(
        &self,
        filters: &MarketFilters,
    ) -> Result<Vec<MarketSnapshot>, ConcordError> {
        let variables = json!({
            "creators": filters.creators,
            "openedAfter": filters.opened_after,
            "first": filters.page_size.max(1),
        });
        let data: MarketsData = self.query(MARKETS_QUERY, variables).await?;
        debug!(count = data.markets.len(), "Markets fetched");
        Ok(data
            .markets
            .into_iter()
            .map(RawMarket::into_snapshot)
            .collect())
    }

    async fn fetch_positions(&self, account: &str) -> Result<PositionBalances, ConcordError> {
        let variables = json!({ "account": account.to_lowercase() });
        let data: PositionsData = self.query(POSITIONS_QUERY, variables).await?;

        let mut balances = PositionBalances::new();
        for position in data.positions {
            let amount: u128 = position.balance.parse().unwrap_or(0);
            if amount == 0 {
                continue;
            }
            balances
                .entry(position.market_id)
                .or_default()
                .push((position.outcome_index, amount));
        }
        Ok(balances)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
