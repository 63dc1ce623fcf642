//! The bet ledger — the persisted collection of tracked markets.
//!
//! The ledger is rebuilt from the latest market snapshot each cycle,
//! carrying forward in-flight state by id. Consensus rounds never agree
//! on the ledger itself, only on the content hash of its persisted form
//! (see [`crate::storage`]).

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{Bet, QueueStatus};
use crate::types::{ConcordError, MarketSnapshot};

/// Either side trading at or above this price signals a resolved market.
const RESOLVED_PRICE: f64 = 0.99;

/// The persisted collection of tracked bets, keyed by id. The persisted
/// form is the plain bet list; `serialize`/`deserialize` below define it.
#[derive(Debug, Clone, Default)]
pub struct BetLedger {
    bets: Vec<Bet>,
    /// Snapshot of a bet taken by `begin_trial`, restored on rollback.
    trial: Option<(usize, Bet)>,
}

impl BetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bets(bets: Vec<Bet>) -> Self {
        Self { bets, trial: None }
    }

    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn len(&self) -> usize {
        self.bets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Bet> {
        self.bets.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Bet> {
        self.bets.get_mut(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.bets.iter().position(|bet| bet.id == id)
    }

    /// Serialize the full collection. The sha256 of this string is what
    /// consensus rounds agree on.
    pub fn serialize(&self) -> Result<String, ConcordError> {
        serde_json::to_string(&self.bets)
            .map_err(|e| ConcordError::Storage(format!("failed to serialize bets: {e}")))
    }

    pub fn deserialize(raw: &str) -> Result<Self, ConcordError> {
        let bets: Vec<Bet> = serde_json::from_str(raw)
            .map_err(|e| ConcordError::Storage(format!("failed to parse bets: {e}")))?;
        Ok(Self::from_bets(bets))
    }

    // -- Snapshot merging ------------------------------------------------

    /// Merge freshly fetched market data into the collection by id.
    ///
    /// A permanently blacklisted entry is never overwritten by fresh
    /// market data, so a market cannot be un-blacklisted by a re-fetch.
    pub fn upsert(&mut self, snapshots: Vec<MarketSnapshot>) {
        let mut added = 0usize;
        let mut updated = 0usize;
        for snapshot in snapshots {
            match self.index_of(&snapshot.id) {
                Some(index) => {
                    let bet = &mut self.bets[index];
                    if bet.is_blacklisted_forever() {
                        debug!(bet_id = %bet.id, "Skipping update of blacklisted bet");
                        continue;
                    }
                    bet.update_market_info(&snapshot);
                    updated += 1;
                }
                None => {
                    self.bets.push(Bet::from_snapshot(snapshot));
                    added += 1;
                }
            }
        }
        info!(added, updated, total = self.bets.len(), "Ledger upsert complete");
    }

    // -- Lifecycle sweeps ------------------------------------------------

    /// Promote `Fresh → ToProcess`.
    ///
    /// In single-bet mode each fresh bet is promoted individually; in
    /// multi-bet mode the promotion happens only when *all* non-expired
    /// bets are simultaneously fresh, keeping the cohort synchronized.
    pub fn sweep_freshness(&mut self, multi_bet_mode: bool) {
        if !multi_bet_mode {
            for bet in &mut self.bets {
                if bet.queue_status.is_fresh() {
                    bet.queue_status = bet.queue_status.move_to_process();
                }
            }
            return;
        }

        let all_fresh = self
            .bets
            .iter()
            .filter(|bet| !bet.queue_status.is_expired())
            .all(|bet| bet.queue_status.is_fresh());

        if all_fresh {
            for bet in &mut self.bets {
                bet.queue_status = bet.queue_status.move_to_process();
            }
        }
    }

    /// Re-queue every forcible bet back to `Fresh`.
    pub fn requeue_all(&mut self) {
        for bet in &mut self.bets {
            bet.queue_status = bet.queue_status.move_to_fresh();
        }
    }

    /// Permanently expire any bet whose opening time is within `margin`
    /// of `now`, or whose two-sided price already signals a resolved
    /// market (either side at or above 0.99).
    pub fn blacklist_expired(&mut self, now: i64, margin: i64) {
        for bet in &mut self.bets {
            if bet.is_blacklisted_forever() {
                continue;
            }
            if now >= bet.opening_timestamp - margin {
                info!(bet_id = %bet.id, "Blacklisting bet inside the opening margin");
                bet.blacklist_forever();
                continue;
            }
            if bet.outcome_prices.iter().any(|p| *p >= RESOLVED_PRICE) {
                info!(
                    bet_id = %bet.id,
                    prices = ?bet.outcome_prices,
                    "Blacklisting bet with resolved-looking prices"
                );
                bet.blacklist_forever();
            }
        }
    }

    /// Queue invested, still-tradable positions for a sell review,
    /// honouring the per-bet sell-check interval.
    pub fn requeue_for_selling(&mut self, now: i64, opening_margin: i64, check_interval: i64) {
        for bet in &mut self.bets {
            let since_last_check = now - bet.last_sell_check;
            if bet.is_ready_to_sell(now, opening_margin)
                && !bet.queue_status.is_expired()
                && (bet.last_sell_check == 0 || since_last_check > check_interval)
            {
                info!(
                    bet_id = %bet.id,
                    invested = bet.invested_amount(),
                    "Queueing bet for a sell review"
                );
                bet.queue_status = bet.queue_status.move_to_check_for_selling();
                bet.last_sell_check = now;
            }
        }
    }

    /// Resolve queued sell reviews: positions still worth selling move to
    /// `SelectedForSelling`, the rest drop back to `Reprocessed`.
    pub fn review_for_selling(&mut self, now: i64, opening_margin: i64) {
        for bet in &mut self.bets {
            if bet.queue_status != QueueStatus::CheckForSelling {
                continue;
            }
            if bet.is_ready_to_sell(now, opening_margin) {
                bet.queue_status = bet.queue_status.move_to_selected_for_selling();
            } else {
                bet.queue_status = bet.queue_status.next_status();
            }
        }
    }

    /// Rebuild per-outcome investment lists from fetched balances. A bet
    /// absent from the balances no longer has a position and is reset.
    pub fn update_investments(&mut self, balances: &HashMap<String, Vec<(usize, u128)>>) {
        for bet in &mut self.bets {
            if bet.queue_status.is_expired() {
                continue;
            }
            bet.reset_investments();
            let Some(bet_balances) = balances.get(&bet.id) else {
                continue;
            };
            for (outcome, amount) in bet_balances {
                bet.append_investment(*outcome, *amount);
            }
        }
    }

    // -- Sampling --------------------------------------------------------

    /// Select exactly one processable bet, or `None` when no eligible bet
    /// with non-zero liquidity exists (no decision this cycle — not an
    /// error, and it must not block the pipeline).
    ///
    /// Total order: sell-selected positions first, then the non-empty
    /// bucket in priority `ToProcess > Processed > Reprocessed`; within a
    /// bucket, descending by (invested amount, least-recently processed,
    /// scaled liquidity, opening timestamp).
    pub fn sample(&self, now: i64, opening_margin: i64, sample_window: i64) -> Option<usize> {
        let candidates: Vec<usize> = self
            .bets
            .iter()
            .enumerate()
            .filter(|(_, bet)| {
                let until_opening = bet.opening_timestamp - now;
                bet.queue_status.is_processable()
                    && !bet.is_blacklisted_forever()
                    && bet.scaled_liquidity > 0.0
                    && until_opening > opening_margin
                    && until_opening <= sample_window
            })
            .map(|(index, _)| index)
            .collect();

        if candidates.is_empty() {
            warn!("No processable bets with non-zero liquidity to sample from");
            return None;
        }

        let bucket_priority = [
            QueueStatus::SelectedForSelling,
            QueueStatus::ToProcess,
            QueueStatus::Processed,
            QueueStatus::Reprocessed,
        ];

        for status in bucket_priority {
            let mut bucket: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&index| self.bets[index].queue_status == status)
                .collect();
            if bucket.is_empty() {
                continue;
            }
            bucket.sort_by(|&a, &b| {
                let (a, b) = (&self.bets[a], &self.bets[b]);
                b.invested_amount()
                    .cmp(&a.invested_amount())
                    // least recently processed first
                    .then(a.processed_timestamp.cmp(&b.processed_timestamp))
                    .then(
                        b.scaled_liquidity
                            .partial_cmp(&a.scaled_liquidity)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(b.opening_timestamp.cmp(&a.opening_timestamp))
            });
            return bucket.first().copied();
        }

        None
    }

    /// Mark a sampled bet as taken for processing this cycle.
    ///
    /// A sell-selected bet keeps its status: the decision round needs it
    /// to route to the sell leg, which completes the transition itself.
    pub fn mark_sampled(&mut self, index: usize, now: i64) {
        if let Some(bet) = self.bets.get_mut(index) {
            if bet.queue_status != QueueStatus::SelectedForSelling {
                bet.queue_status = bet.queue_status.next_status();
            }
            bet.processed_timestamp = now;
            bet.n_bets += 1;
            debug!(bet_id = %bet.id, status = %bet.queue_status, "Bet sampled");
        }
    }

    // -- Trial mutations -------------------------------------------------

    /// Snapshot a bet before trial mutations (e.g. the rebet guard).
    /// A later `rollback_trial` restores it; `commit_trial` keeps it.
    pub fn begin_trial(&mut self, index: usize) {
        if let Some(bet) = self.bets.get(index) {
            self.trial = Some((index, bet.clone()));
        }
    }

    /// Undo the trial mutations of the snapshotted bet.
    pub fn rollback_trial(&mut self) {
        if let Some((index, bet)) = self.trial.take() {
            debug!(bet_id = %bet.id, "Rolling back trial ledger mutation");
            self.bets[index] = bet;
        }
    }

    /// Keep the trial mutations.
    pub fn commit_trial(&mut self) {
        self.trial = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PredictionResponse;

    const NOW: i64 = 1_900_000_000;
    const MARGIN: i64 = 300;
    const WINDOW: i64 = 200_000_000;

    fn snapshot(id: &str, liquidity: f64) -> MarketSnapshot {
        MarketSnapshot {
            id: id.to_string(),
            title: format!("Market {id}"),
            condition_id: format!("0xcond-{id}"),
            collateral_token: "0xtoken".to_string(),
            fee: 0,
            opening_timestamp: 2_000_000_000,
            outcomes: Some(vec!["Yes".to_string(), "No".to_string()]),
            outcome_token_amounts: vec![100, 100],
            outcome_prices: vec![0.5, 0.5],
            scaled_liquidity: liquidity,
        }
    }

    fn ledger_with(ids: &[&str]) -> BetLedger {
        let mut ledger = BetLedger::new();
        ledger.upsert(ids.iter().map(|id| snapshot(id, 10.0)).collect());
        ledger
    }

    // -- Upsert tests --

    #[test]
    fn test_upsert_adds_and_updates() {
        let mut ledger = ledger_with(&["a", "b"]);
        assert_eq!(ledger.len(), 2);

        let mut updated = snapshot("a", 50.0);
        updated.outcome_prices = vec![0.7, 0.3];
        ledger.upsert(vec![updated, snapshot("c", 10.0)]);

        assert_eq!(ledger.len(), 3);
        let a = &ledger.bets()[ledger.index_of("a").unwrap()];
        assert!((a.scaled_liquidity - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_upsert_never_unblacklists() {
        let mut ledger = ledger_with(&["a"]);
        ledger.get_mut(0).unwrap().blacklist_forever();

        ledger.upsert(vec![snapshot("a", 100.0)]);
        let a = ledger.get(0).unwrap();
        assert!(a.is_blacklisted_forever());
        assert_eq!(a.queue_status, QueueStatus::Expired);
    }

    // -- Freshness sweep tests --

    #[test]
    fn test_sweep_single_bet_mode() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(1).unwrap().queue_status = QueueStatus::Processed;

        ledger.sweep_freshness(false);
        assert_eq!(ledger.get(0).unwrap().queue_status, QueueStatus::ToProcess);
        assert_eq!(ledger.get(1).unwrap().queue_status, QueueStatus::Processed);
    }

    #[test]
    fn test_sweep_multi_bet_mode_waits_for_cohort() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(1).unwrap().queue_status = QueueStatus::Processed;

        // one bet is not fresh — nothing moves
        ledger.sweep_freshness(true);
        assert_eq!(ledger.get(0).unwrap().queue_status, QueueStatus::Fresh);

        // whole (non-expired) cohort fresh — everything moves
        ledger.get_mut(1).unwrap().queue_status = QueueStatus::Fresh;
        ledger.sweep_freshness(true);
        assert_eq!(ledger.get(0).unwrap().queue_status, QueueStatus::ToProcess);
        assert_eq!(ledger.get(1).unwrap().queue_status, QueueStatus::ToProcess);
    }

    #[test]
    fn test_sweep_multi_bet_mode_ignores_expired() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(1).unwrap().queue_status = QueueStatus::Expired;

        ledger.sweep_freshness(true);
        assert_eq!(ledger.get(0).unwrap().queue_status, QueueStatus::ToProcess);
        assert_eq!(ledger.get(1).unwrap().queue_status, QueueStatus::Expired);
    }

    // -- Expiry blacklisting tests --

    #[test]
    fn test_blacklist_expired_by_opening_time() {
        let mut ledger = ledger_with(&["a"]);
        let opening = ledger.get(0).unwrap().opening_timestamp;

        ledger.blacklist_expired(opening - 100, MARGIN);
        assert!(ledger.get(0).unwrap().is_blacklisted_forever());
    }

    #[test]
    fn test_blacklist_resolved_prices_far_from_opening() {
        let mut ledger = ledger_with(&["a"]);
        ledger.get_mut(0).unwrap().outcome_prices = vec![0.995, 0.005];

        // opening time is far in the future, prices alone trigger it
        ledger.blacklist_expired(NOW, MARGIN);
        assert!(ledger.get(0).unwrap().is_blacklisted_forever());
    }

    #[test]
    fn test_blacklist_leaves_healthy_bets() {
        let mut ledger = ledger_with(&["a"]);
        ledger.blacklist_expired(NOW, MARGIN);
        assert!(!ledger.get(0).unwrap().is_blacklisted_forever());
    }

    // -- Sampling tests --

    #[test]
    fn test_sample_empty_ledger() {
        let ledger = BetLedger::new();
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), None);
    }

    #[test]
    fn test_sample_skips_fresh_and_expired() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(1).unwrap().blacklist_forever();
        // "a" is Fresh — not processable yet
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), None);

        ledger.sweep_freshness(false);
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), Some(0));
    }

    #[test]
    fn test_sample_blacklisted_never_selected() {
        let mut ledger = ledger_with(&["a"]);
        ledger.sweep_freshness(false);
        ledger.get_mut(0).unwrap().blacklist_forever();
        assert!(ledger.get(0).unwrap().outcomes.is_none());
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), None);
    }

    #[test]
    fn test_sample_is_deterministic() {
        let mut ledger = ledger_with(&["a", "b", "c"]);
        ledger.sweep_freshness(false);
        let first = ledger.sample(NOW, MARGIN, WINDOW);
        for _ in 0..5 {
            assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), first);
        }
    }

    #[test]
    fn test_sample_bucket_priority() {
        let mut ledger = ledger_with(&["to-process", "processed", "reprocessed"]);
        ledger.get_mut(0).unwrap().queue_status = QueueStatus::ToProcess;
        ledger.get_mut(1).unwrap().queue_status = QueueStatus::Processed;
        ledger.get_mut(2).unwrap().queue_status = QueueStatus::Reprocessed;

        // bump the lower-priority buckets' sort keys to prove the bucket wins
        ledger.get_mut(1).unwrap().scaled_liquidity = 1_000.0;
        ledger.get_mut(2).unwrap().append_investment(0, 1_000_000);

        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), Some(0));
    }

    #[test]
    fn test_sample_sell_selected_preempts() {
        let mut ledger = ledger_with(&["buy", "sell"]);
        ledger.get_mut(0).unwrap().queue_status = QueueStatus::ToProcess;
        ledger.get_mut(1).unwrap().queue_status = QueueStatus::SelectedForSelling;
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), Some(1));
    }

    #[test]
    fn test_sample_in_bucket_ordering() {
        let mut ledger = ledger_with(&["a", "b", "c"]);
        for index in 0..3 {
            ledger.get_mut(index).unwrap().queue_status = QueueStatus::Processed;
        }
        // "b" has the largest investment — wins over liquidity
        ledger.get_mut(1).unwrap().append_investment(0, 500);
        ledger.get_mut(2).unwrap().scaled_liquidity = 9_999.0;

        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), Some(1));

        // with equal investments, the least recently processed wins
        ledger.get_mut(1).unwrap().reset_investments();
        ledger.get_mut(0).unwrap().processed_timestamp = 100;
        ledger.get_mut(1).unwrap().processed_timestamp = 50;
        ledger.get_mut(2).unwrap().processed_timestamp = 50;
        ledger.get_mut(2).unwrap().scaled_liquidity = 10.0;
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), Some(1));
    }

    #[test]
    fn test_sample_respects_opening_window() {
        let mut ledger = ledger_with(&["near", "far"]);
        ledger.sweep_freshness(false);
        // opens within the margin
        ledger.get_mut(0).unwrap().opening_timestamp = NOW + 100;
        // opens beyond the sampling window
        ledger.get_mut(1).unwrap().opening_timestamp = NOW + WINDOW + 1;
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), None);
    }

    #[test]
    fn test_sample_all_illiquid_returns_none() {
        let mut ledger = ledger_with(&["a"]);
        ledger.sweep_freshness(false);
        ledger.get_mut(0).unwrap().scaled_liquidity = 0.0;
        assert_eq!(ledger.sample(NOW, MARGIN, WINDOW), None);
    }

    #[test]
    fn test_mark_sampled() {
        let mut ledger = ledger_with(&["a"]);
        ledger.sweep_freshness(false);
        let index = ledger.sample(NOW, MARGIN, WINDOW).unwrap();
        ledger.mark_sampled(index, NOW);

        let bet = ledger.get(index).unwrap();
        assert_eq!(bet.queue_status, QueueStatus::Processed);
        assert_eq!(bet.processed_timestamp, NOW);
        assert_eq!(bet.n_bets, 1);
    }

    // -- Sell queue tests --

    #[test]
    fn test_requeue_and_review_for_selling() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(0).unwrap().append_investment(0, 100);

        ledger.requeue_for_selling(NOW, MARGIN, 3600);
        assert_eq!(
            ledger.get(0).unwrap().queue_status,
            QueueStatus::CheckForSelling
        );
        // no position — untouched
        assert_eq!(ledger.get(1).unwrap().queue_status, QueueStatus::Fresh);

        // within the check interval nothing is re-queued again
        ledger.get_mut(0).unwrap().queue_status = QueueStatus::Reprocessed;
        ledger.requeue_for_selling(NOW + 10, MARGIN, 3600);
        assert_eq!(
            ledger.get(0).unwrap().queue_status,
            QueueStatus::Reprocessed
        );

        ledger.get_mut(0).unwrap().queue_status = QueueStatus::CheckForSelling;
        ledger.review_for_selling(NOW, MARGIN);
        assert_eq!(
            ledger.get(0).unwrap().queue_status,
            QueueStatus::SelectedForSelling
        );

        // sampling must not consume the sell selection
        ledger.mark_sampled(0, NOW);
        assert_eq!(
            ledger.get(0).unwrap().queue_status,
            QueueStatus::SelectedForSelling
        );
    }

    // -- Investment refresh tests --

    #[test]
    fn test_update_investments() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(1).unwrap().blacklist_forever();

        let mut balances = HashMap::new();
        balances.insert("a".to_string(), vec![(0, 70u128), (1, 30u128)]);
        balances.insert("b".to_string(), vec![(0, 10u128)]);
        ledger.update_investments(&balances);

        assert_eq!(ledger.get(0).unwrap().invested_amount_for(0), 70);
        assert_eq!(ledger.get(0).unwrap().invested_amount_for(1), 30);
        // expired bets are not refreshed
        assert_eq!(ledger.get(1).unwrap().invested_amount(), 0);

        // a position that disappeared from the balances is reset
        ledger.update_investments(&HashMap::new());
        assert_eq!(ledger.get(0).unwrap().invested_amount(), 0);
    }

    // -- Trial rollback tests --

    #[test]
    fn test_trial_rollback_restores_bet() {
        let mut ledger = ledger_with(&["a"]);
        ledger.begin_trial(0);

        let bet = ledger.get_mut(0).unwrap();
        bet.last_prediction = Some(PredictionResponse::new(0.8, 0.2, 0.9, 0.1).unwrap());
        bet.potential_net_profit = 123;

        ledger.rollback_trial();
        let bet = ledger.get(0).unwrap();
        assert!(bet.last_prediction.is_none());
        assert_eq!(bet.potential_net_profit, 0);
    }

    #[test]
    fn test_trial_commit_keeps_bet() {
        let mut ledger = ledger_with(&["a"]);
        ledger.begin_trial(0);
        ledger.get_mut(0).unwrap().potential_net_profit = 123;
        ledger.commit_trial();
        ledger.rollback_trial(); // no-op after commit
        assert_eq!(ledger.get(0).unwrap().potential_net_profit, 123);
    }

    // -- Serialization tests --

    #[test]
    fn test_ledger_serialization_roundtrip() {
        let mut ledger = ledger_with(&["a", "b"]);
        ledger.get_mut(0).unwrap().append_investment(1, 42);
        let raw = ledger.serialize().unwrap();
        let parsed = BetLedger::deserialize(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(0).unwrap().invested_amount_for(1), 42);
    }
}
