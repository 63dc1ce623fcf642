//! The replica runner — one cooperative task per agent replica.
//!
//! Drives exactly one round at a time on scheduler ticks: execute the
//! local behaviour, broadcast the payload, collect peer payloads, and
//! re-evaluate until quorum (or a deadline) produces an event. The FSM
//! edge taken on that event dictates the next round; terminal rounds map
//! to the cycle outcomes, with the benchmarking-complete state causing a
//! clean process exit.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::behaviours::{self, Collaborators, PipelineContext};
use super::rounds::{self, REDEEM_SUBMITTER};
use super::RoundId;
use crate::config::AppConfig;
use crate::consensus::fsm::FsmSpec;
use crate::consensus::sync_data::keys;
use crate::consensus::{
    PayloadValues, RoundOutcome, RoundSpec, RoundState, SynchronizedData,
};
use crate::markets::TxSettlement;
use crate::policy::EGreedyPolicy;
use crate::storage;
use crate::strategy::Strategy;
use crate::types::{ConcordError, ReplicaId};

/// In-memory payload exchange between replicas of one process.
///
/// The real deployment replaces this with the consensus network's
/// transport; its wire format and signing are out of scope here.
#[derive(Default)]
pub struct QuorumBus {
    inner: Mutex<HashMap<(u64, RoundId), BTreeMap<ReplicaId, PayloadValues>>>,
    anchors: Mutex<HashMap<u64, i64>>,
}

impl QuorumBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The shared behaviour clock of a cycle (first writer wins).
    ///
    /// Behaviours stamp ledger and policy state with "now"; replicas
    /// reading their own wall clocks would diverge on the content hash
    /// at second boundaries, so every replica uses the cycle's anchor —
    /// the in-process stand-in for consensus-synced time.
    pub fn anchor(&self, cycle: u64) -> i64 {
        *self
            .anchors
            .lock()
            .expect("anchor lock")
            .entry(cycle)
            .or_insert_with(|| Utc::now().timestamp())
    }

    pub fn broadcast(
        &self,
        sequence: u64,
        round: RoundId,
        replica: &ReplicaId,
        payload: PayloadValues,
    ) {
        self.inner
            .lock()
            .expect("bus lock")
            .entry((sequence, round))
            .or_default()
            .insert(replica.clone(), payload);
    }

    pub fn collect(&self, sequence: u64, round: RoundId) -> BTreeMap<ReplicaId, PayloadValues> {
        self.inner
            .lock()
            .expect("bus lock")
            .get(&(sequence, round))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop payloads of rounds every replica has moved past.
    pub fn prune_before(&self, sequence: u64) {
        self.inner
            .lock()
            .expect("bus lock")
            .retain(|(seq, _), _| *seq >= sequence);
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A terminal round was reached; the process stays quiescent until
    /// the next external trigger.
    Finished(RoundId),
    /// Benchmarking completed — the hosting process must exit cleanly.
    ExitBenchmarking,
}

/// A single agent replica's decision pipeline.
pub struct ReplicaRunner {
    replica_id: ReplicaId,
    fsm: FsmSpec<RoundId>,
    specs: HashMap<RoundId, RoundSpec<RoundId>>,
    ctx: PipelineContext,
    collaborators: Collaborators,
    bus: Arc<QuorumBus>,
    data: SynchronizedData,
    /// Monotonic round counter; identical across replicas because every
    /// replica takes the same quorum-driven edges.
    round_sequence: u64,
    tick: Duration,
}

impl ReplicaRunner {
    pub fn new(
        replica_id: ReplicaId,
        config: AppConfig,
        collaborators: Collaborators,
        bus: Arc<QuorumBus>,
    ) -> Result<Self, ConcordError> {
        let fsm = super::build_fsm(
            config.consensus.round_timeout_secs as i64,
            config.consensus.redeem_round_timeout_secs as i64,
        )?;
        let specs = rounds::round_specs(
            config.consensus.round_timeout_secs as i64,
            config.consensus.redeem_round_timeout_secs as i64,
        )
        .into_iter()
        .map(|spec| (spec.id, spec))
        .collect();

        let strategy = Strategy::by_name(&config.trading.strategy, &config.trading)?;

        // restore replica-local state from disk, or start fresh
        let ledger = storage::load_bets(&storage::bets_path(&config.agent.data_dir))
            .map_err(|e| ConcordError::Storage(e.to_string()))?
            .unwrap_or_default();
        let policy = storage::load_policy(&storage::policy_path(&config.agent.data_dir))
            .map_err(|e| ConcordError::Storage(e.to_string()))?;
        let policy = match policy {
            Some(policy) => policy,
            None => EGreedyPolicy::new(
                config.policy.epsilon,
                config.policy.consecutive_failures_threshold,
                config.policy.quarantine_duration_secs,
                &config.policy.tools,
            )?,
        };

        let benchmark_rows_left = if config.benchmarking.enabled {
            Some(benchmark_rows(&config))
        } else {
            None
        };

        let tick = Duration::from_secs(config.agent.tick_interval_secs.max(1));
        Ok(Self {
            replica_id,
            fsm,
            specs,
            ctx: PipelineContext {
                config,
                strategy,
                ledger,
                policy,
                pending_tx: None,
                benchmark_rows_left,
                cycle: 0,
            },
            collaborators,
            bus,
            data: SynchronizedData::new(),
            round_sequence: 0,
            tick,
        })
    }

    /// Shorten the scheduler tick (tests and local simulation).
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn ledger(&self) -> &crate::bets::BetLedger {
        &self.ctx.ledger
    }

    pub fn policy(&self) -> &EGreedyPolicy {
        &self.ctx.policy
    }

    pub fn data(&self) -> &SynchronizedData {
        &self.data
    }

    /// Run one full cycle of the pipeline, from the initial round to a
    /// terminal state (including post-settlement routing).
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, ConcordError> {
        self.ctx.cycle += 1;
        // a transaction prepared but never submitted must not leak into
        // this cycle's settlement
        self.ctx.pending_tx = None;
        // keep a generous tail so lagging replicas can still catch up
        self.bus.prune_before(self.round_sequence.saturating_sub(64));
        let mut round = self.fsm.initial;

        loop {
            if self.fsm.is_terminal(round) {
                match self.handle_terminal(round).await? {
                    TerminalAction::Continue(next) => {
                        round = next;
                        continue;
                    }
                    TerminalAction::End(outcome) => {
                        self.persist()?;
                        return Ok(outcome);
                    }
                }
            }

            self.fsm.check_pre_conditions(round, &self.data)?;
            let event = self.run_round(round).await?;
            info!(replica = %self.replica_id, round = %round, %event, "Round concluded");
            round = self.fsm.transition(round, event)?;
        }
    }

    /// Evaluate one round until it produces an event.
    async fn run_round(&mut self, round: RoundId) -> Result<crate::consensus::Event, ConcordError> {
        let spec = self
            .specs
            .get(&round)
            .ok_or_else(|| {
                ConcordError::Configuration(format!("round {round} has no registered spec"))
            })?
            .clone();

        let now = Utc::now().timestamp();
        let quorum = self.ctx.config.consensus.quorum();
        let replica_count = self.ctx.config.consensus.replica_count;
        let mut state = RoundState::new(spec, replica_count, quorum, now);
        let sequence = self.round_sequence;
        self.round_sequence += 1;

        let behaviour_now = self.bus.anchor(self.ctx.cycle);
        let mut submitted = false;
        loop {
            let now = Utc::now().timestamp();

            if !submitted {
                match behaviours::execute(
                    round,
                    &mut self.ctx,
                    &self.collaborators,
                    &self.data,
                    behaviour_now,
                )
                .await
                {
                    Ok(payload) => {
                        self.bus.broadcast(sequence, round, &self.replica_id, payload);
                        submitted = true;
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(ConcordError::NoToolAvailable) => {
                        // zero selectable tools must propagate, never default
                        return Err(ConcordError::NoToolAvailable);
                    }
                    Err(error) => {
                        debug!(replica = %self.replica_id, round = %round, %error,
                            "Behaviour suspended; retrying on the next tick");
                    }
                }
            }

            for (replica, payload) in self.bus.collect(sequence, round) {
                if let Err(error) = state.submit(&replica, payload) {
                    // a malformed or conflicting peer payload must not
                    // take the round down with it
                    warn!(%replica, %error, "Rejected a peer payload");
                }
            }

            match state.process(&self.data) {
                RoundOutcome::Decided { data, event } => {
                    self.data = data;
                    return Ok(event);
                }
                RoundOutcome::Waiting => {
                    if let Some(RoundOutcome::Decided { data, event }) =
                        state.timeout_outcome(&self.data, now)
                    {
                        self.data = data;
                        return Ok(event);
                    }
                    tokio::time::sleep(self.tick).await;
                }
            }
        }
    }

    /// Map a terminal round to the cycle outcome, submitting any
    /// prepared transaction and routing its settlement.
    async fn handle_terminal(
        &mut self,
        round: RoundId,
    ) -> Result<TerminalAction, ConcordError> {
        match round {
            RoundId::FinishedDecision => {
                let submitter = self.data.tx_submitter()?;
                let Some(tx) = self.ctx.pending_tx.take() else {
                    return Ok(TerminalAction::End(CycleOutcome::Finished(round)));
                };
                match self.collaborators.submitter.submit(&[tx]).await? {
                    TxSettlement::Settled { tx_hash } => {
                        info!(replica = %self.replica_id, %tx_hash, %submitter, "Transaction settled");
                        self.data = self.data.update([(
                            keys::FINAL_TX_HASH.to_string(),
                            serde_json::json!(tx_hash),
                        )]);
                        if submitter == REDEEM_SUBMITTER {
                            Ok(TerminalAction::End(CycleOutcome::Finished(round)))
                        } else {
                            Ok(TerminalAction::Continue(RoundId::Redeem))
                        }
                    }
                    TxSettlement::Failed { step, reason } => {
                        warn!(replica = %self.replica_id, %step, %reason, "Transaction failed");
                        Ok(TerminalAction::Continue(RoundId::HandleFailedTx))
                    }
                }
            }
            RoundId::BenchmarkingDone => {
                info!(replica = %self.replica_id, "Benchmarking complete");
                Ok(TerminalAction::End(CycleOutcome::ExitBenchmarking))
            }
            RoundId::Impossible => {
                error!(replica = %self.replica_id, "Reached the impossible round");
                Err(ConcordError::Configuration(
                    "the pipeline reached a state it was never meant to".to_string(),
                ))
            }
            other => Ok(TerminalAction::End(CycleOutcome::Finished(other))),
        }
    }

    fn persist(&self) -> Result<(), ConcordError> {
        let data_dir = &self.ctx.config.agent.data_dir;
        storage::save_bets(&self.ctx.ledger, &storage::bets_path(data_dir))
            .map_err(|e| ConcordError::Storage(e.to_string()))?;
        storage::save_policy(&self.ctx.policy, &storage::policy_path(data_dir))
            .map_err(|e| ConcordError::Storage(e.to_string()))?;
        Ok(())
    }
}

enum TerminalAction {
    Continue(RoundId),
    End(CycleOutcome),
}

/// Number of benchmark rows to consume before reporting completion.
fn benchmark_rows(config: &AppConfig) -> u64 {
    let Some(path) = &config.benchmarking.dataset_path else {
        return 0;
    };
    match std::fs::read_to_string(path) {
        // header line excluded
        Ok(contents) => contents.lines().count().saturating_sub(1) as u64,
        Err(error) => {
            warn!(%error, path = %path, "Benchmark dataset unreadable; nothing to consume");
            0
        }
    }
}
