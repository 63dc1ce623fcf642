//! The state machine over rounds.
//!
//! Nodes are round types, edges are `(round, event) -> round`. The graph
//! must be total: every event a reachable round can emit must be mapped,
//! or validation fails with a fatal configuration error — an unmapped
//! pair is never silently dropped.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{Event, RoundId, RoundSpec, SynchronizedData};
use crate::types::ConcordError;

/// The full transition graph of a pipeline.
#[derive(Debug, Clone)]
pub struct FsmSpec<R> {
    pub initial: R,
    pub transitions: HashMap<(R, Event), R>,
    pub terminal: HashSet<R>,
    /// Events each non-terminal round can emit.
    pub emittable: HashMap<R, Vec<Event>>,
    /// Synchronized-data keys that must be present when entering a round.
    pub pre_conditions: HashMap<R, Vec<&'static str>>,
    /// Synchronized-data keys a terminal round guarantees.
    pub post_conditions: HashMap<R, Vec<&'static str>>,
}

impl<R: RoundId> FsmSpec<R> {
    /// Build a spec from round specs plus the edge list.
    pub fn new(
        initial: R,
        round_specs: &[RoundSpec<R>],
        transitions: HashMap<(R, Event), R>,
        terminal: HashSet<R>,
    ) -> Self {
        let emittable = round_specs
            .iter()
            .map(|spec| (spec.id, spec.emittable_events()))
            .collect();
        Self {
            initial,
            transitions,
            terminal,
            emittable,
            pre_conditions: HashMap::new(),
            post_conditions: HashMap::new(),
        }
    }

    pub fn with_pre_conditions(mut self, conditions: HashMap<R, Vec<&'static str>>) -> Self {
        self.pre_conditions = conditions;
        self
    }

    pub fn with_post_conditions(mut self, conditions: HashMap<R, Vec<&'static str>>) -> Self {
        self.post_conditions = conditions;
        self
    }

    /// Look up the next round for `(round, event)`. An unmapped pair on a
    /// live round is a fatal configuration error, never a silent drop.
    pub fn transition(&self, round: R, event: Event) -> Result<R, ConcordError> {
        self.transitions.get(&(round, event)).copied().ok_or(
            ConcordError::MissingTransition {
                round: round.to_string(),
                event: event.to_string(),
            },
        )
    }

    pub fn is_terminal(&self, round: R) -> bool {
        self.terminal.contains(&round)
    }

    /// Walk every `(round, event)` pair reachable from the initial round
    /// and fail on the first unmapped one. Also rejects terminal rounds
    /// with outgoing edges.
    pub fn validate(&self) -> Result<(), ConcordError> {
        for round in &self.terminal {
            if self.transitions.keys().any(|(from, _)| from == round) {
                return Err(ConcordError::Configuration(format!(
                    "terminal round {round} must not have outgoing edges"
                )));
            }
        }

        let mut visited: HashSet<R> = HashSet::new();
        let mut queue: VecDeque<R> = VecDeque::new();
        queue.push_back(self.initial);
        visited.insert(self.initial);

        while let Some(round) = queue.pop_front() {
            if self.is_terminal(round) {
                continue;
            }
            let events = self.emittable.get(&round).ok_or_else(|| {
                ConcordError::Configuration(format!(
                    "round {round} is reachable but has no registered spec"
                ))
            })?;
            for event in events {
                let next = self.transition(round, *event)?;
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(())
    }

    /// Check a round's entry preconditions against the synchronized data.
    pub fn check_pre_conditions(
        &self,
        round: R,
        data: &SynchronizedData,
    ) -> Result<(), ConcordError> {
        if let Some(required) = self.pre_conditions.get(&round) {
            for key in required {
                if !data.contains(key) {
                    return Err(ConcordError::Configuration(format!(
                        "round {round} entered without its precondition key {key}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
