//! Drain barrier for one active configuration.
//!
//! The [`Drainer`] tracks every blob through
//! `Running -> DrainRequested -> Draining -> Drained`. Drains start at the
//! source blobs of the [`BlobGraph`] and move downstream: a blob is only
//! requested once all its upstream blobs have drained, so everything they
//! produced has been delivered before it quiesces. Blobs on a feedback loop
//! never see that happen and are requested together. The cycle completes,
//! once, when every blob has drained.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use sl_config::{BlobSpecifier, PartitionParameter};
use sl_types::{construction_error, ConfigError, DrainError, StreamGraph, Token};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ----- Blob graph -----

/// Identifier of the blob built from `spec`: its smallest input token.
pub fn blob_id(spec: &BlobSpecifier, graph: &StreamGraph) -> Result<Token, ConfigError> {
    graph
        .boundary_tokens(spec.worker_identifiers())
        .inputs
        .first()
        .copied()
        .ok_or_else(|| construction_error!("blob over {:?} has no inputs", spec.worker_identifiers()))
}

/// Blobs of a partition and the edges between them.
#[derive(Debug, Clone, Default)]
pub struct BlobGraph {
    machines: BTreeMap<Token, usize>,
    successors: BTreeMap<Token, BTreeSet<Token>>,
    predecessors: BTreeMap<Token, BTreeSet<Token>>,
}

impl BlobGraph {
    pub fn new(partition: &PartitionParameter, graph: &StreamGraph) -> Result<Self, ConfigError> {
        let mut machines = BTreeMap::new();
        let mut producers = BTreeMap::new();
        let mut consumers = Vec::new();
        for spec in partition.blobs() {
            spec.workers(graph)?;
            let id = blob_id(spec, graph)?;
            let boundary = graph.boundary_tokens(spec.worker_identifiers());
            machines.insert(id, spec.machine());
            for token in boundary.outputs {
                producers.insert(token, id);
            }
            consumers.extend(boundary.inputs.into_iter().map(|token| (token, id)));
        }
        let edges = consumers
            .into_iter()
            .filter_map(|(token, to)| producers.get(&token).map(|&from| (from, to)));
        Ok(Self::from_parts(machines, edges))
    }

    fn from_parts(
        machines: BTreeMap<Token, usize>,
        edges: impl IntoIterator<Item = (Token, Token)>,
    ) -> Self {
        let mut successors: BTreeMap<Token, BTreeSet<Token>> =
            machines.keys().map(|&id| (id, BTreeSet::new())).collect();
        let mut predecessors = successors.clone();
        for (from, to) in edges {
            if from == to {
                continue;
            }
            successors.entry(from).or_default().insert(to);
            predecessors.entry(to).or_default().insert(from);
        }
        Self {
            machines,
            successors,
            predecessors,
        }
    }

    pub fn blobs(&self) -> impl Iterator<Item = Token> + '_ {
        self.machines.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn contains(&self, blob: &Token) -> bool {
        self.machines.contains_key(blob)
    }

    /// The machine the blob is placed on.
    pub fn machine(&self, blob: &Token) -> Option<usize> {
        self.machines.get(blob).copied()
    }

    pub fn successors(&self, blob: &Token) -> impl Iterator<Item = &Token> {
        self.successors.get(blob).into_iter().flatten()
    }

    pub fn predecessors(&self, blob: &Token) -> impl Iterator<Item = &Token> {
        self.predecessors.get(blob).into_iter().flatten()
    }

    /// Blobs fed only from outside the graph.
    pub fn sources(&self) -> Vec<Token> {
        self.predecessors
            .iter()
            .filter(|(_, preds)| preds.is_empty())
            .map(|(&id, _)| id)
            .collect()
    }
}

// ----- Events and cycles -----

/// Drain state of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobDrainState {
    Running,
    DrainRequested,
    Draining,
    Drained,
}

/// Progress notifications published to an optional observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainEvent {
    Requested { cycle: Uuid, blob: Token },
    Draining { cycle: Uuid, blob: Token },
    Drained { cycle: Uuid, blob: Token },
    AllDrained { cycle: Uuid, is_final: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainCycleStatus {
    Running,
    Completed,
    Failed,
}

/// Record of one drain cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainCycle {
    pub id: Uuid,
    pub is_final: bool,
    pub status: DrainCycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DrainCycle {
    pub fn new(is_final: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            is_final,
            status: DrainCycleStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = DrainCycleStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = DrainCycleStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }
}

// ----- Drainer -----

/// Per-configuration drain state machine.
pub struct Drainer {
    graph: BlobGraph,
    states: BTreeMap<Token, BlobDrainState>,
    cycle: Option<DrainCycle>,
    events: Option<Sender<DrainEvent>>,
}

impl Drainer {
    pub fn new(graph: BlobGraph) -> Self {
        let states = graph.blobs().map(|id| (id, BlobDrainState::Running)).collect();
        Self {
            graph,
            states,
            cycle: None,
            events: None,
        }
    }

    pub fn with_observer(mut self, events: Sender<DrainEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn graph(&self) -> &BlobGraph {
        &self.graph
    }

    pub fn state(&self, blob: &Token) -> Option<BlobDrainState> {
        self.states.get(blob).copied()
    }

    pub fn cycle(&self) -> Option<&DrainCycle> {
        self.cycle.as_ref()
    }

    /// Blobs that have not reported drained.
    pub fn pending(&self) -> Vec<Token> {
        self.states
            .iter()
            .filter(|(_, &state)| state != BlobDrainState::Drained)
            .map(|(&id, _)| id)
            .collect()
    }

    /// True once every blob has drained in the current cycle.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.cycle.as_ref().map(|c| c.status),
            Some(DrainCycleStatus::Completed)
        )
    }

    /// Starts a cycle and returns the blobs to request first.
    pub fn start(&mut self, is_final: bool) -> Result<Vec<Token>, DrainError> {
        if let Some(cycle) = &self.cycle {
            return Err(match cycle.status {
                DrainCycleStatus::Running => DrainError::AlreadyDraining,
                _ => DrainError::NotRunning,
            });
        }
        let cycle = DrainCycle::new(is_final);
        info!(cycle = %cycle.id, is_final, blobs = self.graph.len(), "drain cycle started");
        self.cycle = Some(cycle);

        let mut first = self.graph.sources();
        if first.is_empty() {
            first = self.graph.blobs().collect();
        }
        for blob in &first {
            self.request(*blob);
        }
        if self.graph.is_empty() {
            self.complete();
        }
        Ok(first)
    }

    /// The blob stopped taking input and is flushing.
    pub fn draining(&mut self, blob: Token) -> Result<(), DrainError> {
        let cycle = self.cycle_id()?;
        let state = self
            .states
            .get_mut(&blob)
            .ok_or(DrainError::UnknownBlob { blob })?;
        if *state == BlobDrainState::DrainRequested {
            *state = BlobDrainState::Draining;
            debug!(%blob, "blob draining");
            self.emit(DrainEvent::Draining { cycle, blob });
        }
        Ok(())
    }

    /// Records a drained blob and returns the blobs to request next.
    /// Repeated reports for the same blob are ignored.
    pub fn drained(&mut self, blob: Token) -> Result<Vec<Token>, DrainError> {
        let cycle = self.cycle_id()?;
        let state = self
            .states
            .get_mut(&blob)
            .ok_or(DrainError::UnknownBlob { blob })?;
        if *state == BlobDrainState::Drained {
            debug!(%blob, "duplicate drained report ignored");
            return Ok(Vec::new());
        }
        *state = BlobDrainState::Drained;
        info!(%blob, "blob drained");
        self.emit(DrainEvent::Drained { cycle, blob });

        let mut next: Vec<Token> = self
            .graph
            .successors(&blob)
            .copied()
            .filter(|succ| self.state(succ) == Some(BlobDrainState::Running))
            .filter(|succ| {
                self.graph
                    .predecessors(succ)
                    .all(|p| self.state(p) == Some(BlobDrainState::Drained))
            })
            .collect();
        for succ in &next {
            self.request(*succ);
        }

        let in_flight = self.states.values().any(|s| {
            matches!(s, BlobDrainState::DrainRequested | BlobDrainState::Draining)
        });
        if !in_flight {
            // Blobs on a feedback loop never see all their upstreams drained.
            let stuck: Vec<Token> = self
                .states
                .iter()
                .filter(|(_, &s)| s == BlobDrainState::Running)
                .map(|(&id, _)| id)
                .collect();
            if stuck.is_empty() {
                self.complete();
            } else {
                warn!(blobs = stuck.len(), "requesting blobs with undrained upstreams");
                for blob in &stuck {
                    self.request(*blob);
                }
                next.extend(stuck);
            }
        }
        Ok(next)
    }

    /// Marks the current cycle failed.
    pub fn fail(&mut self, error: String) {
        if let Some(cycle) = self.cycle.as_mut() {
            if cycle.status == DrainCycleStatus::Running {
                warn!(cycle = %cycle.id, %error, "drain cycle failed");
                cycle.mark_failed(error);
            }
        }
    }

    fn cycle_id(&self) -> Result<Uuid, DrainError> {
        match &self.cycle {
            Some(cycle) if cycle.status == DrainCycleStatus::Running => Ok(cycle.id),
            _ => Err(DrainError::NotRunning),
        }
    }

    fn request(&mut self, blob: Token) {
        if let Some(state) = self.states.get_mut(&blob) {
            *state = BlobDrainState::DrainRequested;
        }
        if let Some(cycle) = self.cycle.as_ref().map(|c| c.id) {
            debug!(%blob, "drain requested");
            self.emit(DrainEvent::Requested { cycle, blob });
        }
    }

    fn complete(&mut self) {
        let Some(cycle) = self.cycle.as_mut() else {
            return;
        };
        cycle.mark_completed();
        let event = DrainEvent::AllDrained {
            cycle: cycle.id,
            is_final: cycle.is_final,
        };
        info!(cycle = %cycle.id, "all blobs drained");
        self.emit(event);
    }

    fn emit(&self, event: DrainEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use sl_config::PartitionParameter;
    use sl_types::WorkerId;

    use crate::relay::RelayBlobFactory;

    fn t(n: u32) -> Token {
        Token::overall_input(WorkerId(n))
    }

    /// a -> b -> d, a -> c -> d
    fn diamond() -> BlobGraph {
        let machines = [(t(0), 0), (t(1), 0), (t(2), 1), (t(3), 1)].into_iter().collect();
        BlobGraph::from_parts(machines, [(t(0), t(1)), (t(0), t(2)), (t(1), t(3)), (t(2), t(3))])
    }

    #[test]
    fn blob_graph_follows_partition() {
        let graph = StreamGraph::pipeline(&["a", "b", "c", "d"]).unwrap();
        let factory = RelayBlobFactory::factory_ref();
        let mut builder = PartitionParameter::builder("partition", [2, 2]).unwrap();
        builder.add_blob_factory(factory.clone()).unwrap();
        builder.add_blob_ids(0, 1, &factory, [WorkerId(0), WorkerId(1)]).unwrap();
        builder.add_blob_ids(1, 1, &factory, [WorkerId(2), WorkerId(3)]).unwrap();
        let partition = builder.build().unwrap();

        let blobs = BlobGraph::new(&partition, &graph).unwrap();
        let first = Token::overall_input(WorkerId(0));
        let second = Token::edge(WorkerId(1), WorkerId(2));
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs.sources(), vec![first]);
        assert_eq!(blobs.successors(&first).copied().collect::<Vec<_>>(), vec![second]);
        assert_eq!(blobs.machine(&second), Some(1));
    }

    #[test]
    fn fires_once_after_every_blob() {
        let (tx, rx) = unbounded();
        let mut drainer = Drainer::new(diamond()).with_observer(tx);

        assert_eq!(drainer.start(false).unwrap(), vec![t(0)]);
        drainer.draining(t(0)).unwrap();
        let next = drainer.drained(t(0)).unwrap();
        assert_eq!(next, vec![t(1), t(2)]);
        assert!(drainer.drained(t(1)).unwrap().is_empty());
        assert_eq!(drainer.state(&t(3)), Some(BlobDrainState::Running));
        assert!(!drainer.is_finished());
        assert_eq!(drainer.drained(t(2)).unwrap(), vec![t(3)]);
        assert!(!drainer.is_finished());
        assert!(drainer.drained(t(3)).unwrap().is_empty());
        assert!(drainer.is_finished());

        let all: Vec<DrainEvent> = rx.try_iter().collect();
        let fired = all
            .iter()
            .filter(|e| matches!(e, DrainEvent::AllDrained { .. }))
            .count();
        assert_eq!(fired, 1);
        assert!(matches!(all.last(), Some(DrainEvent::AllDrained { is_final: false, .. })));
    }

    #[test]
    fn duplicate_reports_are_ignored() {
        let mut drainer = Drainer::new(diamond());
        drainer.start(true).unwrap();
        drainer.drained(t(0)).unwrap();
        assert!(drainer.drained(t(0)).unwrap().is_empty());
        assert_eq!(drainer.pending(), vec![t(1), t(2), t(3)]);
    }

    #[test]
    fn rejects_unknown_blobs_and_restarts() {
        let mut drainer = Drainer::new(diamond());
        assert_eq!(drainer.drained(t(0)), Err(DrainError::NotRunning));
        drainer.start(false).unwrap();
        assert_eq!(drainer.start(false), Err(DrainError::AlreadyDraining));
        assert_eq!(
            drainer.drained(t(9)),
            Err(DrainError::UnknownBlob { blob: t(9) })
        );
        drainer.fail("node lost".to_string());
        assert_eq!(drainer.cycle().map(|c| c.status), Some(DrainCycleStatus::Failed));
        assert_eq!(drainer.draining(t(0)), Err(DrainError::NotRunning));
    }

    #[test]
    fn feedback_loops_are_requested_together() {
        let machines = [(t(0), 0), (t(1), 0), (t(2), 0)].into_iter().collect();
        let looped = BlobGraph::from_parts(machines, [(t(0), t(1)), (t(1), t(2)), (t(2), t(1))]);
        let mut drainer = Drainer::new(looped);
        drainer.start(false).unwrap();
        assert_eq!(drainer.drained(t(0)).unwrap(), vec![t(1), t(2)]);
        drainer.drained(t(2)).unwrap();
        drainer.drained(t(1)).unwrap();
        assert!(drainer.is_finished());
    }

    #[test]
    fn loop_through_the_fed_blob_is_requested_whole() {
        // a <-> b; a also has the graph input, but b feeds it too.
        let machines = [(t(0), 0), (t(1), 1)].into_iter().collect();
        let looped = BlobGraph::from_parts(machines, [(t(0), t(1)), (t(1), t(0))]);
        let mut drainer = Drainer::new(looped);

        assert_eq!(drainer.start(true).unwrap(), vec![t(0), t(1)]);
        assert_eq!(drainer.state(&t(1)), Some(BlobDrainState::DrainRequested));
        drainer.drained(t(1)).unwrap();
        drainer.drained(t(0)).unwrap();
        assert!(drainer.is_finished());
    }
}
