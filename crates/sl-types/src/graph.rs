//! Stream graph vocabulary: workers, their stable identifiers, and edges.
//!
//! Identifiers are assigned by [`GraphBuilder`] in insertion order, starting
//! at zero. They are the only link between configuration data (which stores
//! identifiers) and live graph objects.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::construction_error;
use crate::errors::ConfigError;
use crate::token::Token;

/// Stable identifier of a worker within one stream graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed data rates of a worker, in items per firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rates {
    pub pop: usize,
    pub peek: usize,
    pub push: usize,
}

impl Rates {
    pub fn new(pop: usize, peek: usize, push: usize) -> Self {
        Self { pop, peek, push }
    }

    /// One in, one out.
    pub fn identity() -> Self {
        Self::new(1, 1, 1)
    }
}

impl Default for Rates {
    fn default() -> Self {
        Self::identity()
    }
}

/// A single node of the stream graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    id: Option<WorkerId>,
    name: String,
    rates: Rates,
}

impl Worker {
    /// A worker that does not belong to any graph yet, so it has no
    /// identifier.
    pub fn detached(name: impl Into<String>, rates: Rates) -> Self {
        Self {
            id: None,
            name: name.into(),
            rates,
        }
    }

    pub fn id(&self) -> Option<WorkerId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rates(&self) -> Rates {
        self.rates
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}#{}", self.name, id),
            None => write!(f, "{}#?", self.name),
        }
    }
}

/// Boundary of a worker set within a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundaryTokens {
    /// Edges entering the set, plus overall-input tokens of its sources.
    pub inputs: BTreeSet<Token>,
    /// Edges leaving the set, plus overall-output tokens of its sinks.
    pub outputs: BTreeSet<Token>,
    /// Edges with both ends inside the set.
    pub internal: BTreeSet<Token>,
}

/// An immutable, connected stream graph.
#[derive(Debug, Clone)]
pub struct StreamGraph {
    workers: Vec<Arc<Worker>>,
    successors: Vec<Vec<WorkerId>>,
    predecessors: Vec<Vec<WorkerId>>,
}

impl StreamGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// Builds a straight pipeline of identity workers with the given names.
    pub fn pipeline<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        let mut previous = None;
        for name in names {
            let id = builder.add_worker(name.as_ref(), Rates::identity());
            if let Some(prev) = previous {
                builder.connect(prev, id)?;
            }
            previous = Some(id);
        }
        builder.build()
    }

    /// The first worker added; every traversal starts here.
    pub fn root(&self) -> WorkerId {
        WorkerId(0)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&Arc<Worker>> {
        self.workers.get(id.0 as usize)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.iter()
    }

    pub fn max_identifier(&self) -> Option<WorkerId> {
        self.workers.last().and_then(|w| w.id)
    }

    pub fn successors(&self, id: WorkerId) -> &[WorkerId] {
        self.successors
            .get(id.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn predecessors(&self, id: WorkerId) -> &[WorkerId] {
        self.predecessors
            .get(id.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All workers reachable from `root` along successor edges, in
    /// breadth-first order.
    pub fn reachable_from(&self, root: WorkerId) -> Vec<Arc<Worker>> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        if self.worker(root).is_some() {
            queue.push_back(root);
            seen.insert(root);
        }
        while let Some(id) = queue.pop_front() {
            if let Some(worker) = self.worker(id) {
                order.push(worker.clone());
            }
            for &next in self.successors(id) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Computes the input, output, and internal tokens of a worker set.
    pub fn boundary_tokens(&self, set: &BTreeSet<WorkerId>) -> BoundaryTokens {
        let mut boundary = BoundaryTokens::default();
        for &id in set {
            let preds = self.predecessors(id);
            if preds.is_empty() {
                boundary.inputs.insert(Token::overall_input(id));
            }
            for &p in preds {
                if set.contains(&p) {
                    boundary.internal.insert(Token::edge(p, id));
                } else {
                    boundary.inputs.insert(Token::edge(p, id));
                }
            }
            let succs = self.successors(id);
            if succs.is_empty() {
                boundary.outputs.insert(Token::overall_output(id));
            }
            for &s in succs {
                if !set.contains(&s) {
                    boundary.outputs.insert(Token::edge(id, s));
                }
            }
        }
        boundary
    }
}

/// Assembles a [`StreamGraph`], assigning identifiers as workers are added.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    workers: Vec<Worker>,
    edges: Vec<(WorkerId, WorkerId)>,
}

impl GraphBuilder {
    pub fn add_worker(&mut self, name: impl Into<String>, rates: Rates) -> WorkerId {
        let id = WorkerId(self.workers.len() as u32);
        self.workers.push(Worker {
            id: Some(id),
            name: name.into(),
            rates,
        });
        id
    }

    pub fn connect(&mut self, from: WorkerId, to: WorkerId) -> Result<(), ConfigError> {
        let known = self.workers.len() as u32;
        if from.0 >= known || to.0 >= known {
            return Err(construction_error!("edge {from} -> {to} references an unknown worker"));
        }
        if from == to {
            return Err(construction_error!("worker {from} cannot feed itself"));
        }
        if self.edges.contains(&(from, to)) {
            return Err(construction_error!("duplicate edge {from} -> {to}"));
        }
        self.edges.push((from, to));
        Ok(())
    }

    pub fn build(self) -> Result<StreamGraph, ConfigError> {
        if self.workers.is_empty() {
            return Err(construction_error!("stream graph has no workers"));
        }
        let n = self.workers.len();
        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        for (from, to) in self.edges {
            successors[from.0 as usize].push(to);
            predecessors[to.0 as usize].push(from);
        }
        Ok(StreamGraph {
            workers: self.workers.into_iter().map(Arc::new).collect(),
            successors,
            predecessors,
        })
    }
}
