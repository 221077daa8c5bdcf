//! Worker-to-blob placement.
//!
//! A [`PartitionParameter`] says which workers form each blob, which machine
//! the blob runs on, how many of that machine's cores it gets, and which
//! factory builds it. All invariants are checked by [`PartitionBuilder`] as
//! blobs are added, so a built parameter is always a valid placement.

use sl_types::{
    construction_error, ConfigError, FactoryRef, PlacementError, StreamGraph, Worker, WorkerId,
};
use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One blob's placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobSpecifier {
    worker_identifiers: BTreeSet<WorkerId>,
    machine: usize,
    cores: usize,
    blob_factory: FactoryRef,
}

impl BlobSpecifier {
    pub fn worker_identifiers(&self) -> &BTreeSet<WorkerId> {
        &self.worker_identifiers
    }

    /// Smallest contained worker identifier. Identifiers are unique across a
    /// partition, so this orders the blobs of a machine.
    pub fn min_worker(&self) -> Option<WorkerId> {
        self.worker_identifiers.first().copied()
    }

    pub fn machine(&self) -> usize {
        self.machine
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn blob_factory(&self) -> &FactoryRef {
        &self.blob_factory
    }

    /// Resolves the identifiers back to the live workers of `graph`.
    ///
    /// Every worker reachable from the graph root is indexed; an identifier
    /// with no matching worker fails with [`ConfigError::GraphMismatch`].
    pub fn workers(&self, graph: &StreamGraph) -> Result<Vec<Arc<Worker>>, ConfigError> {
        let by_id: HashMap<WorkerId, Arc<Worker>> = graph
            .reachable_from(graph.root())
            .into_iter()
            .filter_map(|w| w.id().map(|id| (id, w)))
            .collect();
        self.worker_identifiers
            .iter()
            .map(|id| {
                by_id
                    .get(id)
                    .cloned()
                    .ok_or(ConfigError::GraphMismatch { worker: *id })
            })
            .collect()
    }
}

/// Placement of every worker of a stream graph onto blobs, machines and
/// cores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionParameter {
    name: String,
    cores_per_machine: Vec<usize>,
    blobs: Vec<Vec<BlobSpecifier>>,
    blob_factory_universe: Vec<FactoryRef>,
    max_worker_identifier: WorkerId,
}

impl PartitionParameter {
    /// Starts a placement over machines with the given core counts. At least
    /// one machine is required and every machine needs at least one core.
    pub fn builder(
        name: impl Into<String>,
        cores_per_machine: impl IntoIterator<Item = usize>,
    ) -> Result<PartitionBuilder, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(construction_error!("parameter names must not be empty"));
        }
        let cores_per_machine: Vec<usize> = cores_per_machine.into_iter().collect();
        if cores_per_machine.is_empty() {
            return Err(construction_error!("partition {name} has no machines"));
        }
        if let Some(m) = cores_per_machine.iter().position(|&c| c == 0) {
            return Err(construction_error!("machine {m} of partition {name} has no cores"));
        }
        Ok(PartitionBuilder {
            free_cores: cores_per_machine.clone(),
            blobs: vec![Vec::new(); cores_per_machine.len()],
            name,
            cores_per_machine,
            blob_factory_universe: Vec::new(),
            assigned: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn machine_count(&self) -> usize {
        self.cores_per_machine.len()
    }

    pub fn cores_on_machine(&self, machine: usize) -> Option<usize> {
        self.cores_per_machine.get(machine).copied()
    }

    pub fn cores_per_machine(&self) -> &[usize] {
        &self.cores_per_machine
    }

    /// Blobs placed on `machine`, ordered by minimum worker identifier.
    pub fn blobs_on_machine(&self, machine: usize) -> &[BlobSpecifier] {
        self.blobs.get(machine).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All blobs, machine by machine.
    pub fn blobs(&self) -> impl Iterator<Item = &BlobSpecifier> {
        self.blobs.iter().flatten()
    }

    pub fn blob_factories(&self) -> &[FactoryRef] {
        &self.blob_factory_universe
    }

    /// Largest worker identifier assigned when the parameter was built.
    pub fn max_worker_identifier(&self) -> WorkerId {
        self.max_worker_identifier
    }

    pub fn blob_for_worker(&self, worker: WorkerId) -> Option<&BlobSpecifier> {
        self.blobs()
            .find(|b| b.worker_identifiers.contains(&worker))
    }

    /// Workers of `graph` that no blob covers.
    pub fn unassigned_workers(&self, graph: &StreamGraph) -> Vec<WorkerId> {
        let assigned: BTreeSet<WorkerId> = self
            .blobs()
            .flat_map(|b| b.worker_identifiers.iter().copied())
            .collect();
        graph
            .workers()
            .filter_map(|w| w.id())
            .filter(|id| !assigned.contains(id))
            .collect()
    }
}

/// Mutable accumulator for a [`PartitionParameter`].
///
/// Every failed call leaves the builder unchanged.
#[derive(Debug, Clone)]
pub struct PartitionBuilder {
    name: String,
    cores_per_machine: Vec<usize>,
    free_cores: Vec<usize>,
    blob_factory_universe: Vec<FactoryRef>,
    blobs: Vec<Vec<BlobSpecifier>>,
    assigned: BTreeSet<WorkerId>,
}

impl PartitionBuilder {
    pub fn add_blob_factory(&mut self, factory: FactoryRef) -> Result<(), PlacementError> {
        if self.blob_factory_universe.contains(&factory) {
            return Err(PlacementError::DuplicateFactory {
                factory: factory.to_string(),
            });
        }
        self.blob_factory_universe.push(factory);
        Ok(())
    }

    /// Places a blob of `workers` on `machine` with `cores` cores.
    pub fn add_blob<I>(
        &mut self,
        machine: usize,
        cores: usize,
        factory: &FactoryRef,
        workers: impl IntoIterator<Item = I>,
    ) -> Result<(), PlacementError>
    where
        I: Borrow<Worker>,
    {
        let ids = workers
            .into_iter()
            .map(|w| {
                let w = w.borrow();
                w.id().ok_or_else(|| PlacementError::UnassignedWorkerIdentifier {
                    worker: w.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.add_blob_ids(machine, cores, factory, ids)
    }

    /// Like [`add_blob`](Self::add_blob), for workers known only by
    /// identifier.
    pub fn add_blob_ids(
        &mut self,
        machine: usize,
        cores: usize,
        factory: &FactoryRef,
        ids: impl IntoIterator<Item = WorkerId>,
    ) -> Result<(), PlacementError> {
        let available = *self
            .free_cores
            .get(machine)
            .ok_or(PlacementError::MachineOutOfRange {
                machine,
                machines: self.free_cores.len(),
            })?;
        if cores == 0 {
            return Err(PlacementError::ZeroCores);
        }
        if cores > available {
            return Err(PlacementError::InsufficientCores {
                machine,
                requested: cores,
                available,
            });
        }
        if !self.blob_factory_universe.contains(factory) {
            return Err(PlacementError::UnregisteredFactory {
                factory: factory.to_string(),
            });
        }
        let mut worker_identifiers = BTreeSet::new();
        for id in ids {
            if self.assigned.contains(&id) || !worker_identifiers.insert(id) {
                return Err(PlacementError::WorkerAlreadyAssigned { worker: id });
            }
        }
        if worker_identifiers.is_empty() {
            return Err(PlacementError::EmptyBlob);
        }

        // All checks passed; commit.
        debug!(
            partition = %self.name,
            machine,
            cores,
            factory = %factory,
            workers = ?worker_identifiers,
            "placed blob"
        );
        self.assigned.extend(worker_identifiers.iter().copied());
        self.free_cores[machine] -= cores;
        self.blobs[machine].push(BlobSpecifier {
            worker_identifiers,
            machine,
            cores,
            blob_factory: factory.clone(),
        });
        Ok(())
    }

    pub fn free_cores(&self, machine: usize) -> Option<usize> {
        self.free_cores.get(machine).copied()
    }

    /// Freezes a snapshot. The builder stays usable.
    pub fn build(&self) -> Result<PartitionParameter, ConfigError> {
        let max_worker_identifier = *self
            .assigned
            .last()
            .ok_or_else(|| construction_error!("partition {} contains no blobs", self.name))?;
        let mut blobs = self.blobs.clone();
        for machine in &mut blobs {
            machine.sort_by_key(BlobSpecifier::min_worker);
        }
        Ok(PartitionParameter {
            name: self.name.clone(),
            cores_per_machine: self.cores_per_machine.clone(),
            blobs,
            blob_factory_universe: self.blob_factory_universe.clone(),
            max_worker_identifier,
        })
    }
}
