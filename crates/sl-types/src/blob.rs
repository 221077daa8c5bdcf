//! Collaborator contracts for execution units.
//!
//! A [`Blob`] is produced by a [`BlobFactory`] from a worker set and a core
//! count. Sluice never looks inside a blob: it only drives its cores, asks it
//! to drain, and wires its input and output buffers.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::errors::SlResult;
use crate::graph::{BoundaryTokens, Worker, WorkerId};
use crate::token::Token;

/// The dynamically-typed data item carried by buffers and channels.
pub type Item = Value;

/// A buffer shared between a blob and a channel.
pub type SharedBuffer = Arc<dyn Buffer<Item>>;

/// Result of running one scheduling step on a blob core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The core consumed or produced at least one item.
    Progress,
    /// Nothing to do right now.
    Idle,
    /// The blob was asked to drain and has flushed all internal state.
    Drained,
}

/// An opaque execution unit covering a subset of graph workers.
pub trait Blob: Send + Sync {
    /// Identifier of the blob: its smallest input token.
    fn id(&self) -> Token;

    fn workers(&self) -> &BTreeSet<WorkerId>;

    fn inputs(&self) -> &BTreeSet<Token>;

    fn outputs(&self) -> &BTreeSet<Token>;

    fn core_count(&self) -> usize;

    /// Runs one unit of work on `core`.
    fn step(&self, core: usize) -> StepOutcome;

    /// Stop accepting new input and start flushing in-flight state. Once
    /// flushing completes, every core's `step` reports [`StepOutcome::Drained`].
    fn drain(&self);
}

/// Everything a factory needs to instantiate a blob.
pub struct BlobContext {
    pub workers: Vec<Arc<Worker>>,
    pub cores: usize,
    pub boundary: BoundaryTokens,
    pub inputs: BTreeMap<Token, SharedBuffer>,
    pub outputs: BTreeMap<Token, SharedBuffer>,
    /// Items left on edges that are internal to this blob by a previous
    /// configuration's drain.
    pub initial_data: BTreeMap<Token, Vec<Item>>,
}

impl BlobContext {
    pub fn worker_ids(&self) -> BTreeSet<WorkerId> {
        self.workers.iter().filter_map(|w| w.id()).collect()
    }
}

/// Builds blobs. Factories compare by value through their descriptor, which
/// is also their structured-document form and must carry a `class` field.
pub trait BlobFactory: fmt::Debug + Send + Sync {
    fn descriptor(&self) -> Value;

    fn make_blob(&self, ctx: BlobContext) -> SlResult<Arc<dyn Blob>>;
}

/// Shared handle to a factory with value equality.
#[derive(Clone)]
pub struct FactoryRef(Arc<dyn BlobFactory>);

impl FactoryRef {
    pub fn new<F: BlobFactory + 'static>(factory: F) -> Self {
        Self(Arc::new(factory))
    }

    pub fn from_arc(factory: Arc<dyn BlobFactory>) -> Self {
        Self(factory)
    }

    pub fn descriptor(&self) -> Value {
        self.0.descriptor()
    }

    /// The descriptor's `class` discriminator.
    pub fn class_name(&self) -> String {
        self.descriptor()
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string()
    }

    pub fn make_blob(&self, ctx: BlobContext) -> SlResult<Arc<dyn Blob>> {
        self.0.make_blob(ctx)
    }
}

impl PartialEq for FactoryRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.descriptor() == other.descriptor()
    }
}

impl Eq for FactoryRef {}

impl Hash for FactoryRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.descriptor().to_string().hash(state);
    }
}

impl fmt::Debug for FactoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactoryRef({})", self.descriptor())
    }
}

impl fmt::Display for FactoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.class_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Named(&'static str);

    impl BlobFactory for Named {
        fn descriptor(&self) -> Value {
            json!({ "class": self.0 })
        }

        fn make_blob(&self, _ctx: BlobContext) -> SlResult<Arc<dyn Blob>> {
            Err(crate::internal_error!("not buildable"))
        }
    }

    #[test]
    fn factories_compare_by_descriptor() {
        let a = FactoryRef::new(Named("Interp"));
        let b = FactoryRef::new(Named("Interp"));
        let c = FactoryRef::new(Named("Compiler"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.class_name(), "Compiler");
    }
}
