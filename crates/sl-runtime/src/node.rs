//! Contract between the controller and the per-node blob managers.

use async_trait::async_trait;
use sl_config::PartitionParameter;
use sl_types::{Item, SharedBuffer, SlResult, StreamGraph, Token};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Items left behind by a drain, keyed by the edge they were on.
pub type DrainData = BTreeMap<Token, Vec<Item>>;

/// Appends `more` after whatever `data` already holds for each token.
pub fn merge_drain_data(data: &mut DrainData, more: DrainData) {
    for (token, items) in more {
        if !items.is_empty() {
            data.entry(token).or_default().extend(items);
        }
    }
}

/// What a node needs to start its share of a configuration.
#[derive(Clone)]
pub struct NodePlan {
    /// Launch number. Signals carry it so reports from an earlier launch
    /// can be told apart.
    pub epoch: u64,
    pub graph: Arc<StreamGraph>,
    pub partition: PartitionParameter,
    /// Items carried over from the previous configuration's drain.
    pub drain_data: DrainData,
    /// Controller-side buffers feeding the graph's source workers.
    pub overall_inputs: BTreeMap<Token, SharedBuffer>,
    /// Controller-side buffers collecting the graph's sink workers.
    pub overall_outputs: BTreeMap<Token, SharedBuffer>,
}

/// Report sent from a node to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSignal {
    pub node: usize,
    /// The [`NodePlan::epoch`] of the launch the reporting blob belongs to.
    pub epoch: u64,
    pub kind: NodeSignalKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeSignalKind {
    /// The blob was told to finish and is flushing. Its network inputs stay
    /// open until their senders end the stream.
    Draining { blob: Token },
    /// The blob and its output channels are done. `data` holds what was
    /// left in its input buffers; `stranded` holds what its output channels
    /// could not deliver.
    Drained {
        blob: Token,
        data: DrainData,
        stranded: DrainData,
    },
    Failed { blob: Option<Token>, message: String },
}

/// Management handle for one node.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    fn node_id(&self) -> usize;

    /// Starts every blob the plan places on this node and returns their ids.
    async fn launch(&self, plan: NodePlan) -> SlResult<Vec<Token>>;

    /// Begins draining `blob`. Progress is reported through [`NodeSignal`]s.
    async fn drain(&self, blob: Token, is_final: bool) -> SlResult<()>;

    /// Tears down every blob and channel. Idempotent.
    async fn stop(&self) -> SlResult<()>;
}
