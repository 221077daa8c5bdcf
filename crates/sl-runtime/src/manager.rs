//! Per-node owner of blobs and boundary channels.
//!
//! [`BlobsManager`] starts the blobs a partition places on its node, wires
//! their buffers with channels, and runs each blob core on the blocking pool.
//! Drains run as background tasks that report back through [`NodeSignal`]s.

use async_trait::async_trait;
use parking_lot::Mutex;
use sl_channel::{
    BoundaryChannel, ChannelDirectory, ChannelHandle, LocalChannel, TcpInputChannel,
    TcpOutputChannel,
};
use sl_types::{
    internal_error, Blob, BlobContext, Buffer, ConcurrentBuffer, DrainError, Item, SharedBuffer,
    SlResult, StepOutcome, Token,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::drainer::blob_id;
use crate::node::{DrainData, NodeHandle, NodePlan, NodeSignal, NodeSignalKind};

/// A blob that has not started draining.
struct RunningBlob {
    id: Token,
    blob: Arc<dyn Blob>,
    input_buffers: BTreeMap<Token, SharedBuffer>,
    output_buffers: BTreeMap<Token, SharedBuffer>,
    /// Channels this blob owns on its input side: controller pumps and
    /// network receivers. Same-node edges belong to the upstream blob.
    inputs: Vec<ChannelHandle>,
    outputs: Vec<ChannelHandle>,
    cores: Vec<JoinHandle<()>>,
}

impl RunningBlob {
    fn channels(&self) -> impl Iterator<Item = &ChannelHandle> {
        self.inputs.iter().chain(self.outputs.iter())
    }
}

/// Everything started for the current configuration.
struct Active {
    epoch: u64,
    blobs: BTreeMap<Token, RunningBlob>,
    halt: Arc<AtomicBool>,
    drains: Vec<JoinHandle<()>>,
    published: Vec<Token>,
    overall_outputs: BTreeMap<Token, SharedBuffer>,
}

impl Active {
    fn new(epoch: u64, overall_outputs: BTreeMap<Token, SharedBuffer>) -> Self {
        Self {
            epoch,
            blobs: BTreeMap::new(),
            halt: Arc::new(AtomicBool::new(false)),
            drains: Vec::new(),
            published: Vec::new(),
            overall_outputs,
        }
    }
}

/// Cores run on the blocking pool and only stop at `halt`, so a dropped
/// configuration must raise it. Channel handles cancel themselves on drop.
impl Drop for Active {
    fn drop(&mut self) {
        self.halt.store(true, Ordering::Release);
        for task in &self.drains {
            task.abort();
        }
    }
}

/// Blob and channel owner for one node.
pub struct BlobsManager {
    node: usize,
    config: RuntimeConfig,
    directory: Arc<ChannelDirectory>,
    signals: UnboundedSender<NodeSignal>,
    active: Mutex<Option<Active>>,
}

impl BlobsManager {
    pub fn new(
        node: usize,
        config: RuntimeConfig,
        directory: Arc<ChannelDirectory>,
        signals: UnboundedSender<NodeSignal>,
    ) -> Self {
        Self {
            node,
            config,
            directory,
            signals,
            active: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Blobs started and not yet asked to drain.
    pub fn blob_ids(&self) -> Vec<Token> {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.blobs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Instantiates this node's blobs, then their channels, then their cores.
    pub async fn start(&self, plan: NodePlan) -> SlResult<Vec<Token>> {
        if self.is_running() {
            return Err(internal_error!("node {} is already running a configuration", self.node));
        }
        let NodePlan {
            epoch,
            graph,
            partition,
            mut drain_data,
            overall_inputs,
            overall_outputs,
        } = plan;
        let capacity = self.config.buffer_capacity;

        let mut staged = Vec::new();
        for spec in partition.blobs_on_machine(self.node) {
            let workers = spec.workers(&graph)?;
            let id = blob_id(spec, &graph)?;
            let boundary = graph.boundary_tokens(spec.worker_identifiers());
            let mut inputs = BTreeMap::new();
            for token in &boundary.inputs {
                let carried = drain_data.remove(token).unwrap_or_default();
                inputs.insert(*token, prefilled(capacity, carried)?);
            }
            let outputs: BTreeMap<Token, SharedBuffer> = boundary
                .outputs
                .iter()
                .map(|&t| (t, Arc::new(ConcurrentBuffer::<Item>::new(capacity)) as SharedBuffer))
                .collect();
            let initial_data = boundary
                .internal
                .iter()
                .filter_map(|t| drain_data.remove(t).map(|items| (*t, items)))
                .collect();
            let blob = spec.blob_factory().make_blob(BlobContext {
                workers,
                cores: spec.cores(),
                boundary,
                inputs: inputs.clone(),
                outputs: outputs.clone(),
                initial_data,
            })?;
            debug!(node = self.node, blob = %id, factory = %spec.blob_factory(), "blob created");
            staged.push(RunningBlob {
                id,
                blob,
                input_buffers: inputs,
                output_buffers: outputs,
                inputs: Vec::new(),
                outputs: Vec::new(),
                cores: Vec::new(),
            });
        }

        let mut active = Active::new(epoch, overall_outputs.clone());
        if let Err(e) = self
            .wire(staged, &overall_inputs, &overall_outputs, &mut active)
            .await
        {
            self.release(active).await;
            return Err(e);
        }

        let backoff = self.config.idle_backoff();
        for running in active.blobs.values_mut() {
            for core in 0..running.blob.core_count() {
                running
                    .cores
                    .push(spawn_core(running.blob.clone(), core, active.halt.clone(), backoff));
            }
        }
        let ids: Vec<Token> = active.blobs.keys().copied().collect();
        info!(node = self.node, epoch, blobs = ids.len(), "node started");

        let rejected = {
            let mut slot = self.active.lock();
            match slot.as_ref() {
                Some(_) => Some(active),
                None => {
                    *slot = Some(active);
                    None
                }
            }
        };
        if let Some(active) = rejected {
            self.release(active).await;
            return Err(internal_error!("node {} was started concurrently", self.node));
        }
        Ok(ids)
    }

    async fn wire(
        &self,
        staged: Vec<RunningBlob>,
        overall_inputs: &BTreeMap<Token, SharedBuffer>,
        overall_outputs: &BTreeMap<Token, SharedBuffer>,
        active: &mut Active,
    ) -> SlResult<()> {
        let channel = &self.config.channel;
        let local_inputs: BTreeMap<Token, SharedBuffer> = staged
            .iter()
            .flat_map(|r| r.input_buffers.iter().map(|(t, b)| (*t, b.clone())))
            .collect();
        let local_outputs: BTreeSet<Token> = staged
            .iter()
            .flat_map(|r| r.output_buffers.keys().copied())
            .collect();

        for mut running in staged {
            for (token, buffer) in &running.output_buffers {
                let handle = if token.is_overall_output() {
                    let sink = overall_outputs
                        .get(token)
                        .ok_or_else(|| internal_error!("no controller buffer for {token}"))?;
                    LocalChannel::new(*token, buffer.clone(), sink.clone(), channel).spawn()
                } else if let Some(sink) = local_inputs.get(token) {
                    LocalChannel::new(*token, buffer.clone(), sink.clone(), channel).spawn()
                } else {
                    let out = TcpOutputChannel::bind(
                        *token,
                        buffer.clone(),
                        self.config.bind_host,
                        channel,
                        &self.directory,
                    )
                    .await?;
                    active.published.push(*token);
                    out.spawn()
                };
                running.outputs.push(handle);
            }
            for (token, buffer) in &running.input_buffers {
                if token.is_overall_input() {
                    let source = overall_inputs
                        .get(token)
                        .ok_or_else(|| internal_error!("no controller buffer for {token}"))?;
                    running
                        .inputs
                        .push(LocalChannel::new(*token, source.clone(), buffer.clone(), channel).spawn());
                } else if !local_outputs.contains(token) {
                    running.inputs.push(
                        TcpInputChannel::new(*token, buffer.clone(), self.directory.clone(), channel)
                            .spawn(),
                    );
                }
            }
            active.blobs.insert(running.id, running);
        }
        Ok(())
    }

    /// Starts draining `blob` in the background.
    pub fn drain_blob(&self, blob: Token, is_final: bool) -> SlResult<()> {
        let mut slot = self.active.lock();
        let active = slot.as_mut().ok_or(DrainError::NotRunning)?;
        let running = active
            .blobs
            .remove(&blob)
            .ok_or(DrainError::UnknownBlob { blob })?;
        let reporter = Reporter {
            node: self.node,
            epoch: active.epoch,
            signals: self.signals.clone(),
        };
        let task = tokio::spawn(drain_running(
            running,
            is_final,
            active.overall_outputs.clone(),
            reporter,
        ));
        active.drains.push(task);
        Ok(())
    }

    /// Halts every core and aborts every channel and pending drain.
    /// Does nothing when no configuration is running.
    pub async fn teardown(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            self.release(active).await;
            info!(node = self.node, "node stopped");
        }
    }

    async fn release(&self, mut active: Active) {
        active.halt.store(true, Ordering::Release);
        let drains = std::mem::take(&mut active.drains);
        for task in &drains {
            task.abort();
        }
        for channel in active.blobs.values().flat_map(RunningBlob::channels) {
            channel.stop(false);
        }
        for channel in active.blobs.values().flat_map(RunningBlob::channels) {
            if let Err(e) = channel.close().await {
                debug!(channel = channel.name(), error = %e, "channel close after abort");
            }
        }
        for task in drains {
            let _ = task.await;
        }
        for token in &active.published {
            self.directory.withdraw(token);
        }
    }
}

#[async_trait]
impl NodeHandle for BlobsManager {
    fn node_id(&self) -> usize {
        self.node
    }

    async fn launch(&self, plan: NodePlan) -> SlResult<Vec<Token>> {
        self.start(plan).await
    }

    async fn drain(&self, blob: Token, is_final: bool) -> SlResult<()> {
        self.drain_blob(blob, is_final)
    }

    async fn stop(&self) -> SlResult<()> {
        self.teardown().await;
        Ok(())
    }
}

fn prefilled(capacity: usize, items: Vec<Item>) -> SlResult<SharedBuffer> {
    let buffer = ConcurrentBuffer::new(capacity.max(items.len()));
    for item in items {
        buffer
            .write(item)
            .map_err(|_| internal_error!("carried items exceed buffer capacity"))?;
    }
    Ok(Arc::new(buffer))
}

fn spawn_core(
    blob: Arc<dyn Blob>,
    core: usize,
    halt: Arc<AtomicBool>,
    backoff: Duration,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !halt.load(Ordering::Acquire) {
            match blob.step(core) {
                StepOutcome::Progress => {}
                StepOutcome::Idle => std::thread::sleep(backoff),
                StepOutcome::Drained => break,
            }
        }
    })
}

struct Reporter {
    node: usize,
    epoch: u64,
    signals: UnboundedSender<NodeSignal>,
}

impl Reporter {
    fn send(&self, kind: NodeSignalKind) {
        let signal = NodeSignal {
            node: self.node,
            epoch: self.epoch,
            kind,
        };
        if self.signals.send(signal).is_err() {
            warn!(node = self.node, "controller stopped listening for node signals");
        }
    }
}

async fn drain_running(
    running: RunningBlob,
    is_final: bool,
    overall_outputs: BTreeMap<Token, SharedBuffer>,
    reporter: Reporter,
) {
    let RunningBlob {
        id,
        blob,
        input_buffers,
        output_buffers,
        inputs,
        outputs,
        cores,
    } = running;
    let node = reporter.node;
    info!(node, blob = %id, is_final, "draining blob");

    // Controller input not yet pumped stays queued for the next
    // configuration, unless this is the final drain.
    let (pumps, receivers): (Vec<_>, Vec<_>) = inputs
        .into_iter()
        .partition(|c| c.token().is_overall_input());
    for channel in &pumps {
        channel.stop(is_final);
    }
    close_all(&pumps, node, id, "input").await;

    // Upstream blobs have already delivered everything, except around a
    // feedback loop where the upstream waits on this blob's output. Network
    // inputs therefore close only after the outputs have flushed.
    blob.drain();
    reporter.send(NodeSignalKind::Draining { blob: id });

    for core in cores {
        if let Err(e) = core.await {
            error!(node, blob = %id, error = %e, "blob core failed");
            reporter.send(NodeSignalKind::Failed {
                blob: Some(id),
                message: e.to_string(),
            });
            return;
        }
    }

    for channel in outputs.iter().chain(receivers.iter()) {
        channel.stop(true);
    }
    close_all(&outputs, node, id, "output").await;
    close_all(&receivers, node, id, "input").await;

    let data = take_all(&input_buffers);
    let stranded = settle_outputs(&output_buffers, &overall_outputs);
    info!(
        node,
        blob = %id,
        leftover = data.values().map(Vec::len).sum::<usize>(),
        stranded = stranded.values().map(Vec::len).sum::<usize>(),
        "blob drained"
    );
    reporter.send(NodeSignalKind::Drained {
        blob: id,
        data,
        stranded,
    });
}

async fn close_all(channels: &[ChannelHandle], node: usize, blob: Token, side: &str) {
    for channel in channels {
        match channel.close().await {
            Ok(report) => debug!(
                node,
                channel = %report.name,
                sent = report.sent,
                reconnects = report.reconnects,
                "{side} channel closed"
            ),
            Err(e) => warn!(node, %blob, channel = channel.name(), error = %e, "{side} channel close failed"),
        }
    }
}

/// Moves what output channels left behind into the controller sinks.
/// Whatever neither a channel nor a sink took is returned as stranded.
fn settle_outputs(
    output_buffers: &BTreeMap<Token, SharedBuffer>,
    overall_outputs: &BTreeMap<Token, SharedBuffer>,
) -> DrainData {
    let mut stranded = DrainData::new();
    for (token, items) in take_all(output_buffers) {
        let Some(sink) = overall_outputs.get(&token) else {
            stranded.insert(token, items);
            continue;
        };
        let mut overflow = Vec::new();
        for item in items {
            if let Err(back) = sink.write(item) {
                overflow.push(back);
            }
        }
        if !overflow.is_empty() {
            warn!(%token, items = overflow.len(), "output sink full, keeping the rest");
            stranded.insert(token, overflow);
        }
    }
    stranded
}

fn take_all(buffers: &BTreeMap<Token, SharedBuffer>) -> DrainData {
    buffers
        .iter()
        .map(|(token, buffer)| (*token, buffer.read_all()))
        .filter(|(_, items)| !items.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sl_config::PartitionParameter;
    use sl_types::{StreamGraph, WorkerId};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    use crate::relay::RelayBlobFactory;

    struct Fixture {
        manager: BlobsManager,
        signals: UnboundedReceiver<NodeSignal>,
        plan: NodePlan,
        input: SharedBuffer,
        output: SharedBuffer,
    }

    fn fixture() -> Fixture {
        let (tx, signals) = unbounded_channel();
        let manager = BlobsManager::new(
            0,
            RuntimeConfig::default(),
            Arc::new(ChannelDirectory::new()),
            tx,
        );
        let graph = Arc::new(StreamGraph::pipeline(&["a", "b", "c"]).unwrap());
        let factory = RelayBlobFactory::factory_ref();
        let mut builder = PartitionParameter::builder("partition", [2]).unwrap();
        builder.add_blob_factory(factory.clone()).unwrap();
        builder
            .add_blob_ids(0, 2, &factory, [WorkerId(0), WorkerId(1), WorkerId(2)])
            .unwrap();
        let input: SharedBuffer = Arc::new(ConcurrentBuffer::<Item>::unbounded());
        let output: SharedBuffer = Arc::new(ConcurrentBuffer::<Item>::unbounded());
        let plan = NodePlan {
            epoch: 3,
            graph,
            partition: builder.build().unwrap(),
            drain_data: DrainData::new(),
            overall_inputs: [(Token::overall_input(WorkerId(0)), input.clone())]
                .into_iter()
                .collect(),
            overall_outputs: [(Token::overall_output(WorkerId(2)), output.clone())]
                .into_iter()
                .collect(),
        };
        Fixture {
            manager,
            signals,
            plan,
            input,
            output,
        }
    }

    async fn next_drained(signals: &mut UnboundedReceiver<NodeSignal>) -> (DrainData, DrainData) {
        loop {
            match signals.recv().await.map(|s| s.kind) {
                Some(NodeSignalKind::Drained { data, stranded, .. }) => return (data, stranded),
                Some(NodeSignalKind::Draining { .. }) => continue,
                other => panic!("unexpected signal {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn final_drain_flushes_everything() {
        let mut f = fixture();
        for i in 0..100 {
            f.input.write(json!(i)).unwrap();
        }
        let blobs = f.manager.start(f.plan.clone()).await.unwrap();
        assert_eq!(blobs, vec![Token::overall_input(WorkerId(0))]);

        f.manager.drain_blob(blobs[0], true).unwrap();
        let first = f.signals.recv().await.unwrap();
        assert_eq!(first.kind, NodeSignalKind::Draining { blob: blobs[0] });
        assert_eq!(first.epoch, 3);
        let (data, stranded) = next_drained(&mut f.signals).await;
        assert!(data.is_empty());
        assert!(stranded.is_empty());
        assert_eq!(f.output.read_all(), (0..100).map(|i| json!(i)).collect::<Vec<_>>());
        assert!(f.input.is_empty());

        assert!(f.manager.drain_blob(blobs[0], true).is_err());
        f.manager.teardown().await;
        f.manager.teardown().await;
        assert!(!f.manager.is_running());
    }

    #[tokio::test]
    async fn intermediate_drain_keeps_every_item() {
        let mut f = fixture();
        for i in 0..500 {
            f.input.write(json!(i)).unwrap();
        }
        let blobs = f.manager.start(f.plan.clone()).await.unwrap();
        f.manager.drain_blob(blobs[0], false).unwrap();
        let (data, _) = next_drained(&mut f.signals).await;
        let leftover: usize = data.values().map(Vec::len).sum();
        assert_eq!(f.output.size() + f.input.size() + leftover, 500);
        f.manager.teardown().await;
    }

    #[tokio::test]
    async fn carried_items_run_first() {
        let mut f = fixture();
        f.plan
            .drain_data
            .insert(Token::edge(WorkerId(0), WorkerId(1)), vec![json!("inner")]);
        f.plan
            .drain_data
            .insert(Token::overall_input(WorkerId(0)), vec![json!("queued")]);
        f.input.write(json!("fresh")).unwrap();

        let blobs = f.manager.start(f.plan.clone()).await.unwrap();
        f.manager.drain_blob(blobs[0], true).unwrap();
        next_drained(&mut f.signals).await;
        assert_eq!(
            f.output.read_all(),
            vec![json!("inner"), json!("queued"), json!("fresh")]
        );
        f.manager.teardown().await;
    }

    #[test]
    fn full_sinks_leave_items_stranded() {
        let out = Token::overall_output(WorkerId(2));
        let edge = Token::edge(WorkerId(2), WorkerId(3));
        let buffer = |items: &[i64]| -> SharedBuffer {
            let b = ConcurrentBuffer::<Item>::unbounded();
            for i in items {
                b.write(json!(i)).unwrap();
            }
            Arc::new(b)
        };
        let sink: SharedBuffer = Arc::new(ConcurrentBuffer::<Item>::new(2));
        let outputs = [(out, buffer(&[1, 2, 3, 4])), (edge, buffer(&[9]))]
            .into_iter()
            .collect();
        let sinks = [(out, sink.clone())].into_iter().collect();

        let stranded = settle_outputs(&outputs, &sinks);
        assert_eq!(sink.read_all(), vec![json!(1), json!(2)]);
        assert_eq!(stranded.get(&out), Some(&vec![json!(3), json!(4)]));
        assert_eq!(stranded.get(&edge), Some(&vec![json!(9)]));
    }

    #[tokio::test]
    async fn refuses_a_second_start() {
        let f = fixture();
        f.manager.start(f.plan.clone()).await.unwrap();
        assert!(f.manager.start(f.plan.clone()).await.is_err());
        assert!(f.manager.drain_blob(Token::overall_input(WorkerId(7)), false).is_err());
        f.manager.teardown().await;
        assert!(f.manager.blob_ids().is_empty());
    }
}
