//! Cluster-wide coordinator.
//!
//! The [`Controller`] holds one [`NodeHandle`] per machine, launches the
//! blobs of a [`Configuration`], and runs the drain barrier: no blob of the
//! next configuration starts until every blob of the current one has
//! drained. Items left behind by an intermediate drain are carried into the
//! next configuration.
//!
//! The graph's overall inputs and outputs live in controller-side buffers
//! that outlive any single configuration; feed them with
//! [`Controller::push_input`] and collect with [`Controller::take_output`].

use crossbeam_channel::Sender;
use sl_channel::ChannelDirectory;
use sl_config::{Configuration, PartitionParameter};
use sl_types::{
    construction_error, internal_error, Buffer, ConcurrentBuffer, DrainError, Item, SharedBuffer,
    SlResult, StreamGraph, Token,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::drainer::{BlobGraph, DrainCycle, DrainEvent, Drainer};
use crate::manager::BlobsManager;
use crate::node::{merge_drain_data, DrainData, NodeHandle, NodePlan, NodeSignal, NodeSignalKind};

struct ActiveConfiguration {
    epoch: u64,
    configuration: Configuration,
    drainer: Drainer,
}

pub struct Controller {
    config: RuntimeConfig,
    graph: Arc<StreamGraph>,
    nodes: Vec<Arc<dyn NodeHandle>>,
    directory: Arc<ChannelDirectory>,
    signal_tx: UnboundedSender<NodeSignal>,
    signal_rx: UnboundedReceiver<NodeSignal>,
    inputs: BTreeMap<Token, SharedBuffer>,
    outputs: BTreeMap<Token, SharedBuffer>,
    active: Option<ActiveConfiguration>,
    /// Number of launches so far; the active configuration's epoch.
    launches: u64,
    /// Input-buffer leftovers of the last intermediate drain.
    carried: DrainData,
    /// Items output channels could not deliver in the last drain. They
    /// follow `carried` on the same edge.
    stranded: DrainData,
    last_cycle: Option<DrainCycle>,
    observer: Option<Sender<DrainEvent>>,
}

impl Controller {
    pub fn new(graph: StreamGraph, config: RuntimeConfig) -> Self {
        let (signal_tx, signal_rx) = unbounded_channel();
        let mut inputs = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for worker in graph.workers().filter_map(|w| w.id()) {
            if graph.predecessors(worker).is_empty() {
                inputs.insert(Token::overall_input(worker), unbounded_buffer());
            }
            if graph.successors(worker).is_empty() {
                outputs.insert(Token::overall_output(worker), unbounded_buffer());
            }
        }
        Self {
            config,
            graph: Arc::new(graph),
            nodes: Vec::new(),
            directory: Arc::new(ChannelDirectory::new()),
            signal_tx,
            signal_rx,
            inputs,
            outputs,
            active: None,
            launches: 0,
            carried: DrainData::new(),
            stranded: DrainData::new(),
            last_cycle: None,
            observer: None,
        }
    }

    /// Publishes drain progress of every later configuration on `events`.
    pub fn with_observer(mut self, events: Sender<DrainEvent>) -> Self {
        self.observer = Some(events);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn graph(&self) -> &StreamGraph {
        &self.graph
    }

    /// Directory through which this controller's nodes find each other.
    pub fn directory(&self) -> Arc<ChannelDirectory> {
        self.directory.clone()
    }

    /// Sender that node implementations report progress on.
    pub fn signal_sender(&self) -> UnboundedSender<NodeSignal> {
        self.signal_tx.clone()
    }

    // ----- Nodes -----

    /// Registers the handle for the next machine index.
    pub fn add_node(&mut self, node: Arc<dyn NodeHandle>) -> SlResult<()> {
        if node.node_id() != self.nodes.len() {
            return Err(internal_error!(
                "node {} registered in slot {}",
                node.node_id(),
                self.nodes.len()
            ));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Adds `count` in-process nodes sharing this controller's directory.
    pub fn add_local_nodes(&mut self, count: usize) -> SlResult<()> {
        for _ in 0..count {
            let manager = BlobsManager::new(
                self.nodes.len(),
                self.config.clone(),
                self.directory.clone(),
                self.signal_tx.clone(),
            );
            self.add_node(Arc::new(manager))?;
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ----- Overall input and output -----

    pub fn input_tokens(&self) -> Vec<Token> {
        self.inputs.keys().copied().collect()
    }

    pub fn output_tokens(&self) -> Vec<Token> {
        self.outputs.keys().copied().collect()
    }

    pub fn push_input(&self, token: Token, item: Item) -> SlResult<()> {
        let buffer = self
            .inputs
            .get(&token)
            .ok_or_else(|| construction_error!("{token} is not an input of the stream graph"))?;
        buffer
            .write(item)
            .map_err(|_| internal_error!("input buffer for {token} is full"))
    }

    /// Removes and returns everything the graph has produced on `token`.
    pub fn take_output(&self, token: Token) -> Vec<Item> {
        self.outputs
            .get(&token)
            .map(|b| b.read_all())
            .unwrap_or_default()
    }

    // ----- Configurations -----

    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.active.as_ref().map(|a| &a.configuration)
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// The drain cycle of the active configuration, or else the last one.
    pub fn last_cycle(&self) -> Option<&DrainCycle> {
        self.active
            .as_ref()
            .and_then(|a| a.drainer.cycle())
            .or(self.last_cycle.as_ref())
    }

    /// Extracts and checks the placement `configuration` asks for.
    pub fn validate(&self, configuration: &Configuration) -> SlResult<PartitionParameter> {
        let name = &self.config.partition_parameter;
        let partition = configuration
            .get::<PartitionParameter>(name)?
            .ok_or_else(|| construction_error!("configuration has no partition parameter {name}"))?
            .clone();
        if partition.machine_count() > self.nodes.len() {
            return Err(construction_error!(
                "partition needs {} machines but {} nodes are registered",
                partition.machine_count(),
                self.nodes.len()
            )
            .into());
        }
        let unassigned = partition.unassigned_workers(&self.graph);
        if !unassigned.is_empty() {
            return Err(construction_error!("workers {unassigned:?} are not placed in any blob").into());
        }
        BlobGraph::new(&partition, &self.graph)?;
        Ok(partition)
    }

    /// Starts every blob of `configuration`, seeded with the items carried
    /// over from the previous drain.
    pub async fn launch(&mut self, configuration: &Configuration) -> SlResult<()> {
        if self.active.is_some() {
            return Err(internal_error!("a configuration is already running"));
        }
        let partition = self.validate(configuration)?;
        let blob_graph = BlobGraph::new(&partition, &self.graph)?;

        let mut drain_data = std::mem::take(&mut self.carried);
        merge_drain_data(&mut drain_data, std::mem::take(&mut self.stranded));
        self.launches += 1;
        let epoch = self.launches;
        let plan = NodePlan {
            epoch,
            graph: self.graph.clone(),
            partition: partition.clone(),
            drain_data,
            overall_inputs: self.inputs.clone(),
            overall_outputs: self.outputs.clone(),
        };

        let mut started = 0;
        for node in self.nodes.iter().take(partition.machine_count()) {
            match node.launch(plan.clone()).await {
                Ok(blobs) => {
                    debug!(node = node.node_id(), blobs = blobs.len(), "node launched");
                    started += blobs.len();
                }
                Err(e) => {
                    error!(node = node.node_id(), error = %e, "node failed to launch");
                    self.stop_nodes().await;
                    self.carried = plan.drain_data;
                    return Err(e);
                }
            }
        }

        let mut drainer = Drainer::new(blob_graph);
        if let Some(events) = &self.observer {
            drainer = drainer.with_observer(events.clone());
        }
        self.active = Some(ActiveConfiguration {
            epoch,
            configuration: configuration.clone(),
            drainer,
        });
        info!(
            epoch,
            machines = partition.machine_count(),
            blobs = started,
            "configuration launched"
        );
        Ok(())
    }

    /// Asks the node that owns `blob` to drain it. This only sends the
    /// request; the barrier, and the ordering between blobs, is run by
    /// [`Controller::drain`].
    pub async fn drain_blob(&self, blob: Token, is_final: bool) -> SlResult<()> {
        let active = self.active.as_ref().ok_or(DrainError::NotRunning)?;
        let machine = active
            .drainer
            .graph()
            .machine(&blob)
            .ok_or(DrainError::UnknownBlob { blob })?;
        let node = self
            .nodes
            .get(machine)
            .ok_or_else(|| internal_error!("no node for machine {machine}"))?;
        node.drain(blob, is_final).await
    }

    /// Runs one drain cycle over every blob of the active configuration and
    /// returns once all have drained. Fails with [`DrainError::Timeout`] when
    /// the configured deadline passes first.
    pub async fn drain(&mut self, is_final: bool) -> SlResult<()> {
        let active = self.active.as_mut().ok_or(DrainError::NotRunning)?;
        let first = active.drainer.start(is_final)?;
        for blob in first {
            self.drain_blob(blob, is_final).await?;
        }
        let deadline = self.config.drain_timeout().map(|d| Instant::now() + d);

        while !self.draining_finished() {
            let received = match deadline {
                Some(at) => match timeout_at(at, self.signal_rx.recv()).await {
                    Ok(signal) => signal,
                    Err(_) => {
                        let pending = self.fail_cycle("drain deadline passed");
                        return Err(DrainError::Timeout { pending }.into());
                    }
                },
                None => self.signal_rx.recv().await,
            };
            let Some(signal) = received else {
                return Err(internal_error!("node signal channel closed"));
            };
            for blob in self.handle_signal(signal)? {
                self.drain_blob(blob, is_final).await?;
            }
        }
        Ok(())
    }

    /// Applies one node report and returns the blobs to request next.
    fn handle_signal(&mut self, signal: NodeSignal) -> SlResult<Vec<Token>> {
        let active = self.active.as_mut().ok_or(DrainError::NotRunning)?;
        if signal.epoch != active.epoch {
            warn!(
                node = signal.node,
                epoch = signal.epoch,
                active = active.epoch,
                kind = ?signal.kind,
                "dropping a report from an earlier launch"
            );
            return Ok(Vec::new());
        }
        let outcome = match signal.kind {
            NodeSignalKind::Draining { blob } => active.drainer.draining(blob).map(|_| Vec::new()),
            NodeSignalKind::Drained {
                blob,
                data,
                stranded,
            } => {
                merge_drain_data(&mut self.carried, data);
                let stranded = deliver_outputs(&self.outputs, stranded);
                merge_drain_data(&mut self.stranded, stranded);
                active.drainer.drained(blob)
            }
            NodeSignalKind::Failed { blob, message } => {
                error!(node = signal.node, blob = ?blob, %message, "node reported failure");
                self.fail_cycle(&message);
                return Err(DrainError::NodeFailed {
                    node: signal.node,
                    message,
                }
                .into());
            }
        };
        match outcome {
            Ok(next) => Ok(next),
            Err(DrainError::UnknownBlob { blob }) => {
                warn!(node = signal.node, %blob, "signal for a blob outside the active configuration");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fail_cycle(&mut self, error: &str) -> Vec<Token> {
        match self.active.as_mut() {
            Some(active) => {
                active.drainer.fail(error.to_string());
                active.drainer.pending()
            }
            None => Vec::new(),
        }
    }

    /// True once every blob of the active configuration has drained.
    pub fn draining_finished(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.drainer.is_finished())
            .unwrap_or(false)
    }

    /// Tears down the active configuration without draining it.
    pub async fn stop(&mut self) {
        self.stop_nodes().await;
        if let Some(active) = self.active.take() {
            self.last_cycle = active.drainer.cycle().cloned();
            info!("configuration stopped");
        }
    }

    async fn stop_nodes(&self) {
        for node in &self.nodes {
            if let Err(e) = node.stop().await {
                warn!(node = node.node_id(), error = %e, "node stop failed");
            }
        }
    }

    /// Drains the active configuration without loss, tears it down, and
    /// launches `next` with the drained items.
    pub async fn reconfigure(&mut self, next: &Configuration) -> SlResult<()> {
        self.validate(next)?;
        self.drain(false).await?;
        self.stop().await;
        info!(
            carried = self.carried.values().map(Vec::len).sum::<usize>(),
            "reconfiguring"
        );
        self.launch(next).await
    }

    /// Final drain, then teardown. The configuration is torn down even when
    /// the drain fails.
    pub async fn shutdown(&mut self) -> SlResult<()> {
        if self.active.is_none() {
            return Ok(());
        }
        let drained = self.drain(true).await;
        self.stop().await;
        let mut discarded = std::mem::take(&mut self.carried);
        merge_drain_data(&mut discarded, std::mem::take(&mut self.stranded));
        let lost: usize = discarded.values().map(Vec::len).sum();
        if lost > 0 {
            warn!(items = lost, "items discarded at shutdown");
        }
        info!("controller shut down");
        drained
    }
}

/// Hands stranded overall-output items to the controller's sinks and
/// returns the rest.
fn deliver_outputs(outputs: &BTreeMap<Token, SharedBuffer>, stranded: DrainData) -> DrainData {
    let mut rest = DrainData::new();
    for (token, items) in stranded {
        let Some(sink) = outputs.get(&token) else {
            rest.insert(token, items);
            continue;
        };
        for item in items {
            if let Err(back) = sink.write(item) {
                rest.entry(token).or_default().push(back);
            }
        }
    }
    rest
}

fn unbounded_buffer() -> SharedBuffer {
    Arc::new(ConcurrentBuffer::<Item>::unbounded())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use serde_json::{json, Value};
    use sl_config::ConfigurationBuilder;
    use sl_types::{Blob, BlobContext, BlobFactory, FactoryRef, StepOutcome, WorkerId};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::drainer::DrainCycleStatus;
    use crate::relay::RelayBlobFactory;

    fn pipeline() -> StreamGraph {
        StreamGraph::pipeline(&["source", "scale", "filter", "sink"]).unwrap()
    }

    fn configuration(factory: &FactoryRef, placement: &[(usize, Vec<u32>)]) -> Configuration {
        let machines = placement.iter().map(|(m, _)| m + 1).max().unwrap_or(1);
        let mut partition = PartitionParameter::builder("partition", vec![2; machines]).unwrap();
        partition.add_blob_factory(factory.clone()).unwrap();
        for (machine, workers) in placement {
            partition
                .add_blob_ids(*machine, 1, factory, workers.iter().map(|&w| WorkerId(w)))
                .unwrap();
        }
        let mut builder = ConfigurationBuilder::default();
        builder.add_parameter(partition.build().unwrap()).unwrap();
        builder.build()
    }

    fn numbers(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(|i| json!(i)).collect()
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::default().with_channel(
            sl_channel::ChannelConfig::default().with_reconnect_wait(Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn pipeline_across_two_nodes_delivers_in_order() {
        let relay = RelayBlobFactory::factory_ref();
        let mut controller = Controller::new(pipeline(), config());
        controller.add_local_nodes(2).unwrap();
        let input = controller.input_tokens()[0];
        let output = controller.output_tokens()[0];

        controller
            .launch(&configuration(&relay, &[(0, vec![0, 1]), (1, vec![2, 3])]))
            .await
            .unwrap();
        for i in 0..200 {
            controller.push_input(input, json!(i)).unwrap();
        }
        controller.shutdown().await.unwrap();

        assert_eq!(controller.take_output(output), numbers(0..200));
        assert!(!controller.is_running());
        assert_eq!(
            controller.last_cycle().map(|c| c.status),
            Some(DrainCycleStatus::Completed)
        );
        assert!(controller.directory().is_empty());
    }

    #[tokio::test]
    async fn reconfigure_keeps_every_item() {
        let relay = RelayBlobFactory::factory_ref();
        let (tx, rx) = unbounded();
        let mut controller = Controller::new(pipeline(), config()).with_observer(tx);
        controller.add_local_nodes(2).unwrap();
        let input = controller.input_tokens()[0];
        let output = controller.output_tokens()[0];

        controller
            .launch(&configuration(&relay, &[(0, vec![0, 1, 2, 3])]))
            .await
            .unwrap();
        for i in 0..300 {
            controller.push_input(input, json!(i)).unwrap();
        }
        controller
            .reconfigure(&configuration(&relay, &[(0, vec![0]), (1, vec![1, 2]), (0, vec![3])]))
            .await
            .unwrap();
        for i in 300..600 {
            controller.push_input(input, json!(i)).unwrap();
        }
        controller.shutdown().await.unwrap();

        assert_eq!(controller.take_output(output), numbers(0..600));
        let cycles = rx
            .try_iter()
            .filter(|e| matches!(e, DrainEvent::AllDrained { .. }))
            .count();
        assert_eq!(cycles, 2);
    }

    /// Blobs that never move items. With a `linger` they finish that long
    /// after being told to drain; without one they never finish.
    #[derive(Debug, Default)]
    struct StuckFactory {
        linger: Option<Duration>,
        steps: Arc<AtomicUsize>,
    }

    impl StuckFactory {
        fn lingering(linger: Duration) -> Self {
            Self {
                linger: Some(linger),
                ..Default::default()
            }
        }
    }

    struct StuckBlob {
        id: Token,
        workers: BTreeSet<WorkerId>,
        inputs: BTreeSet<Token>,
        outputs: BTreeSet<Token>,
        linger: Option<Duration>,
        drained_at: Mutex<Option<std::time::Instant>>,
        steps: Arc<AtomicUsize>,
    }

    impl BlobFactory for StuckFactory {
        fn descriptor(&self) -> Value {
            json!({
                "class": "StuckFactory",
                "linger_ms": self.linger.map(|d| d.as_millis() as u64),
            })
        }

        fn make_blob(&self, ctx: BlobContext) -> SlResult<Arc<dyn Blob>> {
            Ok(Arc::new(StuckBlob {
                id: *ctx.boundary.inputs.iter().next().unwrap(),
                workers: ctx.worker_ids(),
                inputs: ctx.inputs.keys().copied().collect(),
                outputs: ctx.outputs.keys().copied().collect(),
                linger: self.linger,
                drained_at: Mutex::new(None),
                steps: self.steps.clone(),
            }))
        }
    }

    impl Blob for StuckBlob {
        fn id(&self) -> Token {
            self.id
        }
        fn workers(&self) -> &BTreeSet<WorkerId> {
            &self.workers
        }
        fn inputs(&self) -> &BTreeSet<Token> {
            &self.inputs
        }
        fn outputs(&self) -> &BTreeSet<Token> {
            &self.outputs
        }
        fn core_count(&self) -> usize {
            1
        }
        fn step(&self, _core: usize) -> StepOutcome {
            self.steps.fetch_add(1, Ordering::Relaxed);
            match (self.linger, *self.drained_at.lock()) {
                (Some(linger), Some(at)) if at.elapsed() >= linger => StepOutcome::Drained,
                _ => StepOutcome::Idle,
            }
        }
        fn drain(&self) {
            self.drained_at.lock().get_or_insert_with(std::time::Instant::now);
        }
    }

    #[tokio::test]
    async fn drain_deadline_names_pending_blobs() {
        let stuck = FactoryRef::new(StuckFactory::default());
        let mut controller = Controller::new(
            pipeline(),
            config().with_drain_timeout(Duration::from_millis(200)),
        );
        controller.add_local_nodes(1).unwrap();
        controller
            .launch(&configuration(&stuck, &[(0, vec![0, 1, 2, 3])]))
            .await
            .unwrap();
        assert!(matches!(
            controller.drain_blob(Token::overall_input(WorkerId(3)), false).await,
            Err(sl_types::SlError::Drain(DrainError::UnknownBlob { .. }))
        ));

        let err = controller.drain(false).await.unwrap_err();
        let blob = Token::overall_input(WorkerId(0));
        assert!(matches!(
            err,
            sl_types::SlError::Drain(DrainError::Timeout { ref pending }) if pending == &vec![blob]
        ));
        assert!(!controller.draining_finished());
        assert!(matches!(
            controller.drain(false).await,
            Err(sl_types::SlError::Drain(DrainError::NotRunning))
        ));
        controller.stop().await;
        assert_eq!(
            controller.last_cycle().map(|c| c.status),
            Some(DrainCycleStatus::Failed)
        );
    }

    #[tokio::test]
    async fn late_reports_do_not_drain_the_next_configuration() {
        let lingering = FactoryRef::new(StuckFactory::lingering(Duration::from_millis(250)));
        let stuck = FactoryRef::new(StuckFactory::default());
        let mut controller = Controller::new(
            pipeline(),
            config().with_drain_timeout(Duration::from_millis(100)),
        );
        controller.add_local_nodes(1).unwrap();
        let all = [(0, vec![0, 1, 2, 3])];

        controller.launch(&configuration(&lingering, &all)).await.unwrap();
        assert!(matches!(
            controller.drain(false).await,
            Err(sl_types::SlError::Drain(DrainError::Timeout { .. }))
        ));
        // The first blob reports drained while nobody is listening.
        tokio::time::sleep(Duration::from_millis(400)).await;
        controller.stop().await;

        // Same blob id, but this one never drains.
        controller.launch(&configuration(&stuck, &all)).await.unwrap();
        assert!(matches!(
            controller.drain(false).await,
            Err(sl_types::SlError::Drain(DrainError::Timeout { .. }))
        ));
        assert!(!controller.draining_finished());
        controller.stop().await;
    }

    #[tokio::test]
    async fn dropping_a_running_controller_halts_its_cores() {
        let factory = StuckFactory::default();
        let steps = factory.steps.clone();
        let mut controller = Controller::new(pipeline(), config());
        controller.add_local_nodes(1).unwrap();
        controller
            .launch(&configuration(&FactoryRef::new(factory), &[(0, vec![0, 1, 2, 3])]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(steps.load(Ordering::Relaxed) > 0);

        drop(controller);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = steps.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(steps.load(Ordering::Relaxed), settled);
    }

    /// 0 -> 1 -> 2 -> 3, with 2 feeding back into 1.
    fn feedback() -> StreamGraph {
        let mut b = StreamGraph::builder();
        let ids: Vec<WorkerId> = ["source", "merge", "split", "sink"]
            .into_iter()
            .map(|n| b.add_worker(n, sl_types::Rates::identity()))
            .collect();
        b.connect(ids[0], ids[1]).unwrap();
        b.connect(ids[1], ids[2]).unwrap();
        b.connect(ids[2], ids[1]).unwrap();
        b.connect(ids[2], ids[3]).unwrap();
        b.build().unwrap()
    }

    #[tokio::test]
    async fn feedback_loop_across_two_nodes_drains() {
        let relay = RelayBlobFactory::factory_ref();
        let mut controller = Controller::new(
            feedback(),
            config().with_drain_timeout(Duration::from_secs(10)),
        );
        controller.add_local_nodes(2).unwrap();
        let input = controller.input_tokens()[0];
        let output = controller.output_tokens()[0];

        controller
            .launch(&configuration(&relay, &[(0, vec![0, 1]), (1, vec![2, 3])]))
            .await
            .unwrap();
        for i in 0..10 {
            controller.push_input(input, json!(i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        controller.drain(false).await.unwrap();
        assert!(controller.draining_finished());
        controller.stop().await;

        // Each item has come round the loop at least once.
        let seen: BTreeSet<i64> = controller
            .take_output(output)
            .iter()
            .filter_map(Value::as_i64)
            .collect();
        assert_eq!(seen, (0..10).collect());
        assert!(controller.directory().is_empty());
    }

    #[test]
    fn stranded_outputs_go_to_the_sinks() {
        let out = Token::overall_output(WorkerId(3));
        let edge = Token::edge(WorkerId(1), WorkerId(2));
        let sink = unbounded_buffer();
        let outputs = [(out, sink.clone())].into_iter().collect();
        let stranded = [(out, vec![json!(1)]), (edge, vec![json!(2)])]
            .into_iter()
            .collect();

        let rest = deliver_outputs(&outputs, stranded);
        assert_eq!(sink.read_all(), vec![json!(1)]);
        assert_eq!(rest.into_iter().collect::<Vec<_>>(), vec![(edge, vec![json!(2)])]);
    }

    #[tokio::test]
    async fn launch_rejects_bad_configurations() {
        let relay = RelayBlobFactory::factory_ref();
        let mut controller = Controller::new(pipeline(), config());
        controller.add_local_nodes(1).unwrap();

        let two_machines = configuration(&relay, &[(0, vec![0, 1]), (1, vec![2, 3])]);
        assert!(controller.launch(&two_machines).await.is_err());
        let partial = configuration(&relay, &[(0, vec![0, 1])]);
        assert!(controller.launch(&partial).await.is_err());
        assert!(controller.launch(&Configuration::default()).await.is_err());
        assert!(matches!(
            controller.drain(true).await,
            Err(sl_types::SlError::Drain(DrainError::NotRunning))
        ));
        assert!(controller.push_input(Token::overall_input(WorkerId(2)), json!(1)).is_err());
        assert!(!controller.is_running());
    }
}
