//! Sandbox blob that forwards items unchanged.
//!
//! [`RelayBlobFactory`] lets the runtime execute a partition without a
//! stream compiler: every blob copies each input item to each of its
//! outputs. Items left on internal edges by an earlier drain are emitted
//! first.

use parking_lot::Mutex;
use serde_json::{json, Value};
use sl_config::CodecRegistry;
use sl_types::{
    Blob, BlobContext, BlobFactory, Buffer, FactoryRef, Item, SharedBuffer, SlResult, StepOutcome,
    Token, WorkerId,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

pub const RELAY_CLASS: &str = "RelayBlobFactory";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayBlobFactory;

impl RelayBlobFactory {
    pub fn factory_ref() -> FactoryRef {
        FactoryRef::new(Self)
    }
}

impl BlobFactory for RelayBlobFactory {
    fn descriptor(&self) -> Value {
        json!({ "class": RELAY_CLASS })
    }

    fn make_blob(&self, ctx: BlobContext) -> SlResult<Arc<dyn Blob>> {
        Ok(Arc::new(RelayBlob::new(ctx)?))
    }
}

/// A codec registry with the defaults plus the relay factory.
pub fn codec_registry() -> CodecRegistry {
    let mut registry = CodecRegistry::with_defaults();
    registry.register_factory(RELAY_CLASS, |_| Ok(RelayBlobFactory::factory_ref()));
    registry
}

pub struct RelayBlob {
    id: Token,
    workers: BTreeSet<WorkerId>,
    input_tokens: BTreeSet<Token>,
    output_tokens: BTreeSet<Token>,
    inputs: Vec<SharedBuffer>,
    outputs: Vec<SharedBuffer>,
    cores: usize,
    pending: Mutex<VecDeque<Item>>,
    /// Writes an output refused, by output index. Retried before any new
    /// item is emitted.
    held: Mutex<VecDeque<(usize, Item)>>,
    next_input: Mutex<usize>,
    draining: AtomicBool,
}

impl RelayBlob {
    fn new(ctx: BlobContext) -> SlResult<Self> {
        let workers = ctx.worker_ids();
        let id = ctx
            .boundary
            .inputs
            .iter()
            .next()
            .copied()
            .ok_or_else(|| sl_types::internal_error!("blob over {workers:?} has no inputs"))?;
        let pending: VecDeque<Item> = ctx.initial_data.into_values().flatten().collect();
        Ok(Self {
            id,
            workers,
            input_tokens: ctx.inputs.keys().copied().collect(),
            output_tokens: ctx.outputs.keys().copied().collect(),
            inputs: ctx.inputs.into_values().collect(),
            outputs: ctx.outputs.into_values().collect(),
            cores: ctx.cores,
            pending: Mutex::new(pending),
            held: Mutex::new(VecDeque::new()),
            next_input: Mutex::new(0),
            draining: AtomicBool::new(false),
        })
    }

    /// Every output has room. Each output has this blob as its only writer,
    /// so the room cannot disappear before the write.
    fn outputs_ready(&self) -> bool {
        self.outputs.iter().all(|o| !o.is_full())
    }

    fn emit(&self, item: Item) {
        let Some((last, rest)) = self.outputs.split_last() else {
            return;
        };
        let mut held = self.held.lock();
        for (index, output) in rest.iter().enumerate() {
            if let Err(back) = output.write(item.clone()) {
                error!(blob = %self.id, output = index, "output refused an item it had room for");
                held.push_back((index, back));
            }
        }
        if let Err(back) = last.write(item) {
            error!(blob = %self.id, output = rest.len(), "output refused an item it had room for");
            held.push_back((rest.len(), back));
        }
    }

    /// Retries held writes in order. True once nothing is held.
    fn flush_held(&self) -> bool {
        let mut held = self.held.lock();
        while let Some((index, item)) = held.pop_front() {
            if let Err(back) = self.outputs[index].write(item) {
                held.push_front((index, back));
                return false;
            }
        }
        true
    }

    /// Reads the next item, taking inputs in turn.
    fn read_input(&self) -> Option<Item> {
        let mut next = self.next_input.lock();
        for offset in 0..self.inputs.len() {
            let index = (*next + offset) % self.inputs.len();
            if let Some(item) = self.inputs[index].read() {
                *next = (index + 1) % self.inputs.len();
                return Some(item);
            }
        }
        None
    }
}

impl Blob for RelayBlob {
    fn id(&self) -> Token {
        self.id
    }

    fn workers(&self) -> &BTreeSet<WorkerId> {
        &self.workers
    }

    fn inputs(&self) -> &BTreeSet<Token> {
        &self.input_tokens
    }

    fn outputs(&self) -> &BTreeSet<Token> {
        &self.output_tokens
    }

    fn core_count(&self) -> usize {
        self.cores
    }

    fn step(&self, core: usize) -> StepOutcome {
        let draining = self.draining.load(Ordering::Acquire);
        if core != 0 {
            return if draining {
                StepOutcome::Drained
            } else {
                StepOutcome::Idle
            };
        }
        if !self.flush_held() || !self.outputs_ready() {
            return StepOutcome::Idle;
        }
        let pending = self.pending.lock().pop_front();
        if let Some(item) = pending.or_else(|| self.read_input()) {
            self.emit(item);
            return StepOutcome::Progress;
        }
        if draining {
            StepOutcome::Drained
        } else {
            StepOutcome::Idle
        }
    }

    fn drain(&self) {
        self.draining.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_types::{BoundaryTokens, ConcurrentBuffer};

    fn context(capacity: usize) -> (BlobContext, SharedBuffer, SharedBuffer) {
        let input: SharedBuffer = Arc::new(ConcurrentBuffer::<Item>::new(capacity));
        let output: SharedBuffer = Arc::new(ConcurrentBuffer::<Item>::new(capacity));
        let in_token = Token::overall_input(WorkerId(0));
        let out_token = Token::overall_output(WorkerId(1));
        let mut boundary = BoundaryTokens::default();
        boundary.inputs.insert(in_token);
        boundary.outputs.insert(out_token);
        let internal = Token::edge(WorkerId(0), WorkerId(1));
        boundary.internal.insert(internal);
        let ctx = BlobContext {
            workers: Vec::new(),
            cores: 2,
            boundary,
            inputs: [(in_token, input.clone())].into_iter().collect(),
            outputs: [(out_token, output.clone())].into_iter().collect(),
            initial_data: [(internal, vec![json!("left over")])].into_iter().collect(),
        };
        (ctx, input, output)
    }

    #[test]
    fn forwards_leftovers_then_inputs() {
        let (ctx, input, output) = context(8);
        let blob = RelayBlobFactory.make_blob(ctx).unwrap();
        input.write(json!(1)).unwrap();
        input.write(json!(2)).unwrap();
        while blob.step(0) == StepOutcome::Progress {}
        assert_eq!(output.read_all(), vec![json!("left over"), json!(1), json!(2)]);
        assert_eq!(blob.step(1), StepOutcome::Idle);
    }

    #[test]
    fn drains_after_flushing_inputs() {
        let (ctx, input, output) = context(2);
        let blob = RelayBlobFactory.make_blob(ctx).unwrap();
        input.write(json!(1)).unwrap();
        blob.drain();
        assert_eq!(blob.step(1), StepOutcome::Drained);
        assert_eq!(blob.step(0), StepOutcome::Progress);
        // Output full: cannot finish until it is emptied.
        assert_eq!(blob.step(0), StepOutcome::Progress);
        assert_eq!(blob.step(0), StepOutcome::Idle);
        output.read_all();
        assert_eq!(blob.step(0), StepOutcome::Drained);
    }

    #[test]
    fn refused_writes_are_held_and_retried() {
        let (ctx, input, output) = context(1);
        let blob = RelayBlob::new(ctx).unwrap();
        output.write(json!("taken")).unwrap();
        blob.emit(json!("late"));
        input.write(json!("next")).unwrap();

        assert_eq!(blob.step(0), StepOutcome::Idle);
        assert_eq!(output.read_all(), vec![json!("taken")]);
        blob.drain();
        assert_eq!(blob.step(0), StepOutcome::Idle);
        assert_eq!(output.read_all(), vec![json!("late")]);
        assert_eq!(blob.step(0), StepOutcome::Progress);
        assert_eq!(output.read_all(), vec![json!("left over")]);
    }

    #[test]
    fn relay_factory_survives_the_codec() {
        let registry = codec_registry();
        let factory = RelayBlobFactory::factory_ref();
        let decoded = registry.decode_factory(&registry.encode_factory(&factory)).unwrap();
        assert_eq!(decoded, factory);
    }
}
