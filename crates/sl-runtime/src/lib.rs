//! Execution runtime for Sluice.
//!
//! Provides:
//! - Per-node blob and channel management
//! - The drain barrier and its event stream
//! - A controller that launches, reconfigures, and shuts down configurations
//! - A relay blob for running partitions without a stream compiler

pub mod config;
pub mod controller;
pub mod drainer;
pub mod manager;
pub mod node;
pub mod relay;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use controller::Controller;
pub use drainer::{
    blob_id, BlobDrainState, BlobGraph, DrainCycle, DrainCycleStatus, DrainEvent, Drainer,
};
pub use manager::BlobsManager;
pub use node::{merge_drain_data, DrainData, NodeHandle, NodePlan, NodeSignal, NodeSignalKind};
pub use relay::{codec_registry, RelayBlob, RelayBlobFactory, RELAY_CLASS};
pub use telemetry::{init_tracing, init_tracing_with};
