//! # sl-config
//!
//! Tunable configurations for Sluice: immutable parameters, named
//! configuration trees, the worker-to-blob placement parameter, and the
//! structured-document codec registry.

mod codec;
mod configuration;
mod parameter;
mod partition;

pub use codec::{CodecRegistry, FactoryDecoder};
pub use configuration::{Configuration, ConfigurationBuilder};
pub use parameter::{
    AnySwitch, FromParameter, IntParameter, Parameter, SwitchParameter, SwitchValue,
};
pub use partition::{BlobSpecifier, PartitionBuilder, PartitionParameter};
