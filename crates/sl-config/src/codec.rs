//! Structured-document encoding of configurations.
//!
//! Every document is a JSON object carrying a `class` discriminator. The
//! [`CodecRegistry`] maps discriminators to encode/decode functions: one
//! entry per parameter variant, one per switch element type (keyed by
//! `universeType`), and one per blob factory class. Registries are plain
//! values; [`CodecRegistry::global`] holds the process-wide one used by
//! [`Configuration::to_json`] and [`Configuration::from_json`].
//!
//! Documents also carry `__module__`/`__class__` metadata for external
//! tooling. Decoders ignore any field they do not need.

use serde_json::{json, Map, Value};
use sl_types::{document_error, ConfigError, FactoryRef, PlacementError, WorkerId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::configuration::Configuration;
use crate::parameter::{
    AnySwitch, FromParameter, IntParameter, Parameter, SwitchParameter, SwitchValue, SWITCH_CLASS,
};
use crate::partition::{BlobSpecifier, PartitionParameter};

const CONFIGURATION_CLASS: &str = "Configuration";
const BLOB_SPECIFIER_CLASS: &str = "BlobSpecifier";

type EncodeFn = fn(&Parameter, &CodecRegistry) -> Result<Value, ConfigError>;
type DecodeFn = fn(&Value, &CodecRegistry) -> Result<Parameter, ConfigError>;
type SwitchDecodeFn = fn(&str, &Value, usize) -> Result<AnySwitch, ConfigError>;

/// Rebuilds a blob factory from its descriptor.
pub type FactoryDecoder = Arc<dyn Fn(&Value) -> Result<FactoryRef, ConfigError> + Send + Sync>;

#[derive(Clone, Copy)]
struct ParameterCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

static GLOBAL: OnceLock<CodecRegistry> = OnceLock::new();

/// Static table from document discriminators to codecs.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    parameters: HashMap<&'static str, ParameterCodec>,
    switch_types: HashMap<&'static str, SwitchDecodeFn>,
    factories: HashMap<String, FactoryDecoder>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Codecs for every parameter variant and the built-in switch element
    /// types. No factory classes are registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_parameter(IntParameter::CLASS, encode_int, decode_int);
        registry.register_parameter(SWITCH_CLASS, encode_switch, decode_switch);
        registry.register_parameter(PartitionParameter::CLASS, encode_partition, decode_partition);
        registry.register_switch_type::<bool>();
        registry.register_switch_type::<i32>();
        registry.register_switch_type::<i64>();
        registry.register_switch_type::<u32>();
        registry.register_switch_type::<String>();
        registry
    }

    /// The process-wide registry. Defaults to [`with_defaults`](Self::with_defaults)
    /// unless [`install_global`](Self::install_global) ran first.
    pub fn global() -> &'static CodecRegistry {
        GLOBAL.get_or_init(Self::with_defaults)
    }

    /// Installs `registry` as the process-wide registry. Fails, handing the
    /// registry back, once the global registry has been set or read.
    pub fn install_global(registry: CodecRegistry) -> Result<(), CodecRegistry> {
        GLOBAL.set(registry)
    }

    fn register_parameter(&mut self, class: &'static str, encode: EncodeFn, decode: DecodeFn) {
        self.parameters.insert(class, ParameterCodec { encode, decode });
    }

    /// Makes switches over `T` decodable.
    pub fn register_switch_type<T: SwitchValue>(&mut self) -> &mut Self {
        self.switch_types.insert(T::TYPE_NAME, decode_switch_of::<T>);
        self
    }

    /// Makes factories whose descriptor has `class` decodable.
    pub fn register_factory<F>(&mut self, class: impl Into<String>, decoder: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<FactoryRef, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Arc::new(decoder));
        self
    }

    pub fn encode_parameter(&self, parameter: &Parameter) -> Result<Value, ConfigError> {
        let class = parameter.class_name();
        let codec = self.parameter_codec(class)?;
        (codec.encode)(parameter, self)
    }

    pub fn decode_parameter(&self, doc: &Value) -> Result<Parameter, ConfigError> {
        let class = str_field(doc, "class")?;
        let codec = self.parameter_codec(class)?;
        (codec.decode)(doc, self)
    }

    pub fn encode_configuration(&self, config: &Configuration) -> Result<Value, ConfigError> {
        let mut params = Map::new();
        for (name, parameter) in config.parameters() {
            params.insert(name.clone(), self.encode_parameter(parameter)?);
        }
        let mut subconfigs = Map::new();
        for (name, sub) in config.subconfigurations() {
            subconfigs.insert(name.clone(), self.encode_configuration(sub)?);
        }
        Ok(json!({
            "class": CONFIGURATION_CLASS,
            "params": params,
            "subconfigs": subconfigs,
            "__module__": "configuration",
            "__class__": CONFIGURATION_CLASS,
        }))
    }

    pub fn decode_configuration(&self, doc: &Value) -> Result<Configuration, ConfigError> {
        check_class(doc, CONFIGURATION_CLASS)?;
        let mut builder = Configuration::builder();
        for (name, param_doc) in object_field(doc, "params")? {
            let parameter = self.decode_parameter(param_doc)?;
            if parameter.name() != name {
                return Err(document_error!(
                    "parameter {} stored under key {name}",
                    parameter.name()
                ));
            }
            builder.add_parameter(parameter)?;
        }
        for (name, sub_doc) in object_field(doc, "subconfigs")? {
            builder.add_subconfiguration(name.clone(), self.decode_configuration(sub_doc)?)?;
        }
        Ok(builder.build())
    }

    pub fn encode_factory(&self, factory: &FactoryRef) -> Value {
        factory.descriptor()
    }

    pub fn decode_factory(&self, doc: &Value) -> Result<FactoryRef, ConfigError> {
        let class = str_field(doc, "class")?;
        let decoder = self
            .factories
            .get(class)
            .ok_or_else(|| ConfigError::UnknownDiscriminator {
                class: class.to_string(),
            })?;
        decoder(doc)
    }

    fn parameter_codec(&self, class: &str) -> Result<ParameterCodec, ConfigError> {
        self.parameters
            .get(class)
            .copied()
            .ok_or_else(|| ConfigError::UnknownDiscriminator {
                class: class.to_string(),
            })
    }

    fn switch_decoder(&self, type_name: &str) -> Result<SwitchDecodeFn, ConfigError> {
        self.switch_types
            .get(type_name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownDiscriminator {
                class: format!("{SWITCH_CLASS}<{type_name}>"),
            })
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .field("switch_types", &self.switch_types.keys().collect::<Vec<_>>())
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Configuration {
    /// Encodes with the global registry.
    pub fn to_json(&self) -> Result<Value, ConfigError> {
        self.to_json_with(CodecRegistry::global())
    }

    /// Decodes with the global registry.
    pub fn from_json(doc: &Value) -> Result<Self, ConfigError> {
        Self::from_json_with(doc, CodecRegistry::global())
    }

    pub fn to_json_with(&self, registry: &CodecRegistry) -> Result<Value, ConfigError> {
        registry.encode_configuration(self)
    }

    pub fn from_json_with(doc: &Value, registry: &CodecRegistry) -> Result<Self, ConfigError> {
        registry.decode_configuration(doc)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        let doc = self.to_json()?;
        serde_json::to_string(&doc).map_err(|e| document_error!("{e}"))
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let doc: Value = serde_json::from_str(text).map_err(|e| document_error!("{e}"))?;
        Self::from_json(&doc)
    }
}

// -- field helpers ----------------------------------------------------------

fn field<'a>(doc: &'a Value, key: &str) -> Result<&'a Value, ConfigError> {
    doc.get(key)
        .ok_or_else(|| document_error!("missing field {key}"))
}

fn str_field<'a>(doc: &'a Value, key: &str) -> Result<&'a str, ConfigError> {
    field(doc, key)?
        .as_str()
        .ok_or_else(|| document_error!("field {key} is not a string"))
}

fn i64_field(doc: &Value, key: &str) -> Result<i64, ConfigError> {
    field(doc, key)?
        .as_i64()
        .ok_or_else(|| document_error!("field {key} is not an integer"))
}

fn i32_field(doc: &Value, key: &str) -> Result<i32, ConfigError> {
    let value = i64_field(doc, key)?;
    i32::try_from(value).map_err(|_| document_error!("field {key} out of range: {value}"))
}

fn usize_of(value: &Value, key: &str) -> Result<usize, ConfigError> {
    value
        .as_u64()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| document_error!("field {key} is not a non-negative integer"))
}

fn worker_of(value: &Value, key: &str) -> Result<WorkerId, ConfigError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .map(WorkerId)
        .ok_or_else(|| document_error!("field {key} is not a worker identifier"))
}

fn array_field<'a>(doc: &'a Value, key: &str) -> Result<&'a Vec<Value>, ConfigError> {
    field(doc, key)?
        .as_array()
        .ok_or_else(|| document_error!("field {key} is not an array"))
}

fn object_field<'a>(doc: &'a Value, key: &str) -> Result<&'a Map<String, Value>, ConfigError> {
    field(doc, key)?
        .as_object()
        .ok_or_else(|| document_error!("field {key} is not an object"))
}

fn check_class(doc: &Value, expected: &str) -> Result<(), ConfigError> {
    let class = str_field(doc, "class")?;
    if class != expected {
        return Err(document_error!("expected class {expected}, found {class}"));
    }
    Ok(())
}

fn wrong_variant(expected: &str, parameter: &Parameter) -> ConfigError {
    document_error!(
        "{expected} codec cannot encode {} {}",
        parameter.class_name(),
        parameter.name()
    )
}

fn invalid_placement(error: PlacementError) -> ConfigError {
    document_error!("invalid placement: {error}")
}

// -- IntParameter -----------------------------------------------------------

fn encode_int(parameter: &Parameter, _: &CodecRegistry) -> Result<Value, ConfigError> {
    let p = IntParameter::from_parameter(parameter)
        .ok_or_else(|| wrong_variant(IntParameter::CLASS, parameter))?;
    Ok(json!({
        "class": IntParameter::CLASS,
        "name": p.name(),
        "min": p.min(),
        "max": p.max(),
        "value": p.value(),
        "__module__": "parameters",
        "__class__": IntParameter::CLASS,
    }))
}

fn decode_int(doc: &Value, _: &CodecRegistry) -> Result<Parameter, ConfigError> {
    let p = IntParameter::new(
        str_field(doc, "name")?,
        i32_field(doc, "min")?,
        i32_field(doc, "max")?,
        i32_field(doc, "value")?,
    )?;
    Ok(p.into())
}

// -- SwitchParameter --------------------------------------------------------

fn encode_switch(parameter: &Parameter, _: &CodecRegistry) -> Result<Value, ConfigError> {
    let Parameter::Switch(p) = parameter else {
        return Err(wrong_variant(SWITCH_CLASS, parameter));
    };
    let universe = p
        .universe_document()
        .map_err(|e| document_error!("cannot encode universe of {}: {e}", p.name()))?;
    Ok(json!({
        "class": SWITCH_CLASS,
        "name": p.name(),
        "universeType": p.type_name(),
        "universe": universe,
        "value": p.index(),
        "__module__": "parameters",
        "__class__": SWITCH_CLASS,
    }))
}

fn decode_switch(doc: &Value, registry: &CodecRegistry) -> Result<Parameter, ConfigError> {
    let decode = registry.switch_decoder(str_field(doc, "universeType")?)?;
    let index = usize_of(field(doc, "value")?, "value")?;
    let switch = decode(str_field(doc, "name")?, field(doc, "universe")?, index)?;
    Ok(Parameter::Switch(switch))
}

fn decode_switch_of<T: SwitchValue>(
    name: &str,
    universe: &Value,
    index: usize,
) -> Result<AnySwitch, ConfigError> {
    let universe: Vec<T> = serde_json::from_value(universe.clone())
        .map_err(|e| document_error!("universe of {name} is not a list of {}: {e}", T::TYPE_NAME))?;
    Ok(SwitchParameter::with_index(name, universe, index)?.into())
}

// -- PartitionParameter -----------------------------------------------------

fn encode_blob(blob: &BlobSpecifier, registry: &CodecRegistry) -> Value {
    json!({
        "class": BLOB_SPECIFIER_CLASS,
        "machine": blob.machine(),
        "cores": blob.cores(),
        "blobFactory": registry.encode_factory(blob.blob_factory()),
        "workerIds": blob.worker_identifiers().iter().map(|w| w.0).collect::<Vec<_>>(),
        "__module__": "configuration",
        "__class__": BLOB_SPECIFIER_CLASS,
    })
}

fn encode_partition(parameter: &Parameter, registry: &CodecRegistry) -> Result<Value, ConfigError> {
    let p = PartitionParameter::from_parameter(parameter)
        .ok_or_else(|| wrong_variant(PartitionParameter::CLASS, parameter))?;
    let factories: Vec<Value> = p
        .blob_factories()
        .iter()
        .map(|f| registry.encode_factory(f))
        .collect();
    let blobs: Vec<Value> = p.blobs().map(|b| encode_blob(b, registry)).collect();
    Ok(json!({
        "class": PartitionParameter::CLASS,
        "name": p.name(),
        "maxWorkerIdentifier": p.max_worker_identifier().0,
        "coresPerMachine": p.cores_per_machine(),
        "blobFactoryUniverse": factories,
        "blobs": blobs,
        "__module__": "parameters",
        "__class__": PartitionParameter::CLASS,
    }))
}

/// Replays the document through a [`PartitionBuilder`](crate::PartitionBuilder),
/// so a decoded partition satisfies the same placement invariants as a
/// freshly built one.
fn decode_partition(doc: &Value, registry: &CodecRegistry) -> Result<Parameter, ConfigError> {
    let name = str_field(doc, "name")?;
    let recorded_max = worker_of(field(doc, "maxWorkerIdentifier")?, "maxWorkerIdentifier")?;
    let cores = array_field(doc, "coresPerMachine")?
        .iter()
        .map(|v| usize_of(v, "coresPerMachine"))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = PartitionParameter::builder(name, cores)?;
    for factory_doc in array_field(doc, "blobFactoryUniverse")? {
        let factory = registry.decode_factory(factory_doc)?;
        builder.add_blob_factory(factory).map_err(invalid_placement)?;
    }
    for blob_doc in array_field(doc, "blobs")? {
        check_class(blob_doc, BLOB_SPECIFIER_CLASS)?;
        let machine = usize_of(field(blob_doc, "machine")?, "machine")?;
        let cores = usize_of(field(blob_doc, "cores")?, "cores")?;
        let factory = registry.decode_factory(field(blob_doc, "blobFactory")?)?;
        let ids = array_field(blob_doc, "workerIds")?
            .iter()
            .map(|v| worker_of(v, "workerIds"))
            .collect::<Result<Vec<_>, _>>()?;
        builder
            .add_blob_ids(machine, cores, &factory, ids)
            .map_err(invalid_placement)?;
    }

    let partition = builder.build()?;
    if partition.max_worker_identifier() != recorded_max {
        return Err(document_error!(
            "partition {name} records max worker {recorded_max} but assigns up to {}",
            partition.max_worker_identifier()
        ));
    }
    debug!(partition = %name, blobs = partition.blobs().count(), "decoded partition");
    Ok(partition.into())
}
