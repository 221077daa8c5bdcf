//! Immutable tunable parameters.
//!
//! Parameters form a closed set of variants ([`Parameter`]). Every
//! constructor validates its invariants and fails without producing a value,
//! so a parameter that exists is always well-formed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sl_types::{construction_error, ConfigError};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Bound, RangeBounds, RangeInclusive};
use std::sync::Arc;

use crate::partition::PartitionParameter;

fn check_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(construction_error!("parameter names must not be empty"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Integer parameter
// ---------------------------------------------------------------------------

/// An integer value inside a closed range. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntParameter {
    name: String,
    min: i32,
    max: i32,
    value: i32,
}

impl IntParameter {
    pub fn new(name: impl Into<String>, min: i32, max: i32, value: i32) -> Result<Self, ConfigError> {
        Self::with_range(name, min..=max, value)
    }

    /// Builds from any range expression. The range must be bounded and
    /// closed at both ends, and non-empty.
    pub fn with_range<R: RangeBounds<i32>>(
        name: impl Into<String>,
        range: R,
        value: i32,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        check_name(&name)?;
        let (min, max) = match (range.start_bound(), range.end_bound()) {
            (Bound::Included(&min), Bound::Included(&max)) => (min, max),
            _ => {
                return Err(construction_error!(
                    "range of {name} must be closed at both ends"
                ))
            }
        };
        if min > max {
            return Err(construction_error!("range [{min}, {max}] of {name} is empty"));
        }
        if value < min || value > max {
            return Err(construction_error!(
                "value {value} of {name} outside [{min}, {max}]"
            ));
        }
        Ok(Self { name, min, max, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn range(&self) -> RangeInclusive<i32> {
        self.min..=self.max
    }

    pub fn value(&self) -> i32 {
        self.value
    }
}

impl fmt::Display for IntParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {} in [{}..{}]]", self.name, self.value, self.min, self.max)
    }
}

// ---------------------------------------------------------------------------
// Switch parameter
// ---------------------------------------------------------------------------

/// Element types usable in a [`SwitchParameter`] universe.
///
/// `TYPE_NAME` is written as the document's `universeType` and selects the
/// decoder in the codec registry.
pub trait SwitchValue:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const TYPE_NAME: &'static str;
}

impl SwitchValue for bool {
    const TYPE_NAME: &'static str = "bool";
}

impl SwitchValue for i32 {
    const TYPE_NAME: &'static str = "i32";
}

impl SwitchValue for i64 {
    const TYPE_NAME: &'static str = "i64";
}

impl SwitchValue for u32 {
    const TYPE_NAME: &'static str = "u32";
}

impl SwitchValue for String {
    const TYPE_NAME: &'static str = "String";
}

/// A choice of one element from an ordered universe.
///
/// The selection is stored as an index, so the universe order is part of the
/// parameter's identity: two switches holding the same elements in a
/// different order are different parameters. Equality and hashing cover the
/// element type, the universe sequence and the index, not the name.
#[derive(Debug, Clone)]
pub struct SwitchParameter<T> {
    name: String,
    universe: Vec<T>,
    index: usize,
}

impl<T: SwitchValue> SwitchParameter<T> {
    /// Selects `value` from `universe`. The universe must be non-empty, free
    /// of duplicates, and contain `value`.
    pub fn new(
        name: impl Into<String>,
        value: T,
        universe: impl IntoIterator<Item = T>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let universe: Vec<T> = universe.into_iter().collect();
        let index = universe
            .iter()
            .position(|u| *u == value)
            .ok_or_else(|| construction_error!("value {value:?} of {name} not in universe"))?;
        Self::with_index(name, universe, index)
    }

    /// Selects the element at `index`.
    pub fn with_index(
        name: impl Into<String>,
        universe: Vec<T>,
        index: usize,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        check_name(&name)?;
        if universe.is_empty() {
            return Err(construction_error!("empty universe for {name}"));
        }
        let distinct: HashSet<&T> = universe.iter().collect();
        if distinct.len() != universe.len() {
            return Err(construction_error!("universe of {name} contains duplicate elements"));
        }
        if index >= universe.len() {
            return Err(construction_error!(
                "index {index} of {name} outside universe of {} elements",
                universe.len()
            ));
        }
        Ok(Self { name, universe, index })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &T {
        &self.universe[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn universe(&self) -> &[T] {
        &self.universe
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }
}

impl SwitchParameter<bool> {
    /// An on/off flag with universe `[false, true]`.
    pub fn boolean(name: impl Into<String>, value: bool) -> Result<Self, ConfigError> {
        Self::new(name, value, [false, true])
    }
}

impl<T: SwitchValue> PartialEq for SwitchParameter<T> {
    fn eq(&self, other: &Self) -> bool {
        self.universe == other.universe && self.index == other.index
    }
}

impl<T: SwitchValue> Eq for SwitchParameter<T> {}

impl<T: SwitchValue> Hash for SwitchParameter<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        T::TYPE_NAME.hash(state);
        self.universe.hash(state);
        self.index.hash(state);
    }
}

impl<T: SwitchValue> fmt::Display for SwitchParameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}: {:?} (index {}) of {:?}]",
            self.name,
            self.value(),
            self.index,
            self.universe
        )
    }
}

/// Object-safe view of a `SwitchParameter<T>` with its element type erased.
trait ErasedSwitch: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn index(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn eq_erased(&self, other: &dyn ErasedSwitch) -> bool;
    fn hash_erased(&self, state: &mut dyn Hasher);
    fn universe_document(&self) -> Result<Value, serde_json::Error>;
}

impl<T: SwitchValue> ErasedSwitch for SwitchParameter<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn index(&self) -> usize {
        self.index
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_erased(&self, other: &dyn ErasedSwitch) -> bool {
        other
            .as_any()
            .downcast_ref::<SwitchParameter<T>>()
            .map_or(false, |o| self == o)
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state);
    }

    fn universe_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.universe)
    }
}

/// A switch parameter of any element type, as stored in a configuration.
#[derive(Debug, Clone)]
pub struct AnySwitch(Arc<dyn ErasedSwitch>);

impl AnySwitch {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn index(&self) -> usize {
        self.0.index()
    }

    /// The typed parameter, if the element type is `T`.
    pub fn downcast<T: SwitchValue>(&self) -> Option<&SwitchParameter<T>> {
        self.0.as_any().downcast_ref::<SwitchParameter<T>>()
    }

    pub(crate) fn universe_document(&self) -> Result<Value, serde_json::Error> {
        self.0.universe_document()
    }
}

impl<T: SwitchValue> From<SwitchParameter<T>> for AnySwitch {
    fn from(p: SwitchParameter<T>) -> Self {
        Self(Arc::new(p))
    }
}

impl PartialEq for AnySwitch {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(other.0.as_ref())
    }
}

impl Eq for AnySwitch {}

impl Hash for AnySwitch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_erased(state);
    }
}

// ---------------------------------------------------------------------------
// Closed variant set
// ---------------------------------------------------------------------------

/// A named, immutable configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parameter {
    Int(IntParameter),
    Switch(AnySwitch),
    Partition(PartitionParameter),
}

impl Parameter {
    pub fn name(&self) -> &str {
        match self {
            Self::Int(p) => p.name(),
            Self::Switch(p) => p.name(),
            Self::Partition(p) => p.name(),
        }
    }

    /// Document discriminator of this variant.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Int(_) => IntParameter::CLASS,
            Self::Switch(_) => SWITCH_CLASS,
            Self::Partition(_) => PartitionParameter::CLASS,
        }
    }
}

pub(crate) const SWITCH_CLASS: &str = "SwitchParameter";

impl From<IntParameter> for Parameter {
    fn from(p: IntParameter) -> Self {
        Self::Int(p)
    }
}

impl<T: SwitchValue> From<SwitchParameter<T>> for Parameter {
    fn from(p: SwitchParameter<T>) -> Self {
        Self::Switch(p.into())
    }
}

impl From<PartitionParameter> for Parameter {
    fn from(p: PartitionParameter) -> Self {
        Self::Partition(p)
    }
}

/// Non-generic parameter variants that can be extracted from a [`Parameter`].
pub trait FromParameter: Sized {
    const CLASS: &'static str;

    fn from_parameter(parameter: &Parameter) -> Option<&Self>;
}

impl FromParameter for IntParameter {
    const CLASS: &'static str = "IntParameter";

    fn from_parameter(parameter: &Parameter) -> Option<&Self> {
        match parameter {
            Parameter::Int(p) => Some(p),
            _ => None,
        }
    }
}

impl FromParameter for PartitionParameter {
    const CLASS: &'static str = "PartitionParameter";

    fn from_parameter(parameter: &Parameter) -> Option<&Self> {
        match parameter {
            Parameter::Partition(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<H: Hash>(h: &H) -> u64 {
        let mut hasher = DefaultHasher::new();
        h.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn int_parameter_rejects_out_of_range() {
        assert!(IntParameter::new("unroll", 0, 10, 11).is_err());
        assert!(IntParameter::new("unroll", 0, 10, -1).is_err());
        assert!(IntParameter::new("unroll", 0, 10, 10).is_ok());
    }

    #[test]
    fn int_parameter_rejects_inverted_and_open_ranges() {
        assert!(IntParameter::new("unroll", 5, 4, 5).is_err());
        assert!(IntParameter::with_range("unroll", 0..10, 3).is_err());
        assert!(IntParameter::with_range("unroll", 0.., 3).is_err());
        assert!(IntParameter::new("", 0, 1, 0).is_err());
    }

    #[test]
    fn int_parameter_identity() {
        let a = IntParameter::new("unroll", 0, 10, 4).unwrap();
        let b = IntParameter::with_range("unroll", 0..=10, 4).unwrap();
        let c = IntParameter::new("unroll", 0, 11, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "[unroll: 4 in [0..10]]");
    }

    #[test]
    fn switch_universe_order_matters() {
        let a = SwitchParameter::new("mode", 2, [1, 2, 3]).unwrap();
        let b = SwitchParameter::new("mode", 2, [3, 2, 1]).unwrap();
        assert_eq!(a.index(), 1);
        assert_eq!(b.index(), 1);
        assert_eq!(a.value(), b.value());
        assert_ne!(a, b);
        assert_ne!(Parameter::from(a), Parameter::from(b));
    }

    #[test]
    fn switch_rejects_duplicates_and_missing_value() {
        assert!(SwitchParameter::new("mode", 1, [1, 1, 2]).is_err());
        assert!(SwitchParameter::new("mode", 9, [1, 2]).is_err());
        assert!(SwitchParameter::<i32>::with_index("mode", vec![], 0).is_err());
        assert!(SwitchParameter::with_index("mode", vec![1, 2], 2).is_err());
    }

    #[test]
    fn switch_equality_ignores_name() {
        let a = SwitchParameter::boolean("fuse", true).unwrap();
        let b = SwitchParameter::boolean("split", true).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn erased_switch_keeps_element_type() {
        let ints: AnySwitch = SwitchParameter::new("x", 1i32, [0, 1]).unwrap().into();
        let longs: AnySwitch = SwitchParameter::new("x", 1i64, [0, 1]).unwrap().into();
        assert_ne!(ints, longs);
        assert!(ints.downcast::<i32>().is_some());
        assert!(ints.downcast::<i64>().is_none());
        assert_eq!(longs.type_name(), "i64");
    }
}
