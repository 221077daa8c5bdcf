//! Immutable trees of named parameters.

use sl_types::{construction_error, ConfigError};
use std::collections::HashMap;

use crate::parameter::{FromParameter, Parameter, SwitchParameter, SwitchValue, SWITCH_CLASS};

/// A named tree of parameters describing one candidate execution plan.
///
/// Parameter names are unique within a configuration, as are
/// subconfiguration names. Values are immutable; derive a new configuration
/// through a [`ConfigurationBuilder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    parameters: HashMap<String, Parameter>,
    subconfigurations: HashMap<String, Configuration>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// A builder seeded with this configuration's contents.
    pub fn to_builder(&self) -> ConfigurationBuilder {
        ConfigurationBuilder {
            parameters: self.parameters.clone(),
            subconfigurations: self.subconfigurations.clone(),
        }
    }

    pub fn parameters(&self) -> &HashMap<String, Parameter> {
        &self.parameters
    }

    pub fn subconfigurations(&self) -> &HashMap<String, Configuration> {
        &self.subconfigurations
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    /// The parameter called `name`, as variant `P`.
    ///
    /// Returns `Ok(None)` when no such parameter exists and
    /// [`ConfigError::TypeMismatch`] when it is a different variant.
    pub fn get<P: FromParameter>(&self, name: &str) -> Result<Option<&P>, ConfigError> {
        let Some(parameter) = self.parameters.get(name) else {
            return Ok(None);
        };
        P::from_parameter(parameter)
            .map(Some)
            .ok_or_else(|| ConfigError::TypeMismatch {
                name: name.to_string(),
                expected: P::CLASS.to_string(),
                actual: parameter.class_name().to_string(),
            })
    }

    /// The switch called `name` with element type `T`.
    ///
    /// A non-switch parameter or a switch over another element type is a
    /// [`ConfigError::TypeMismatch`].
    pub fn get_switch<T: SwitchValue>(
        &self,
        name: &str,
    ) -> Result<Option<&SwitchParameter<T>>, ConfigError> {
        let Some(parameter) = self.parameters.get(name) else {
            return Ok(None);
        };
        let expected = format!("{SWITCH_CLASS}<{}>", T::TYPE_NAME);
        match parameter {
            Parameter::Switch(switch) => match switch.downcast::<T>() {
                Some(typed) => Ok(Some(typed)),
                None => Err(ConfigError::TypeMismatch {
                    name: name.to_string(),
                    expected,
                    actual: format!("{SWITCH_CLASS}<{}>", switch.type_name()),
                }),
            },
            other => Err(ConfigError::TypeMismatch {
                name: name.to_string(),
                expected,
                actual: other.class_name().to_string(),
            }),
        }
    }

    pub fn get_subconfiguration(&self, name: &str) -> Option<&Configuration> {
        self.subconfigurations.get(name)
    }
}

/// Mutable accumulator for a [`Configuration`].
///
/// Cloning a builder copies its whole state, so one builder can serve as a
/// prototype for several configurations.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationBuilder {
    parameters: HashMap<String, Parameter>,
    subconfigurations: HashMap<String, Configuration>,
}

impl ConfigurationBuilder {
    /// Adds a parameter. Fails if one with the same name is present.
    pub fn add_parameter(&mut self, parameter: impl Into<Parameter>) -> Result<&mut Self, ConfigError> {
        let parameter = parameter.into();
        let name = parameter.name().to_string();
        if self.parameters.contains_key(&name) {
            return Err(construction_error!("conflicting parameter name: {name}"));
        }
        self.parameters.insert(name, parameter);
        Ok(self)
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<Parameter> {
        self.parameters.remove(name)
    }

    pub fn add_subconfiguration(
        &mut self,
        name: impl Into<String>,
        configuration: Configuration,
    ) -> Result<&mut Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(construction_error!("subconfiguration names must not be empty"));
        }
        if self.subconfigurations.contains_key(&name) {
            return Err(construction_error!("conflicting subconfiguration name: {name}"));
        }
        self.subconfigurations.insert(name, configuration);
        Ok(self)
    }

    pub fn remove_subconfiguration(&mut self, name: &str) -> Option<Configuration> {
        self.subconfigurations.remove(name)
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Snapshots the current state. May be called any number of times;
    /// later changes to the builder do not affect earlier snapshots.
    pub fn build(&self) -> Configuration {
        Configuration {
            parameters: self.parameters.clone(),
            subconfigurations: self.subconfigurations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::IntParameter;
    use crate::partition::PartitionParameter;

    fn unroll(value: i32) -> IntParameter {
        IntParameter::new("unroll", 1, 16, value).unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut builder = Configuration::builder();
        builder.add_parameter(unroll(2)).unwrap();
        assert!(builder.add_parameter(unroll(4)).is_err());
        builder
            .add_subconfiguration("inner", Configuration::default())
            .unwrap();
        assert!(builder
            .add_subconfiguration("inner", Configuration::default())
            .is_err());
    }

    #[test]
    fn remove_reports_missing() {
        let mut builder = Configuration::builder();
        builder.add_parameter(unroll(2)).unwrap();
        assert_eq!(builder.remove_parameter("unroll"), Some(Parameter::from(unroll(2))));
        assert_eq!(builder.remove_parameter("unroll"), None);
        assert!(builder.remove_subconfiguration("inner").is_none());
    }

    #[test]
    fn snapshots_are_not_aliased() {
        let mut builder = Configuration::builder();
        builder.add_parameter(unroll(2)).unwrap();
        let before = builder.build();
        builder.remove_parameter("unroll");
        builder.add_parameter(unroll(8)).unwrap();
        let after = builder.build();
        assert_eq!(before.get::<IntParameter>("unroll").unwrap().unwrap().value(), 2);
        assert_eq!(after.get::<IntParameter>("unroll").unwrap().unwrap().value(), 8);
    }

    #[test]
    fn prototype_clone_is_independent() {
        let mut prototype = Configuration::builder();
        prototype
            .add_parameter(SwitchParameter::boolean("fuse", true).unwrap())
            .unwrap();
        let mut a = prototype.clone();
        let mut b = prototype.clone();
        a.add_parameter(unroll(1)).unwrap();
        b.add_parameter(unroll(3)).unwrap();
        assert!(!prototype.has_parameter("unroll"));
        assert_ne!(a.build(), b.build());
        assert_eq!(a.build().to_builder().build(), a.build());
    }

    #[test]
    fn typed_getters_check_variant_and_element_type() {
        let mut builder = Configuration::builder();
        builder.add_parameter(unroll(2)).unwrap();
        builder
            .add_parameter(SwitchParameter::new("width", 8i32, [4, 8, 16]).unwrap())
            .unwrap();
        let config = builder.build();

        assert!(matches!(
            config.get::<PartitionParameter>("unroll"),
            Err(ConfigError::TypeMismatch { .. })
        ));
        assert!(matches!(
            config.get_switch::<bool>("unroll"),
            Err(ConfigError::TypeMismatch { .. })
        ));
        let err = config.get_switch::<i64>("width").unwrap_err();
        assert_eq!(
            err,
            ConfigError::TypeMismatch {
                name: "width".into(),
                expected: "SwitchParameter<i64>".into(),
                actual: "SwitchParameter<i32>".into(),
            }
        );
        assert_eq!(config.get_switch::<i32>("width").unwrap().unwrap().value(), &8);
        assert!(config.get::<IntParameter>("missing").unwrap().is_none());
    }
}
