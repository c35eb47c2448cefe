//! Registry of codecs that rebuild persisted objects from their snapshots.
//!
//! Everything the engine stores and later has to bring back to life (task
//! factories of unchanged children, output change detectors, custom content
//! descriptors, environment and execution properties, inner task factories run
//! by cluster remotes) is stored as a [`Snapshot`]: a stable type tag plus a
//! serializable state. The registry maps each tag back to a decoder.

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::content::ContentProvider;
use crate::core::{Value, from_value};
use crate::detector::{AlwaysChanged, EqualityDetector, NeverChanged, TaskOutputChangeDetector};
use crate::environment::{EnvironmentProperty, EnvironmentValue, ExecutionParameter, ExecutionProperty};
use crate::error::RegistryError;
use crate::task::{InnerTaskFactory, TaskFactory};

/// Persisted identity of a pluggable object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tag: String,
    pub state: Value,
}

impl Snapshot {
    pub fn of_factory(factory: &dyn TaskFactory) -> anyhow::Result<Self> {
        Ok(Self {
            tag: factory.tag().to_owned(),
            state: factory.snapshot()?,
        })
    }

    pub fn of_inner_factory(factory: &dyn InnerTaskFactory) -> anyhow::Result<Self> {
        Ok(Self {
            tag: factory.tag().to_owned(),
            state: factory.snapshot()?,
        })
    }

    pub fn of_detector(detector: &dyn TaskOutputChangeDetector) -> anyhow::Result<Self> {
        Ok(Self {
            tag: detector.tag().to_owned(),
            state: detector.snapshot()?,
        })
    }

    pub fn of_environment_property(property: &dyn EnvironmentProperty) -> anyhow::Result<Self> {
        Ok(Self {
            tag: property.tag().to_owned(),
            state: property.snapshot()?,
        })
    }

    pub fn of_execution_property(property: &dyn ExecutionProperty) -> anyhow::Result<Self> {
        Ok(Self {
            tag: property.tag().to_owned(),
            state: property.snapshot()?,
        })
    }
}

/// Checks a [`ContentDescriptor::Custom`](crate::ContentDescriptor::Custom)
/// fingerprint against the current state of a file.
pub trait DescriptorCodec: Send + Sync {
    fn is_changed(&self, path: &Utf8Path, state: &Value, files: &dyn ContentProvider) -> anyhow::Result<bool>;
}

type Decoder<T> = Arc<dyn Fn(&Value) -> anyhow::Result<T> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CodecRegistry {
    factories: HashMap<String, Decoder<Arc<dyn TaskFactory>>>,
    inner_factories: HashMap<String, Decoder<Arc<dyn InnerTaskFactory>>>,
    detectors: HashMap<String, Decoder<Arc<dyn TaskOutputChangeDetector>>>,
    environment_properties: HashMap<String, Decoder<Arc<dyn EnvironmentProperty>>>,
    execution_properties: HashMap<String, Decoder<Arc<dyn ExecutionProperty>>>,
    descriptors: HashMap<String, Arc<dyn DescriptorCodec>>,
}

impl CodecRegistry {
    /// Creates a registry with codecs for the built-in detectors and
    /// properties.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry
            .register_detector_with(EqualityDetector::TAG, |state| {
                Ok(Arc::new(EqualityDetector::new(state.clone())))
            })
            .register_detector_with(AlwaysChanged::TAG, |_| Ok(Arc::new(AlwaysChanged)))
            .register_detector_with(NeverChanged::TAG, |_| Ok(Arc::new(NeverChanged)))
            .register_environment_property_with(EnvironmentValue::TAG, |state| {
                Ok(Arc::new(EnvironmentValue(from_value(state)?)))
            })
            .register_execution_property_with(ExecutionParameter::TAG, |state| {
                Ok(Arc::new(ExecutionParameter(from_value(state)?)))
            });
        registry
    }

    /// Registers a factory type whose snapshot is its own serialized form.
    pub fn register_factory<F>(&mut self, tag: &str) -> &mut Self
    where
        F: TaskFactory + DeserializeOwned,
    {
        self.register_factory_with(tag, |state| Ok(Arc::new(from_value::<F>(state)?)))
    }

    pub fn register_factory_with<D>(&mut self, tag: &str, decode: D) -> &mut Self
    where
        D: Fn(&Value) -> anyhow::Result<Arc<dyn TaskFactory>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.to_owned(), Arc::new(decode));
        self
    }

    pub fn register_inner_factory<F>(&mut self, tag: &str) -> &mut Self
    where
        F: InnerTaskFactory + DeserializeOwned,
    {
        self.register_inner_factory_with(tag, |state| Ok(Arc::new(from_value::<F>(state)?)))
    }

    pub fn register_inner_factory_with<D>(&mut self, tag: &str, decode: D) -> &mut Self
    where
        D: Fn(&Value) -> anyhow::Result<Arc<dyn InnerTaskFactory>> + Send + Sync + 'static,
    {
        self.inner_factories.insert(tag.to_owned(), Arc::new(decode));
        self
    }

    pub fn register_detector<T>(&mut self, tag: &str) -> &mut Self
    where
        T: TaskOutputChangeDetector + DeserializeOwned + 'static,
    {
        self.register_detector_with(tag, |state| Ok(Arc::new(from_value::<T>(state)?)))
    }

    pub fn register_detector_with<D>(&mut self, tag: &str, decode: D) -> &mut Self
    where
        D: Fn(&Value) -> anyhow::Result<Arc<dyn TaskOutputChangeDetector>> + Send + Sync + 'static,
    {
        self.detectors.insert(tag.to_owned(), Arc::new(decode));
        self
    }

    pub fn register_environment_property_with<D>(&mut self, tag: &str, decode: D) -> &mut Self
    where
        D: Fn(&Value) -> anyhow::Result<Arc<dyn EnvironmentProperty>> + Send + Sync + 'static,
    {
        self.environment_properties.insert(tag.to_owned(), Arc::new(decode));
        self
    }

    pub fn register_execution_property_with<D>(&mut self, tag: &str, decode: D) -> &mut Self
    where
        D: Fn(&Value) -> anyhow::Result<Arc<dyn ExecutionProperty>> + Send + Sync + 'static,
    {
        self.execution_properties.insert(tag.to_owned(), Arc::new(decode));
        self
    }

    pub fn register_descriptor(&mut self, tag: &str, codec: impl DescriptorCodec + 'static) -> &mut Self {
        self.descriptors.insert(tag.to_owned(), Arc::new(codec));
        self
    }

    pub fn decode_factory(&self, snapshot: &Snapshot) -> Result<Arc<dyn TaskFactory>, RegistryError> {
        decode(&self.factories, "task factory", snapshot)
    }

    pub fn decode_inner_factory(&self, snapshot: &Snapshot) -> Result<Arc<dyn InnerTaskFactory>, RegistryError> {
        decode(&self.inner_factories, "inner task factory", snapshot)
    }

    pub fn decode_detector(&self, snapshot: &Snapshot) -> Result<Arc<dyn TaskOutputChangeDetector>, RegistryError> {
        decode(&self.detectors, "change detector", snapshot)
    }

    pub fn decode_environment_property(
        &self,
        snapshot: &Snapshot,
    ) -> Result<Arc<dyn EnvironmentProperty>, RegistryError> {
        decode(&self.environment_properties, "environment property", snapshot)
    }

    pub fn decode_execution_property(&self, snapshot: &Snapshot) -> Result<Arc<dyn ExecutionProperty>, RegistryError> {
        decode(&self.execution_properties, "execution property", snapshot)
    }

    pub fn descriptor(&self, tag: &str) -> Result<&Arc<dyn DescriptorCodec>, RegistryError> {
        self.descriptors.get(tag).ok_or_else(|| RegistryError::UnknownTag {
            kind: "content descriptor",
            tag: tag.to_owned(),
        })
    }
}

fn decode<T>(
    decoders: &HashMap<String, Decoder<T>>,
    kind: &'static str,
    snapshot: &Snapshot,
) -> Result<T, RegistryError> {
    let decoder = decoders.get(&snapshot.tag).ok_or_else(|| RegistryError::UnknownTag {
        kind,
        tag: snapshot.tag.clone(),
    })?;

    decoder(&snapshot.state).map_err(|e| RegistryError::Decode {
        kind,
        tag: snapshot.tag.clone(),
        message: format!("{e:#}"),
    })
}
