//! Environment and execution properties, and selection of the environment a
//! task may run in.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::codec::Snapshot;
use crate::core::{Value, encode_value, lock};

/// Qualifier values an environment selector looked at, `None` when the
/// environment did not define the property.
pub type Qualifiers = BTreeMap<String, Option<Value>>;

/// Properties published by an environment (the local machine or a cluster
/// remote).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentProperties(BTreeMap<String, Value>);

impl EnvironmentProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties describing the current machine.
    pub fn local() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self::new()
            .with("os", Value::Text(std::env::consts::OS.into()))
            .with("arch", Value::Text(std::env::consts::ARCH.into()))
            .with("cpus", Value::Integer((cpus as u64).into()))
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub(crate) fn qualifiers(&self, keys: &[String]) -> Qualifiers {
        keys.iter()
            .map(|key| (key.clone(), self.0.get(key).cloned()))
            .collect()
    }
}

impl Extend<(String, Value)> for EnvironmentProperties {
    fn extend<I: IntoIterator<Item = (String, Value)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// User parameters of a single build execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParameters(BTreeMap<String, String>);

impl ExecutionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Decides whether an environment is suitable for running some work. The
/// inspected properties become an implicit dependency of the task.
pub trait EnvironmentSelector: Send + Sync + fmt::Debug {
    /// Names of the properties this selector looks at.
    fn properties(&self) -> Vec<String>;

    fn is_suitable(&self, qualifiers: &Qualifiers) -> bool;
}

/// Outcome of evaluating a selector against one environment.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvironmentSelection {
    pub suitable: bool,
    pub qualifiers: Qualifiers,
}

pub fn select(selector: &dyn EnvironmentSelector, environment: &EnvironmentProperties) -> EnvironmentSelection {
    let qualifiers = environment.qualifiers(&selector.properties());
    EnvironmentSelection {
        suitable: selector.is_suitable(&qualifiers),
        qualifiers,
    }
}

/// Requires a fixed value for each of the listed properties.
#[derive(Clone, Debug, Default)]
pub struct PropertySelector {
    required: BTreeMap<String, Value>,
}

impl PropertySelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, key: impl Into<String>, value: Value) -> Self {
        self.required.insert(key.into(), value);
        self
    }
}

impl EnvironmentSelector for PropertySelector {
    fn properties(&self) -> Vec<String> {
        self.required.keys().cloned().collect()
    }

    fn is_suitable(&self, qualifiers: &Qualifiers) -> bool {
        self.required
            .iter()
            .all(|(key, value)| qualifiers.get(key).and_then(Option::as_ref) == Some(value))
    }
}

/// A value derived from the environment a build runs in. Reported as a
/// dependency, it is recomputed on the next build and compared.
pub trait EnvironmentProperty: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Serializable identity of the property.
    fn snapshot(&self) -> anyhow::Result<Value>;

    fn compute(&self, environment: &EnvironmentProperties) -> anyhow::Result<Value>;
}

/// A value derived from the parameters of the current build execution.
pub trait ExecutionProperty: Send + Sync {
    fn tag(&self) -> &'static str;

    fn snapshot(&self) -> anyhow::Result<Value>;

    fn compute(&self, parameters: &ExecutionParameters) -> anyhow::Result<Value>;
}

/// The value of a named environment property, `null` when undefined.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentValue(pub String);

impl EnvironmentValue {
    pub const TAG: &'static str = "environment-value";
}

impl EnvironmentProperty for EnvironmentValue {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(Value::Text(self.0.clone()))
    }

    fn compute(&self, environment: &EnvironmentProperties) -> anyhow::Result<Value> {
        Ok(environment.get(&self.0).cloned().unwrap_or(Value::Null))
    }
}

/// The value of a named execution parameter, `null` when undefined.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionParameter(pub String);

impl ExecutionParameter {
    pub const TAG: &'static str = "execution-parameter";
}

impl ExecutionProperty for ExecutionParameter {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(Value::Text(self.0.clone()))
    }

    fn compute(&self, parameters: &ExecutionParameters) -> anyhow::Result<Value> {
        Ok(parameters
            .get(&self.0)
            .map(|v| Value::Text(v.to_owned()))
            .unwrap_or(Value::Null))
    }
}

/// Recorded result of computing a property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyOutcome {
    Value(Value),
    Failed(String),
}

/// Memoizes property computations for the duration of one execution.
#[derive(Default)]
pub(crate) struct PropertyCache {
    values: Mutex<HashMap<(String, Vec<u8>), PropertyOutcome>>,
}

impl PropertyCache {
    pub(crate) fn get_or_compute(
        &self,
        snapshot: &Snapshot,
        compute: impl FnOnce() -> anyhow::Result<Value>,
    ) -> PropertyOutcome {
        let key = match encode_value(&snapshot.state) {
            Ok(bytes) => (snapshot.tag.clone(), bytes),
            Err(_) => return outcome_of(compute()),
        };

        if let Some(found) = lock(&self.values).get(&key) {
            return found.clone();
        }

        let outcome = outcome_of(compute());
        lock(&self.values).insert(key, outcome.clone());
        outcome
    }
}

fn outcome_of(result: anyhow::Result<Value>) -> PropertyOutcome {
    match result {
        Ok(value) => PropertyOutcome::Value(value),
        Err(e) => PropertyOutcome::Failed(format!("{e:#}")),
    }
}
