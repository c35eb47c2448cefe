use serde::{Deserialize, Serialize};

use crate::core::Value;

/// Decides whether a task output counts as changed.
///
/// Attached by a consumer, it narrows the consumer's interest in a producer's
/// output: the consumer is only re-run when the detector reports a change.
/// Attached by the producer itself, it declares the output logically unchanged
/// despite the producer having re-run. Detectors are persisted through their
/// snapshot and rebuilt with the codec registry, so every detector type needs a
/// registered codec under its tag.
pub trait TaskOutputChangeDetector: Send + Sync {
    fn tag(&self) -> &'static str;

    fn snapshot(&self) -> anyhow::Result<Value>;

    fn is_changed(&self, output: &Value) -> bool;
}

/// Changed unless the output equals the expected value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EqualityDetector {
    pub expected: Value,
}

impl EqualityDetector {
    pub const TAG: &'static str = "equality";

    pub fn new(expected: Value) -> Self {
        Self { expected }
    }
}

impl TaskOutputChangeDetector for EqualityDetector {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(self.expected.clone())
    }

    fn is_changed(&self, output: &Value) -> bool {
        *output != self.expected
    }
}

/// Every output counts as changed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AlwaysChanged;

impl AlwaysChanged {
    pub const TAG: &'static str = "always-changed";
}

impl TaskOutputChangeDetector for AlwaysChanged {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn is_changed(&self, _: &Value) -> bool {
        true
    }
}

/// No output counts as changed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NeverChanged;

impl NeverChanged {
    pub const TAG: &'static str = "never-changed";
}

impl TaskOutputChangeDetector for NeverChanged {
    fn tag(&self) -> &'static str {
        Self::TAG
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn is_changed(&self, _: &Value) -> bool {
        false
    }
}
