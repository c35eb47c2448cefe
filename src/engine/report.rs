use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::core::{BuildStamp, TaskIdentifier, Value};
use crate::error::TaskError;

/// Outcome of one build execution.
#[derive(Debug)]
pub struct BuildReport {
    pub stamp: BuildStamp,
    pub duration: Duration,
    /// Results of the requested root tasks.
    pub results: BTreeMap<TaskIdentifier, Result<Value, TaskError>>,
    /// Tasks whose bodies ran, with their outputs when they succeeded.
    pub executed: BTreeMap<TaskIdentifier, Option<Value>>,
    pub reused: BTreeSet<TaskIdentifier>,
    pub abandoned: Vec<TaskIdentifier>,
    /// Tasks re-run because their stored output could not be loaded.
    pub output_load_failures: BTreeSet<TaskIdentifier>,
    pub deadlocked: BTreeSet<TaskIdentifier>,
    /// Every task of this execution that finished with an error.
    pub failed: BTreeMap<TaskIdentifier, TaskError>,
}

impl BuildReport {
    pub fn is_successful(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn result(&self, id: &TaskIdentifier) -> Option<&Result<Value, TaskError>> {
        self.results.get(id)
    }

    /// Output of a successful root task.
    pub fn output(&self, id: &TaskIdentifier) -> Option<&Value> {
        self.results.get(id).and_then(|result| result.as_ref().ok())
    }

    pub fn executed_ids(&self) -> BTreeSet<TaskIdentifier> {
        self.executed.keys().cloned().collect()
    }

    pub fn was_executed(&self, id: &TaskIdentifier) -> bool {
        self.executed.contains_key(id)
    }
}
