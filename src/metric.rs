use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::core::{TaskIdentifier, lock};

/// Observer of engine decisions, injected through the engine builder.
///
/// All methods default to doing nothing.
pub trait BuildMetric: Send + Sync {
    fn task_executed(&self, _id: &TaskIdentifier) {}

    fn task_reused(&self, _id: &TaskIdentifier) {}

    fn task_abandoned(&self, _id: &TaskIdentifier) {}

    fn output_load_failed(&self, _id: &TaskIdentifier) {}

    fn deadlock_detected(&self, _participants: &[TaskIdentifier]) {}
}

/// A metric which remembers everything it was told.
#[derive(Debug, Default)]
pub struct CollectingMetric {
    executed: Mutex<BTreeSet<TaskIdentifier>>,
    reused: Mutex<BTreeSet<TaskIdentifier>>,
    abandoned: Mutex<Vec<TaskIdentifier>>,
    load_failures: Mutex<BTreeSet<TaskIdentifier>>,
    deadlocks: Mutex<Vec<Vec<TaskIdentifier>>>,
}

impl CollectingMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> BTreeSet<TaskIdentifier> {
        lock(&self.executed).clone()
    }

    pub fn reused(&self) -> BTreeSet<TaskIdentifier> {
        lock(&self.reused).clone()
    }

    /// Abandoned ids in report order, duplicates included.
    pub fn abandoned(&self) -> Vec<TaskIdentifier> {
        lock(&self.abandoned).clone()
    }

    pub fn output_load_failures(&self) -> BTreeSet<TaskIdentifier> {
        lock(&self.load_failures).clone()
    }

    pub fn deadlocks(&self) -> Vec<Vec<TaskIdentifier>> {
        lock(&self.deadlocks).clone()
    }

    pub fn clear(&self) {
        lock(&self.executed).clear();
        lock(&self.reused).clear();
        lock(&self.abandoned).clear();
        lock(&self.load_failures).clear();
        lock(&self.deadlocks).clear();
    }
}

impl BuildMetric for CollectingMetric {
    fn task_executed(&self, id: &TaskIdentifier) {
        lock(&self.executed).insert(id.clone());
    }

    fn task_reused(&self, id: &TaskIdentifier) {
        lock(&self.reused).insert(id.clone());
    }

    fn task_abandoned(&self, id: &TaskIdentifier) {
        lock(&self.abandoned).push(id.clone());
    }

    fn output_load_failed(&self, id: &TaskIdentifier) {
        lock(&self.load_failures).insert(id.clone());
    }

    fn deadlock_detected(&self, participants: &[TaskIdentifier]) {
        lock(&self.deadlocks).push(participants.to_vec());
    }
}

/// The metric used when none is injected.
pub(crate) struct NoMetric;

impl BuildMetric for NoMetric {}
