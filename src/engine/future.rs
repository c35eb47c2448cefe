use std::sync::{Arc, Mutex};

use crate::codec::Snapshot;
use crate::core::{TaskIdentifier, Value, lock};
use crate::detector::TaskOutputChangeDetector;
use crate::engine::runner::Execution;
use crate::engine::scheduler::{FinishedTask, TaskKey, WaitPurpose, Waiter};
use crate::engine::tracking::DependencyCollector;
use crate::error::TaskError;

/// Handle to the result of a task started in the current build.
///
/// Getting the result through this handle makes the caller depend on the whole
/// output. Use [`as_dependency_future`](TaskFuture::as_dependency_future) to
/// narrow the dependency with change detectors.
#[derive(Clone)]
pub struct TaskFuture {
    execution: Arc<Execution>,
    waiter: Option<Waiter>,
    collector: Option<Arc<Mutex<DependencyCollector>>>,
    target: TaskKey,
    id: TaskIdentifier,
}

impl TaskFuture {
    pub(crate) fn new(
        execution: Arc<Execution>,
        waiter: Option<Waiter>,
        collector: Option<Arc<Mutex<DependencyCollector>>>,
        target: TaskKey,
        id: TaskIdentifier,
    ) -> Self {
        Self {
            execution,
            waiter,
            collector,
            target,
            id,
        }
    }

    pub fn task_id(&self) -> &TaskIdentifier {
        &self.id
    }

    /// Blocks until the task finishes and returns its result.
    pub fn get(&self) -> Result<Value, TaskError> {
        self.read(true)
    }

    /// Returns the result of a task known to be finished, without blocking.
    pub fn get_finished(&self) -> Result<Value, TaskError> {
        self.read_finished(true)
    }

    pub fn is_finished(&self) -> bool {
        self.execution.finished(self.target).is_some()
    }

    pub fn as_dependency_future(&self) -> TaskDependencyFuture {
        TaskDependencyFuture { future: self.clone() }
    }

    fn read(&self, full: bool) -> Result<Value, TaskError> {
        let finished = self
            .execution
            .wait_for(self.waiter.as_ref(), self.target, WaitPurpose::Result)?;
        self.record(&finished, full);
        finished.result.clone()
    }

    fn read_finished(&self, full: bool) -> Result<Value, TaskError> {
        let finished = self.execution.get_finished(self.waiter.as_ref(), self.target)?;
        self.record(&finished, full);
        finished.result.clone()
    }

    fn record(&self, finished: &FinishedTask, full: bool) {
        if let Some(collector) = &self.collector {
            lock(collector).task_read(finished, full);
        }
    }
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture").field("id", &self.id).finish()
    }
}

/// A [`TaskFuture`] whose reads only depend on what the attached change
/// detectors look at. Without detectors it behaves like a plain read.
#[derive(Clone, Debug)]
pub struct TaskDependencyFuture {
    future: TaskFuture,
}

impl TaskDependencyFuture {
    pub fn task_id(&self) -> &TaskIdentifier {
        &self.future.id
    }

    pub fn get(&self) -> Result<Value, TaskError> {
        self.future.read(false)
    }

    pub fn get_finished(&self) -> Result<Value, TaskError> {
        self.future.read_finished(false)
    }

    /// Adds a detector. The consumer is re-run when any detector reports the
    /// producer's output as changed.
    pub fn set_change_detector(&self, detector: &dyn TaskOutputChangeDetector) -> Result<(), TaskError> {
        let Some(collector) = &self.future.collector else {
            return Ok(());
        };
        let snapshot = Snapshot::of_detector(detector).map_err(|e| {
            TaskError::illegal(
                &self.future.id,
                format!("Couldn't take a snapshot of the change detector: {e:#}"),
            )
        })?;
        lock(collector).task_detector(&self.future.id, snapshot);
        Ok(())
    }
}
