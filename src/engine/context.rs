use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::codec::Snapshot;
use crate::content::{ContentDescriptor, ContentProvider};
use crate::core::{TaskIdentifier, Value, lock};
use crate::detector::TaskOutputChangeDetector;
use crate::engine::delta::RerunReason;
use crate::engine::future::TaskFuture;
use crate::engine::inner::{self, InnerShared, InnerTaskParameters, InnerTaskResults};
use crate::engine::runner::Execution;
use crate::engine::scheduler::{Starter, TaskKey, Waiter};
use crate::engine::stdio::StdioMisuse;
use crate::engine::store::Dependency;
use crate::engine::tracking::DependencyCollector;
use crate::environment::{EnvironmentProperty, ExecutionProperty, PropertyOutcome};
use crate::error::{SharedError, TaskError};
use crate::task::{InnerTaskFactory, TaskFactory};

/// What a finished task body left behind.
pub(crate) struct ContextParts {
    pub dependencies: Vec<Dependency>,
    pub self_detector: Option<Snapshot>,
    pub children: BTreeMap<TaskIdentifier, Snapshot>,
    pub aborts: Vec<SharedError>,
}

impl ContextParts {
    /// Parts of a task that failed before its body ran.
    pub(crate) fn failed(collector: DependencyCollector) -> Self {
        Self {
            dependencies: collector.finish(),
            self_detector: None,
            children: BTreeMap::new(),
            aborts: Vec::new(),
        }
    }
}

/// The interface between a running task body and the engine.
///
/// Everything the task observes through the context becomes a dependency of
/// the task: files it reads or reports, properties it queries, and results of
/// other tasks. On the next build the task only runs again if one of those
/// changed.
pub struct TaskContext {
    execution: Arc<Execution>,
    waiter: Waiter,
    id: TaskIdentifier,
    previous_output: Option<Value>,
    rerun_reason: RerunReason,
    collector: Arc<Mutex<DependencyCollector>>,
    children: Mutex<BTreeMap<TaskIdentifier, Snapshot>>,
    aborts: Mutex<Vec<SharedError>>,
    self_detector: Mutex<Option<Snapshot>>,
    inner: Mutex<Vec<Arc<InnerShared>>>,
}

impl TaskContext {
    pub(crate) fn new(
        execution: Arc<Execution>,
        waiter: Waiter,
        id: TaskIdentifier,
        previous_output: Option<Value>,
        rerun_reason: RerunReason,
        collector: DependencyCollector,
    ) -> Self {
        Self {
            execution,
            waiter,
            id,
            previous_output,
            rerun_reason,
            collector: Arc::new(Mutex::new(collector)),
            children: Mutex::new(BTreeMap::new()),
            aborts: Mutex::new(Vec::new()),
            self_detector: Mutex::new(None),
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn task_id(&self) -> &TaskIdentifier {
        &self.id
    }

    pub fn build_directory(&self) -> &Utf8Path {
        &self.execution.config.build_directory
    }

    /// Direct access to the file provider. Nothing read through it is
    /// recorded as a dependency.
    pub fn files(&self) -> &dyn ContentProvider {
        self.execution.files.as_ref()
    }

    /// Output of the previous successful execution of this task, if any.
    pub fn previous_output(&self) -> Option<&Value> {
        self.previous_output.as_ref()
    }

    pub fn rerun_reason(&self) -> &RerunReason {
        &self.rerun_reason
    }

    pub fn is_cancelled(&self) -> bool {
        self.execution.is_cancelled()
    }

    fn illegal(&self, message: impl Into<String>) -> TaskError {
        TaskError::illegal(&self.id, message)
    }

    pub(crate) fn waiter(&self) -> Waiter {
        self.waiter
    }

    pub(crate) fn execution(&self) -> &Arc<Execution> {
        &self.execution
    }

    pub(crate) fn collector(&self) -> &Arc<Mutex<DependencyCollector>> {
        &self.collector
    }

    // tasks

    /// Starts a child task, or joins it if it was already started in this
    /// build with an equal factory.
    pub fn start_task(&self, id: TaskIdentifier, factory: Arc<dyn TaskFactory>) -> Result<TaskFuture, TaskError> {
        let snapshot = Snapshot::of_factory(factory.as_ref())
            .map_err(|e| self.illegal(format!("Couldn't take a snapshot of the factory of '{id}': {e:#}")))?;

        let key = self
            .execution
            .start(Starter::Task(self.waiter.key), &id, factory, snapshot.clone())?;
        lock(&self.children).insert(id.clone(), snapshot);

        Ok(self.future(key, id))
    }

    /// Starts a child task and waits for its result.
    pub fn run_task(&self, id: TaskIdentifier, factory: Arc<dyn TaskFactory>) -> Result<Value, TaskError> {
        self.start_task(id, factory)?.get()
    }

    /// Waits for the result of a task started earlier in this build and
    /// depends on its whole output.
    pub fn get_task_result(&self, id: &TaskIdentifier) -> Result<Value, TaskError> {
        match self.execution.lookup(id) {
            Some(key) => self.future(key, id.clone()).get(),
            None => Err(self.illegal(format!("Task '{id}' was not started in this build"))),
        }
    }

    /// A handle to any task id. Waiting on it is subject to the usual rules.
    pub fn get_task_future(&self, id: &TaskIdentifier) -> TaskFuture {
        let key = self.execution.key_of(id);
        self.future(key, id.clone())
    }

    fn future(&self, key: TaskKey, id: TaskIdentifier) -> TaskFuture {
        TaskFuture::new(
            self.execution.clone(),
            Some(self.waiter),
            Some(self.collector.clone()),
            key,
            id,
        )
    }

    /// Narrows the interest of this task in the output of `id`. Several
    /// detectors combine: the output is changed if any of them says so.
    pub fn set_task_output_change_detector(
        &self,
        id: &TaskIdentifier,
        detector: &dyn TaskOutputChangeDetector,
    ) -> Result<(), TaskError> {
        let snapshot = Snapshot::of_detector(detector)
            .map_err(|e| self.illegal(format!("Couldn't take a snapshot of the change detector: {e:#}")))?;
        lock(&self.collector).task_detector(id, snapshot);
        Ok(())
    }

    /// Declares which changes of this task's own output matter to consumers.
    /// May be reported once per execution.
    pub fn report_self_task_output_change_detector(&self, detector: &dyn TaskOutputChangeDetector) -> Result<(), TaskError> {
        let snapshot = Snapshot::of_detector(detector)
            .map_err(|e| self.illegal(format!("Couldn't take a snapshot of the change detector: {e:#}")))?;

        let mut reported = lock(&self.self_detector);
        if reported.is_some() {
            return Err(self.illegal("The self output change detector was already reported"));
        }
        *reported = Some(snapshot);
        Ok(())
    }

    // files

    /// Records a dependency on an input file. For the presence classes the
    /// classification observed right now is recorded.
    pub fn report_input_file_dependency(
        &self,
        path: impl AsRef<Utf8Path>,
        descriptor: ContentDescriptor,
    ) -> Result<(), TaskError> {
        let path = path.as_ref();
        let descriptor = self.observe(path, descriptor)?;
        lock(&self.collector).input_file(path.to_owned(), descriptor);
        Ok(())
    }

    pub fn report_output_file_dependency(
        &self,
        path: impl AsRef<Utf8Path>,
        descriptor: ContentDescriptor,
    ) -> Result<(), TaskError> {
        let path = path.as_ref();
        let descriptor = self.observe(path, descriptor)?;
        lock(&self.collector).output_file(path.to_owned(), descriptor);
        Ok(())
    }

    fn observe(&self, path: &Utf8Path, descriptor: ContentDescriptor) -> Result<ContentDescriptor, TaskError> {
        if !descriptor.is_presence_class() {
            return Ok(descriptor);
        }
        let state = self.execution.files.state(path)?;
        Ok(descriptor.observe(&state))
    }

    /// Collects the files matching `pattern` and depends on the set of
    /// matches, not on their contents.
    pub fn report_input_file_addition_dependency(&self, pattern: &str) -> Result<BTreeSet<Utf8PathBuf>, TaskError> {
        let matched = self.execution.files.collect(pattern)?;
        lock(&self.collector).addition(pattern.to_owned(), matched.clone());
        Ok(matched)
    }

    /// Fingerprints a file with the configured policy.
    pub fn fingerprint(&self, path: impl AsRef<Utf8Path>) -> Result<ContentDescriptor, TaskError> {
        Ok(self
            .execution
            .files
            .fingerprint(path.as_ref(), self.execution.config.fingerprint)?)
    }

    /// Reads a file and depends on it, `None` when it doesn't exist.
    pub fn read_input_file(&self, path: impl AsRef<Utf8Path>) -> Result<Option<Vec<u8>>, TaskError> {
        let path = path.as_ref();
        let descriptor = self.fingerprint(path)?;
        lock(&self.collector).input_file(path.to_owned(), descriptor);
        Ok(self.execution.files.read(path)?)
    }

    /// Writes a file and records it as an output of this task.
    pub fn write_output_file(&self, path: impl AsRef<Utf8Path>, bytes: &[u8]) -> Result<(), TaskError> {
        let path = path.as_ref();
        self.execution.files.write(path, bytes)?;
        let descriptor = self.fingerprint(path)?;
        lock(&self.collector).output_file(path.to_owned(), descriptor);
        Ok(())
    }

    // properties

    /// Records that the task expects `property` to have `expected` value.
    pub fn report_environment_dependency(
        &self,
        property: &dyn EnvironmentProperty,
        expected: Value,
    ) -> Result<(), TaskError> {
        let snapshot = self.property_snapshot(Snapshot::of_environment_property(property))?;
        lock(&self.collector)
            .environment(snapshot, PropertyOutcome::Value(expected))
            .map_err(|_| self.conflict(property.tag()))
    }

    /// Computes an environment property and depends on its value.
    pub fn get_environment_property(&self, property: &dyn EnvironmentProperty) -> Result<Value, TaskError> {
        let snapshot = self.property_snapshot(Snapshot::of_environment_property(property))?;
        let outcome = self
            .execution
            .environment_cache
            .get_or_compute(&snapshot, || property.compute(&self.execution.environment));

        lock(&self.collector)
            .environment(snapshot, outcome.clone())
            .map_err(|_| self.conflict(property.tag()))?;
        property_value(property.tag(), outcome)
    }

    pub fn report_execution_dependency(&self, property: &dyn ExecutionProperty, expected: Value) -> Result<(), TaskError> {
        let snapshot = self.property_snapshot(Snapshot::of_execution_property(property))?;
        lock(&self.collector)
            .execution(snapshot, PropertyOutcome::Value(expected))
            .map_err(|_| self.conflict(property.tag()))
    }

    pub fn get_execution_property(&self, property: &dyn ExecutionProperty) -> Result<Value, TaskError> {
        let snapshot = self.property_snapshot(Snapshot::of_execution_property(property))?;
        let outcome = self
            .execution
            .execution_cache
            .get_or_compute(&snapshot, || property.compute(&self.execution.parameters));

        lock(&self.collector)
            .execution(snapshot, outcome.clone())
            .map_err(|_| self.conflict(property.tag()))?;
        property_value(property.tag(), outcome)
    }

    fn property_snapshot(&self, snapshot: anyhow::Result<Snapshot>) -> Result<Snapshot, TaskError> {
        snapshot.map_err(|e| self.illegal(format!("Couldn't take a snapshot of the property: {e:#}")))
    }

    fn conflict(&self, tag: &str) -> TaskError {
        self.illegal(format!("Property '{tag}' was reported with different values"))
    }

    // failure

    /// Records a failure without unwinding the body. The task fails once the
    /// body returns, with the first aborted error as the cause.
    pub fn abort_execution(&self, error: impl Into<anyhow::Error>) {
        let error = SharedError::new(error);
        tracing::debug!("Execution aborted: {error}");
        lock(&self.aborts).push(error);
    }

    // inner tasks

    /// Starts duplicable work, run locally and on suitable cluster
    /// environments while the duplication predicate allows.
    pub fn start_inner_task(
        &self,
        factory: Arc<dyn InnerTaskFactory>,
        parameters: InnerTaskParameters,
    ) -> Result<InnerTaskResults, TaskError> {
        let results = inner::start(self, factory, parameters)?;
        lock(&self.inner).push(results.shared().clone());
        Ok(results)
    }

    // standard IO

    pub fn acquire_standard_io_lock(&self) -> Result<(), TaskError> {
        let execution = &self.execution;
        let acquired = execution.park_while(self.waiter.holder, || {
            execution.stdio.acquire(self.waiter.key, &execution.cancelled)
        });
        match acquired {
            Ok(true) => Ok(()),
            Ok(false) => Err(TaskError::Cancelled),
            Err(StdioMisuse::Reentrant) => Err(self.illegal("The standard IO lock is already held by this task")),
            Err(StdioMisuse::NotHolder) => Err(self.illegal("The standard IO lock is not held by this task")),
        }
    }

    pub fn release_standard_io_lock(&self) -> Result<(), TaskError> {
        self.execution
            .stdio
            .release(self.waiter.key)
            .map_err(|_| self.illegal("The standard IO lock is not held by this task"))
    }

    /// Prints a line to standard output. Waits while another task holds the
    /// standard IO lock.
    pub fn println(&self, line: impl AsRef<str>) {
        self.execution
            .stdio
            .println(self.waiter.key, line.as_ref(), &self.execution.cancelled);
    }

    /// Called once the body returned.
    pub(crate) fn finish(self) -> ContextParts {
        let inner: Vec<_> = std::mem::take(&mut *lock(&self.inner));
        if !inner.is_empty() {
            self.execution.park_while(self.waiter.holder, || {
                for shared in &inner {
                    shared.stop_and_wait();
                }
            });
        }

        if self.execution.stdio.is_held_by(self.waiter.key) {
            let _ = self.execution.stdio.release(self.waiter.key);
            self.abort_execution(self.illegal("The standard IO lock was not released"));
        }

        let collector = match Arc::try_unwrap(self.collector) {
            Ok(collector) => collector.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(shared) => std::mem::take(&mut *lock(&shared)),
        };

        ContextParts {
            dependencies: collector.finish(),
            self_detector: self.self_detector.into_inner().unwrap_or_else(|e| e.into_inner()),
            children: self.children.into_inner().unwrap_or_else(|e| e.into_inner()),
            aborts: self.aborts.into_inner().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

fn property_value(tag: &str, outcome: PropertyOutcome) -> Result<Value, TaskError> {
    match outcome {
        PropertyOutcome::Value(value) => Ok(value),
        PropertyOutcome::Failed(message) => Err(TaskError::PropertyComputation {
            property: tag.to_owned(),
            cause: SharedError::new(anyhow::anyhow!(message)),
        }),
    }
}
