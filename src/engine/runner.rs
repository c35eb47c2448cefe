use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::cluster::TaskInvoker;
use crate::codec::{CodecRegistry, Snapshot};
use crate::config::EngineConfig;
use crate::content::ContentProvider;
use crate::core::{BuildStamp, TaskIdentifier, Value, lock};
use crate::engine::context::{ContextParts, TaskContext};
use crate::engine::delta::{Decision, RerunReason};
use crate::engine::inner::InnerShared;
use crate::engine::pool::WorkerPool;
use crate::engine::scheduler::{FinishedTask, Scheduler, TaskKey, Waiter};
use crate::engine::stdio::StdioLock;
use crate::engine::store::{DeltaFlags, EncodedOutput, RecordedFailure, StoredTask, TaskRecord};
use crate::engine::tokens::{HolderId, TokenPool};
use crate::engine::tracking::DependencyCollector;
use crate::environment::{EnvironmentProperties, ExecutionParameters, PropertyCache, PropertyOutcome, select};
use crate::error::{SharedError, TaskError};
use crate::metric::BuildMetric;
use crate::task::TaskFactory;

/// State of one build execution, shared by every task running in it.
pub(crate) struct Execution {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<CodecRegistry>,
    pub files: Arc<dyn ContentProvider>,
    pub environment: Arc<EnvironmentProperties>,
    pub parameters: ExecutionParameters,
    pub tokens: Arc<TokenPool>,
    pub invokers: Vec<Arc<dyn TaskInvoker>>,
    pub metric: Arc<dyn BuildMetric>,
    pub stamp: BuildStamp,
    pub previous: HashMap<TaskIdentifier, StoredTask>,
    /// Records of the tasks finished in this execution.
    pub records: DashMap<TaskIdentifier, TaskRecord>,
    pub scheduler: Scheduler,
    pub pool: WorkerPool,
    pub stdio: StdioLock,
    pub environment_cache: PropertyCache,
    pub execution_cache: PropertyCache,
    pub cancelled: Arc<AtomicBool>,
    pub load_failures: Mutex<BTreeSet<TaskIdentifier>>,
    pub deadlocked: Mutex<BTreeSet<TaskIdentifier>>,
    pub inner: Mutex<Vec<Weak<InnerShared>>>,
}

impl Execution {
    /// Decides between reusing and executing a started task, and does it.
    pub(crate) fn evaluate(
        self: &Arc<Self>,
        key: TaskKey,
        id: &TaskIdentifier,
        factory: Arc<dyn TaskFactory>,
        snapshot: Snapshot,
    ) -> FinishedTask {
        let span = tracing::info_span!("task", %id);
        let _enter = span.enter();

        if self.cancelled.load(Ordering::SeqCst) {
            return FinishedTask::failed(id.clone(), self.stamp, TaskError::Cancelled);
        }

        let waiter = Waiter {
            key,
            holder: self.tokens.holder(),
            short: factory.capabilities().short,
        };

        let previous = self.previous.get(id);
        let reason = match previous {
            None => RerunReason::New,
            Some(previous) => match self.decide(&waiter, id, &snapshot, previous) {
                Decision::Reuse => return self.reuse(id, previous),
                Decision::Rerun(reason) => reason,
            },
        };

        tracing::debug!("Executing, {reason}");
        self.execute_task(&waiter, id, factory, snapshot, reason)
    }

    fn reuse(&self, id: &TaskIdentifier, previous: &StoredTask) -> FinishedTask {
        tracing::debug!("Reusing result of {}", previous.record.stamp);

        let mut record = previous.record.clone();
        record.flags = DeltaFlags::default();
        self.records.insert(id.clone(), record);
        self.metric.task_reused(id);

        let result = match &previous.record.failure {
            Some(RecordedFailure::EnvironmentSelection(message)) => Err(TaskError::EnvironmentSelection {
                id: id.clone(),
                message: message.clone(),
            }),
            _ => Ok(previous.output.clone().unwrap_or(Value::Null)),
        };

        FinishedTask {
            id: id.clone(),
            result,
            stamp: previous.record.stamp,
            self_detector: previous.record.self_detector.clone(),
            reused: true,
        }
    }

    fn execute_task(
        self: &Arc<Self>,
        waiter: &Waiter,
        id: &TaskIdentifier,
        factory: Arc<dyn TaskFactory>,
        snapshot: Snapshot,
        reason: RerunReason,
    ) -> FinishedTask {
        let mut collector = DependencyCollector::default();

        if let Some(selector) = factory.environment_selector() {
            let selection = select(selector.as_ref(), &self.environment);
            collector.qualifiers(selection.qualifiers);

            if !selection.suitable {
                let message = format!("{selector:?} rejected the local environment");
                tracing::warn!("{message}");
                let parts = ContextParts::failed(collector);
                return self.complete(
                    id,
                    snapshot,
                    Err(TaskError::EnvironmentSelection {
                        id: id.clone(),
                        message: message.clone(),
                    }),
                    Some(RecordedFailure::EnvironmentSelection(message)),
                    parts,
                );
            }
        }

        let Some(token) = self
            .tokens
            .acquire(waiter.holder, factory.requested_tokens(), &self.cancelled)
        else {
            return self.complete(
                id,
                snapshot,
                Err(TaskError::Cancelled),
                Some(RecordedFailure::Execution("cancelled".into())),
                ContextParts::failed(collector),
            );
        };

        let previous_output = self.previous.get(id).and_then(|previous| previous.output.clone());
        let ctx = TaskContext::new(self.clone(), *waiter, id.clone(), previous_output, reason, collector);

        let mut task = factory.create_task();
        let body = match catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
            Ok(body) => body,
            Err(panic) => Err(anyhow::anyhow!("Task panicked: {}", panic_message(panic.as_ref()))),
        };
        drop(task);

        let mut parts = ctx.finish();
        drop(token);

        let result = combine(id, body, std::mem::take(&mut parts.aborts));
        let failure = result.as_ref().err().map(|e| {
            tracing::error!("{e}");
            RecordedFailure::Execution(e.to_string())
        });

        self.complete(id, snapshot, result, failure, parts)
    }

    /// Stores the record of an executed task.
    fn complete(
        &self,
        id: &TaskIdentifier,
        snapshot: Snapshot,
        result: Result<Value, TaskError>,
        mut failure: Option<RecordedFailure>,
        parts: ContextParts,
    ) -> FinishedTask {
        let output = match &result {
            Ok(value) => match EncodedOutput::encode(value) {
                Ok(output) => Some(output),
                Err(e) => {
                    tracing::warn!("Couldn't serialize the task output: {e}");
                    failure = Some(RecordedFailure::Execution(format!("unserializable output: {e}")));
                    None
                }
            },
            Err(_) => None,
        };

        let record = TaskRecord {
            factory: snapshot,
            stamp: self.stamp,
            root: false,
            output,
            failure,
            dependencies: parts.dependencies,
            self_detector: parts.self_detector.clone(),
            children: parts.children,
            created_by: BTreeSet::new(),
            flags: DeltaFlags::default(),
        };

        self.records.insert(id.clone(), record);
        self.metric.task_executed(id);

        FinishedTask {
            id: id.clone(),
            result,
            stamp: self.stamp,
            self_detector: parts.self_detector,
            reused: false,
        }
    }

    /// Runs `wait` with the calling worker parked and its tokens lent out.
    pub(crate) fn park_while<T>(&self, holder: HolderId, wait: impl FnOnce() -> T) -> T {
        self.pool.park();
        self.tokens.lend(holder);
        let result = wait();
        self.tokens.reclaim(holder, &self.cancelled);
        self.pool.unpark();
        result
    }

    pub(crate) fn environment_outcome(&self, property: &Snapshot) -> PropertyOutcome {
        self.environment_cache.get_or_compute(property, || {
            let decoded = self.registry.decode_environment_property(property)?;
            decoded.compute(&self.environment)
        })
    }

    pub(crate) fn execution_outcome(&self, property: &Snapshot) -> PropertyOutcome {
        self.execution_cache.get_or_compute(property, || {
            let decoded = self.registry.decode_execution_property(property)?;
            decoded.compute(&self.parameters)
        })
    }

    pub(crate) fn note_load_failure(&self, id: &TaskIdentifier) {
        tracing::warn!(%id, "Previous output could not be loaded, executing again");
        lock(&self.load_failures).insert(id.clone());
        self.metric.output_load_failed(id);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Aborts the execution: wakes every blocked task and stops remote work.
    pub(crate) fn cancel(&self) {
        tracing::info!("Cancelling build execution");
        self.cancelled.store(true, Ordering::SeqCst);
        self.scheduler.notify_all();
        self.tokens.wake_all();
        self.stdio.wake_all();

        for shared in self.inner_tasks() {
            shared.wake_all();
        }
        for invoker in &self.invokers {
            invoker.cancel_all();
        }
    }
}

fn combine(id: &TaskIdentifier, body: anyhow::Result<Value>, aborts: Vec<SharedError>) -> Result<Value, TaskError> {
    match body {
        Ok(value) if aborts.is_empty() => Ok(value),
        Ok(_) => {
            let mut aborts = aborts.into_iter();
            let cause = aborts
                .next()
                .unwrap_or_else(|| SharedError::new(anyhow::anyhow!("aborted")));
            Err(TaskError::Execution {
                id: id.clone(),
                cause,
                suppressed: aborts.collect(),
            })
        }
        Err(e) => Err(TaskError::Execution {
            id: id.clone(),
            cause: SharedError::new(e),
            suppressed: aborts,
        }),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
