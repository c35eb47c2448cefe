//! The incremental build engine.
//!
//! A [`BuildEngine`] owns the dependency database and the computation token
//! pool across builds. Each call to [`BuildEngine::execute`] creates one
//! execution: the requested roots are started, every started task is either
//! reused or executed depending on its dependency delta, and the records of
//! the execution are reconciled with the previous database afterwards.

mod abandon;
mod context;
mod deadlock;
mod delta;
mod future;
mod inner;
mod pool;
mod report;
mod runner;
mod scheduler;
mod stdio;
mod store;
mod tokens;
mod tracking;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use dashmap::DashMap;

use crate::cluster::TaskInvoker;
use crate::codec::{CodecRegistry, Snapshot};
use crate::config::EngineConfig;
use crate::content::ContentProvider;
use crate::core::{BuildStamp, TaskIdentifier, Value, lock};
use crate::environment::{EnvironmentProperties, ExecutionParameters, PropertyCache};
use crate::error::{DatabaseError, EngineError, TaskError};
use crate::metric::{BuildMetric, NoMetric};
use crate::task::TaskFactory;

use self::pool::WorkerPool;
use self::runner::Execution;
use self::scheduler::{Scheduler, Starter, WaitPurpose};
use self::stdio::StdioLock;
use self::store::Database;

pub use self::context::TaskContext;
pub use self::delta::RerunReason;
pub use self::future::{TaskDependencyFuture, TaskFuture};
pub use self::inner::{InnerTaskContext, InnerTaskParameters, InnerTaskResult, InnerTaskResults};
pub use self::report::BuildReport;
pub use self::tokens::{ComputationToken, TokenPool};

pub(crate) use self::inner::run_inner;

/// Long-lived engine state shared by consecutive builds.
pub struct BuildEngine {
    config: Arc<EngineConfig>,
    registry: Arc<CodecRegistry>,
    files: Arc<dyn ContentProvider>,
    environment: Arc<EnvironmentProperties>,
    tokens: Arc<TokenPool>,
    invokers: Vec<Arc<dyn TaskInvoker>>,
    metric: Arc<dyn BuildMetric>,
    /// Loaded lazily on the first execution.
    database: Mutex<Option<Database>>,
    running: AtomicBool,
    current: Mutex<Weak<Execution>>,
}

impl BuildEngine {
    pub fn new(config: EngineConfig, registry: CodecRegistry, files: Arc<dyn ContentProvider>) -> Self {
        let mut environment = EnvironmentProperties::local();
        environment.extend(config.environment_properties.clone());
        let tokens = TokenPool::new(config.token_capacity());

        tracing::debug!(
            tokens = tokens.capacity(),
            workers = config.worker_limit(),
            "Build engine created"
        );

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            files,
            environment: Arc::new(environment),
            tokens,
            invokers: Vec::new(),
            metric: Arc::new(NoMetric),
            database: Mutex::new(None),
            running: AtomicBool::new(false),
            current: Mutex::new(Weak::new()),
        }
    }

    /// Injects an observer of engine decisions.
    pub fn with_metric(mut self, metric: Arc<dyn BuildMetric>) -> Self {
        self.metric = metric;
        self
    }

    /// Makes a cluster environment available to inner tasks.
    pub fn add_invoker(&mut self, invoker: Arc<dyn TaskInvoker>) {
        invoker.on_connection_lost(Box::new(|name| {
            tracing::warn!(remote = name, "Cluster connection lost");
        }));
        self.invokers.push(invoker);
    }

    /// Overrides a property of the local environment.
    pub fn set_environment_property(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.environment).insert(key, value);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &EnvironmentProperties {
        &self.environment
    }

    /// The computation token pool shared by every execution of this engine.
    pub fn tokens(&self) -> &Arc<TokenPool> {
        &self.tokens
    }

    /// Cancels the running execution, if any.
    pub fn cancel(&self) {
        if let Some(execution) = lock(&self.current).upgrade() {
            execution.cancel();
        }
    }

    /// Runs one build with the given root tasks.
    pub fn execute(
        &self,
        roots: Vec<(TaskIdentifier, Arc<dyn TaskFactory>)>,
        parameters: ExecutionParameters,
    ) -> Result<BuildReport, EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }
        let _running = Running(&self.running);

        let database = self.take_database()?;
        let stamp = BuildStamp(database.build_counter).next();

        let span = tracing::info_span!("build", stamp = stamp.0);
        let _enter = span.enter();
        let start = Instant::now();
        tracing::info!(roots = roots.len(), "Starting build");

        let execution = Arc::new(Execution {
            config: self.config.clone(),
            registry: self.registry.clone(),
            files: self.files.clone(),
            environment: self.environment.clone(),
            parameters,
            tokens: self.tokens.clone(),
            invokers: self.invokers.clone(),
            metric: self.metric.clone(),
            stamp,
            previous: database.tasks,
            records: DashMap::new(),
            scheduler: Scheduler::default(),
            pool: WorkerPool::new("tsumiki-worker", self.config.worker_limit()),
            stdio: StdioLock::default(),
            environment_cache: PropertyCache::default(),
            execution_cache: PropertyCache::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
            load_failures: Mutex::default(),
            deadlocked: Mutex::default(),
            inner: Mutex::default(),
        });
        *lock(&self.current) = Arc::downgrade(&execution);

        let started = self.start_roots(&execution, roots);

        let mut results = BTreeMap::new();
        for (id, key) in started {
            let result = key.and_then(|key| {
                let finished = execution.wait_for(None, key, WaitPurpose::Result)?;
                finished.result.clone()
            });
            results.insert(id, result);
        }

        execution.wait_idle();
        execution.pool.shutdown();

        let summaries = execution.summaries();
        let successful = !execution.is_cancelled() && summaries.iter().all(|summary| summary.finished.result.is_ok());
        let reconciled = execution.reconcile(&summaries, successful);

        let mut report = BuildReport {
            stamp,
            duration: start.elapsed(),
            results,
            executed: BTreeMap::new(),
            reused: BTreeSet::new(),
            abandoned: reconciled.abandoned,
            output_load_failures: lock(&execution.load_failures).clone(),
            deadlocked: lock(&execution.deadlocked).clone(),
            failed: BTreeMap::new(),
        };
        for summary in &summaries {
            let finished = &summary.finished;
            if finished.reused {
                report.reused.insert(summary.id.clone());
            } else {
                report
                    .executed
                    .insert(summary.id.clone(), finished.result.as_ref().ok().cloned());
            }
            if let Err(e) = &finished.result {
                report.failed.insert(summary.id.clone(), e.clone());
            }
        }

        tracing::info!(
            executed = report.executed.len(),
            reused = report.reused.len(),
            abandoned = report.abandoned.len(),
            failed = report.failed.len(),
            "Build finished in {:.2?}",
            report.duration
        );

        let saved = match self.config.persist {
            true => reconciled.database.save(&self.config.database_file()),
            false => Ok(()),
        };
        *lock(&self.database) = Some(reconciled.database);
        saved?;

        Ok(report)
    }

    fn start_roots(
        &self,
        execution: &Arc<Execution>,
        roots: Vec<(TaskIdentifier, Arc<dyn TaskFactory>)>,
    ) -> Vec<(TaskIdentifier, Result<scheduler::TaskKey, TaskError>)> {
        execution.enter_runnable();

        let started = roots
            .into_iter()
            .map(|(id, factory)| {
                let key = Snapshot::of_factory(factory.as_ref())
                    .map_err(|e| TaskError::illegal(&id, format!("Couldn't take a snapshot of the factory: {e:#}")))
                    .and_then(|snapshot| execution.start(Starter::Root, &id, factory, snapshot));
                (id, key)
            })
            .collect();

        execution.leave_runnable();
        started
    }

    fn take_database(&self) -> Result<Database, EngineError> {
        if let Some(database) = lock(&self.database).take() {
            return Ok(database);
        }

        let path = self.config.database_file();
        match Database::load(&path) {
            Ok(database) => {
                tracing::debug!(%path, tasks = database.tasks.len(), "Loaded task database");
                Ok(database)
            }
            Err(DatabaseError::Io(e)) => Err(DatabaseError::Io(e).into()),
            Err(e) => {
                tracing::warn!(%path, "Starting from an empty task database: {e}");
                Ok(Database::default())
            }
        }
    }
}

/// Clears the running flag when an execution ends, however it ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
