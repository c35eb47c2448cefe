//! Duplicable inner tasks.
//!
//! An inner task is started from a task body and invoked again and again while
//! its duplication predicate allows. Duplicates run on local loops (pool jobs
//! holding computation tokens per duplicate) and on remote loops, one per slot
//! a cluster environment accepted. Every loop claims the next duplicate index
//! from the shared state, runs it, and pushes the outcome to the result queue
//! the starting task consumes with [`InnerTaskResults::get_next`].

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crate::cluster::TaskInvoker;
use crate::cluster::protocol::RemoteOutcome;
use crate::codec::Snapshot;
use crate::core::{TaskIdentifier, Value, lock};
use crate::engine::context::TaskContext;
use crate::engine::runner::{Execution, panic_message};
use crate::engine::tokens::HolderId;
use crate::environment::{EnvironmentProperties, EnvironmentSelector, select};
use crate::error::{ClusterError, SharedError, TaskError};
use crate::task::{DuplicationPredicate, InnerTaskFactory};

/// How an inner task is duplicated and where it may run.
#[derive(Clone)]
pub struct InnerTaskParameters {
    duplication_predicate: Option<Arc<dyn DuplicationPredicate>>,
    cluster_duplicate_factor: usize,
    duplication_cancellable: bool,
    max_local_parallelism: Option<usize>,
    environment_selector: Option<Arc<dyn EnvironmentSelector>>,
    allow_local: bool,
}

impl Default for InnerTaskParameters {
    fn default() -> Self {
        Self {
            duplication_predicate: None,
            cluster_duplicate_factor: 0,
            duplication_cancellable: false,
            max_local_parallelism: None,
            environment_selector: None,
            allow_local: true,
        }
    }
}

impl InnerTaskParameters {
    /// A single invocation on the local machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Without a predicate the inner task is invoked exactly once.
    pub fn with_duplication_predicate(mut self, predicate: impl DuplicationPredicate + 'static) -> Self {
        self.duplication_predicate = Some(Arc::new(predicate));
        self
    }

    /// Number of concurrent duplicates requested from each suitable cluster
    /// environment. Zero keeps the work off the cluster.
    pub fn with_cluster_duplicate_factor(mut self, factor: usize) -> Self {
        self.cluster_duplicate_factor = factor;
        self
    }

    pub fn with_duplication_cancellable(mut self, cancellable: bool) -> Self {
        self.duplication_cancellable = cancellable;
        self
    }

    pub fn with_max_local_parallelism(mut self, count: usize) -> Self {
        self.max_local_parallelism = Some(count.max(1));
        self
    }

    pub fn with_environment_selector(mut self, selector: Arc<dyn EnvironmentSelector>) -> Self {
        self.environment_selector = Some(selector);
        self
    }

    /// Whether duplicates may run on the local machine. Cluster-only work
    /// fails a duplicate when its remote connection is lost.
    pub fn with_allow_local(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }
}

/// Outcome of one duplicate.
#[derive(Debug, Clone)]
pub struct InnerTaskResult {
    /// Name of the environment the duplicate ran in.
    pub environment: String,
    pub outcome: Result<Value, TaskError>,
}

/// What an inner task body sees of its surroundings.
pub struct InnerTaskContext {
    index: usize,
    environment: String,
    properties: Arc<EnvironmentProperties>,
    cancelled: Arc<AtomicBool>,
}

impl InnerTaskContext {
    pub(crate) fn new(
        index: usize,
        environment: String,
        properties: Arc<EnvironmentProperties>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            index,
            environment,
            properties,
            cancelled,
        }
    }

    /// Zero-based number of this duplicate.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn environment_name(&self) -> &str {
        &self.environment
    }

    pub fn properties(&self) -> &EnvironmentProperties {
        &self.properties
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct InnerState {
    results: VecDeque<InnerTaskResult>,
    /// Running loops, local and remote.
    workers: usize,
    local_workers: usize,
    /// The predicate refused or failed, no new indices are handed out.
    exhausted: bool,
    /// Duplication was cancelled, or the owning task finished.
    cancelled: bool,
    started: usize,
    /// Indices lost with a remote connection, waiting for a local loop.
    retries: VecDeque<usize>,
    in_flight: usize,
}

/// State shared by the loops of one inner task and its result handle.
pub(crate) struct InnerShared {
    task: TaskIdentifier,
    predicate: Option<Arc<dyn DuplicationPredicate>>,
    cancellable: bool,
    build_cancelled: Arc<AtomicBool>,
    state: Mutex<InnerState>,
    cond: Condvar,
}

impl InnerShared {
    fn new(
        task: TaskIdentifier,
        predicate: Option<Arc<dyn DuplicationPredicate>>,
        cancellable: bool,
        build_cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task,
            predicate,
            cancellable,
            build_cancelled,
            state: Mutex::new(InnerState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InnerState> {
        lock(&self.state)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, InnerState>) -> MutexGuard<'a, InnerState> {
        self.cond.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn is_build_cancelled(&self) -> bool {
        self.build_cancelled.load(Ordering::SeqCst)
    }

    /// Hands out the index of the next duplicate to run. The predicate is
    /// asked under the lock, so its calls never overlap. When nothing is left
    /// the calling loop is retired in the same critical section.
    fn claim(&self, environment: &str, local: bool) -> Option<usize> {
        let mut state = self.lock();
        if state.cancelled || self.is_build_cancelled() {
            self.retire(&mut state, local);
            return None;
        }
        if let Some(index) = state.retries.pop_front() {
            state.in_flight += 1;
            return Some(index);
        }
        if state.exhausted {
            self.retire(&mut state, local);
            return None;
        }

        let more = match &self.predicate {
            None => Ok(state.started == 0),
            Some(predicate) => predicate.should_invoke_once_more(),
        };

        match more {
            Ok(true) => {
                let index = state.started;
                state.started += 1;
                state.in_flight += 1;
                Some(index)
            }
            Ok(false) => {
                state.exhausted = true;
                self.retire(&mut state, local);
                None
            }
            Err(e) => {
                tracing::warn!(task = %self.task, "Duplication predicate failed: {e:#}");
                state.exhausted = true;
                state.results.push_back(InnerTaskResult {
                    environment: environment.to_owned(),
                    outcome: Err(self.failure(SharedError::new(e))),
                });
                self.retire(&mut state, local);
                None
            }
        }
    }

    fn failure(&self, cause: SharedError) -> TaskError {
        TaskError::Execution {
            id: self.task.clone(),
            cause,
            suppressed: vec![],
        }
    }

    fn deliver(&self, environment: &str, outcome: Result<Value, TaskError>) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.results.push_back(InnerTaskResult {
            environment: environment.to_owned(),
            outcome,
        });
        self.cond.notify_all();
    }

    /// Puts an index lost with a remote back in the queue. Returns whether the
    /// caller must spawn a local loop to pick it up.
    fn requeue(&self, index: usize) -> bool {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.retries.push_back(index);
        self.cond.notify_all();

        if state.local_workers == 0 {
            state.workers += 1;
            state.local_workers += 1;
            true
        } else {
            false
        }
    }

    fn add_workers(&self, count: usize, local: bool) {
        let mut state = self.lock();
        state.workers += count;
        if local {
            state.local_workers += count;
        }
    }

    fn worker_done(&self, local: bool) {
        let mut state = self.lock();
        self.retire(&mut state, local);
    }

    fn retire(&self, state: &mut InnerState, local: bool) {
        state.workers = state.workers.saturating_sub(1);
        if local {
            state.local_workers = state.local_workers.saturating_sub(1);
        }
        // only a cancelled inner task can leave retries without a loop
        if state.workers == 0 {
            while state.retries.pop_front().is_some() {
                state.results.push_back(InnerTaskResult {
                    environment: String::new(),
                    outcome: Err(TaskError::Cancelled),
                });
            }
        }
        self.cond.notify_all();
    }

    fn is_drained(state: &InnerState) -> bool {
        state.workers == 0 && state.in_flight == 0 && state.retries.is_empty()
    }

    fn next_blocking(&self) -> Result<Option<InnerTaskResult>, TaskError> {
        let mut state = self.lock();
        loop {
            if let Some(result) = state.results.pop_front() {
                return Ok(Some(result));
            }
            if Self::is_drained(&state) {
                return Ok(None);
            }
            if self.is_build_cancelled() {
                return Err(TaskError::Cancelled);
            }
            state = self.wait(state);
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        self.cond.notify_all();
    }

    /// Stops new duplicates and waits for the running ones, used when the
    /// owning task body returns.
    pub(crate) fn stop_and_wait(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        while !Self::is_drained(&state) {
            state = self.wait(state);
        }
    }

    pub(crate) fn wake_all(&self) {
        let _state = self.lock();
        self.cond.notify_all();
    }
}

/// Stream of duplicate outcomes, in completion order.
pub struct InnerTaskResults {
    shared: Arc<InnerShared>,
    execution: Arc<Execution>,
    holder: HolderId,
}

impl InnerTaskResults {
    /// Blocks for the next outcome. `None` once duplication is exhausted or
    /// cancelled and every started duplicate was delivered.
    pub fn get_next(&self) -> Result<Option<InnerTaskResult>, TaskError> {
        self.execution
            .park_while(self.holder, || self.shared.next_blocking())
    }

    /// Stops starting new duplicates, if the inner task was started as
    /// cancellable. Running duplicates finish and can still be drained.
    pub fn cancel_duplication_optionally(&self) {
        if self.shared.cancellable {
            tracing::debug!(task = %self.shared.task, "Inner task duplication cancelled");
            self.shared.cancel();
        }
    }

    pub(crate) fn shared(&self) -> &Arc<InnerShared> {
        &self.shared
    }
}

/// Iteration ends at the first `None` or error from
/// [`get_next`](InnerTaskResults::get_next). A cancelled build therefore looks
/// like exhaustion; call `get_next` directly to tell the two apart.
impl Iterator for InnerTaskResults {
    type Item = InnerTaskResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.get_next().ok().flatten()
    }
}

/// Starts an inner task on behalf of the task owning `ctx`.
pub(crate) fn start(
    ctx: &TaskContext,
    factory: Arc<dyn InnerTaskFactory>,
    parameters: InnerTaskParameters,
) -> Result<InnerTaskResults, TaskError> {
    let execution = ctx.execution().clone();
    let task = ctx.task_id().clone();

    let local = parameters.allow_local
        && match &parameters.environment_selector {
            None => true,
            Some(selector) => {
                let selection = select(selector.as_ref(), &execution.environment);
                lock(ctx.collector()).qualifiers(selection.qualifiers);
                selection.suitable
            }
        };

    let remotes = match parameters.cluster_duplicate_factor {
        0 => Vec::new(),
        factor => negotiate(&execution, &task, factory.as_ref(), &parameters, factor),
    };

    if !local && remotes.is_empty() {
        return Err(TaskError::EnvironmentSelection {
            id: task,
            message: "no local or cluster environment is suitable for the inner task".into(),
        });
    }

    let shared = Arc::new(InnerShared::new(
        task,
        parameters.duplication_predicate.clone(),
        parameters.duplication_cancellable,
        execution.cancelled.clone(),
    ));
    lock(&execution.inner).push(Arc::downgrade(&shared));

    if local {
        let loops = match &parameters.duplication_predicate {
            None => 1,
            Some(_) => parameters
                .max_local_parallelism
                .unwrap_or_else(|| execution.tokens.capacity()),
        };
        shared.add_workers(loops, true);
        for _ in 0..loops {
            spawn_local(&execution, &shared, &factory);
        }
    }

    for (invoker, snapshot, accepted) in remotes {
        shared.add_workers(accepted, false);
        for _ in 0..accepted {
            spawn_remote(&execution, &shared, &factory, invoker.clone(), snapshot.clone(), local);
        }
    }

    Ok(InnerTaskResults {
        shared,
        execution,
        holder: ctx.waiter().holder,
    })
}

/// Asks each suitable connected environment how many duplicates it takes.
fn negotiate(
    execution: &Execution,
    task: &TaskIdentifier,
    factory: &dyn InnerTaskFactory,
    parameters: &InnerTaskParameters,
    factor: usize,
) -> Vec<(Arc<dyn TaskInvoker>, Snapshot, usize)> {
    let suitable: Vec<_> = execution
        .invokers
        .iter()
        .filter(|invoker| invoker.is_connected())
        .filter(|invoker| match &parameters.environment_selector {
            None => true,
            Some(selector) => select(selector.as_ref(), invoker.environment()).suitable,
        })
        .collect();

    if suitable.is_empty() {
        return Vec::new();
    }

    let snapshot = match Snapshot::of_inner_factory(factory) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(%task, "Inner task can't be sent to the cluster: {e:#}");
            return Vec::new();
        }
    };

    let mut accepted = Vec::new();
    for invoker in suitable {
        match invoker.negotiate_duplicates(factor) {
            Ok(0) => {}
            Ok(count) => {
                tracing::debug!(%task, remote = invoker.name(), "Remote accepted {count} duplicates");
                accepted.push((invoker.clone(), snapshot.clone(), count));
            }
            Err(e) => tracing::warn!(%task, remote = invoker.name(), "Duplicate negotiation failed: {e}"),
        }
    }
    accepted
}

fn spawn_local(execution: &Arc<Execution>, shared: &Arc<InnerShared>, factory: &Arc<dyn InnerTaskFactory>) {
    let execution = execution.clone();
    let shared = shared.clone();
    let factory = factory.clone();
    let pool = execution.clone();
    pool.pool.submit(move || local_loop(&execution, &shared, factory.as_ref()));
}

fn local_loop(execution: &Execution, shared: &InnerShared, factory: &dyn InnerTaskFactory) {
    let name = execution.config.environment_name.clone();
    let holder = execution.tokens.holder();

    while let Some(index) = shared.claim(&name, true) {
        let Some(token) = execution
            .tokens
            .acquire(holder, factory.requested_tokens(), &execution.cancelled)
        else {
            shared.deliver(&name, Err(TaskError::Cancelled));
            shared.worker_done(true);
            return;
        };

        let ctx = InnerTaskContext::new(
            index,
            name.clone(),
            execution.environment.clone(),
            execution.cancelled.clone(),
        );
        let outcome = run_inner(factory, &ctx).map_err(|e| shared.failure(SharedError::new(e)));
        drop(token);

        shared.deliver(&name, outcome);
    }
}

fn spawn_remote(
    execution: &Arc<Execution>,
    shared: &Arc<InnerShared>,
    factory: &Arc<dyn InnerTaskFactory>,
    invoker: Arc<dyn TaskInvoker>,
    snapshot: Snapshot,
    local_fallback: bool,
) {
    let execution = execution.clone();
    let shared = shared.clone();
    let factory = factory.clone();
    let name = format!("tsumiki-remote-{}", invoker.name());

    let spawned = std::thread::Builder::new().name(name).spawn({
        let shared = shared.clone();
        move || remote_loop(&execution, &shared, &factory, invoker.as_ref(), &snapshot, local_fallback)
    });

    if let Err(e) = spawned {
        tracing::error!("Couldn't spawn remote duplicate thread: {e}");
        shared.worker_done(false);
    }
}

fn remote_loop(
    execution: &Arc<Execution>,
    shared: &Arc<InnerShared>,
    factory: &Arc<dyn InnerTaskFactory>,
    invoker: &dyn TaskInvoker,
    snapshot: &Snapshot,
    local_fallback: bool,
) {
    let name = invoker.name().to_owned();

    while let Some(index) = shared.claim(&name, false) {
        match invoker.invoke(snapshot, index) {
            Ok(RemoteOutcome::Success(value)) => shared.deliver(&name, Ok(value)),
            Ok(RemoteOutcome::Failed(message)) => {
                let cause = SharedError::new(anyhow::anyhow!("{message}"));
                shared.deliver(&name, Err(shared.failure(cause)));
            }
            Err(ClusterError::Cancelled(_)) => {
                shared.deliver(&name, Err(TaskError::Cancelled));
                shared.worker_done(false);
                return;
            }
            Err(_) if execution.is_cancelled() => {
                shared.deliver(&name, Err(TaskError::Cancelled));
                shared.worker_done(false);
                return;
            }
            Err(e) if !invoker.is_connected() || matches!(e, ClusterError::ConnectionLost(_)) => {
                if local_fallback {
                    tracing::warn!(remote = %name, "Remote lost, continuing duplication locally");
                    if shared.requeue(index) {
                        spawn_local(execution, shared, factory);
                    }
                } else {
                    tracing::warn!(remote = %name, "Remote lost and the local environment is not suitable");
                    shared.deliver(&name, Err(TaskError::Cluster(ClusterError::ConnectionLost(name.clone()))));
                }
                shared.worker_done(false);
                return;
            }
            Err(e) => shared.deliver(&name, Err(TaskError::Cluster(e))),
        }
    }
}

/// Runs one duplicate body, turning a panic into an error.
pub(crate) fn run_inner(factory: &dyn InnerTaskFactory, ctx: &InnerTaskContext) -> anyhow::Result<Value> {
    let mut task = factory.create_task();
    match catch_unwind(AssertUnwindSafe(|| task.run(ctx))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("Inner task panicked: {}", panic_message(panic.as_ref()))),
    }
}

impl Execution {
    pub(crate) fn inner_tasks(&self) -> Vec<Arc<InnerShared>> {
        lock(&self.inner).iter().filter_map(Weak::upgrade).collect()
    }
}
