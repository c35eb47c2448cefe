//! Task slots, deduplicated starts, and blocking waits.
//!
//! Every task id touched during an execution gets a slot in the arena,
//! addressed by a [`TaskKey`]. Parent and starter relations are stored as keys,
//! never as references between tasks.
//!
//! The scheduler counts runnable work: queued and running full tasks plus the
//! thread that starts the roots. A waiter leaves the count while it sleeps and
//! is put back by whoever wakes it. When the count drops to zero while tasks
//! are still waiting, nothing can make progress any more and every waiter is
//! failed with a deadlock, in addition to the cycle check done on each wait.

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::codec::Snapshot;
use crate::core::{BuildStamp, TaskIdentifier, Value, lock};
use crate::engine::deadlock::WaitGraph;
use crate::engine::runner::{Execution, panic_message};
use crate::engine::tokens::HolderId;
use crate::error::{SharedError, TaskError};
use crate::task::TaskFactory;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskKey(pub u32);

impl TaskKey {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The final outcome of a task in this execution.
#[derive(Debug)]
pub(crate) struct FinishedTask {
    pub id: TaskIdentifier,
    pub result: Result<Value, TaskError>,
    /// Build that produced the result, older than the current one when reused.
    pub stamp: BuildStamp,
    pub self_detector: Option<Snapshot>,
    pub reused: bool,
}

impl FinishedTask {
    pub(crate) fn failed(id: TaskIdentifier, stamp: BuildStamp, error: TaskError) -> Self {
        Self {
            id,
            result: Err(error),
            stamp,
            self_detector: None,
            reused: false,
        }
    }
}

enum SlotState {
    Unstarted,
    Started,
    Finished(Arc<FinishedTask>),
}

struct Slot {
    id: TaskIdentifier,
    state: SlotState,
    factory: Option<Arc<dyn TaskFactory>>,
    snapshot: Option<Snapshot>,
    short: bool,
    root: bool,
    starters: BTreeSet<TaskKey>,
    waiting_on: Option<TaskKey>,
    /// The wait only serves a delta check, which can do without the result.
    delta_wait: bool,
    deadlocked: bool,
    /// Set when a delta wait was released because its producer was never
    /// started.
    unstarted_producer: bool,
}

impl Slot {
    fn new(id: TaskIdentifier) -> Self {
        Self {
            id,
            state: SlotState::Unstarted,
            factory: None,
            snapshot: None,
            short: false,
            root: false,
            starters: BTreeSet::new(),
            waiting_on: None,
            delta_wait: false,
            deadlocked: false,
            unstarted_producer: false,
        }
    }

    fn finished(&self) -> Option<&Arc<FinishedTask>> {
        match &self.state {
            SlotState::Finished(finished) => Some(finished),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    index: HashMap<TaskIdentifier, TaskKey>,
    waits: WaitGraph,
    runnable: usize,
    unfinished: usize,
}

impl Arena {
    fn slot(&self, key: TaskKey) -> &Slot {
        &self.slots[key.index()]
    }

    fn slot_mut(&mut self, key: TaskKey) -> &mut Slot {
        &mut self.slots[key.index()]
    }

    fn key_of(&mut self, id: &TaskIdentifier) -> TaskKey {
        if let Some(&key) = self.index.get(id) {
            return key;
        }
        let key = TaskKey(self.slots.len() as u32);
        self.slots.push(Slot::new(id.clone()));
        self.index.insert(id.clone(), key);
        key
    }

    /// Whether `ancestor` started `key`, directly or through any chain of
    /// starters.
    fn is_descendant(&self, key: TaskKey, ancestor: TaskKey) -> bool {
        let mut visited = BTreeSet::new();
        let mut pending = vec![key];
        while let Some(key) = pending.pop() {
            for &starter in &self.slot(key).starters {
                if starter == ancestor {
                    return true;
                }
                if visited.insert(starter) {
                    pending.push(starter);
                }
            }
        }
        false
    }

    /// Puts every task waiting on `target` back into the runnable count.
    fn wake_waiters_of(&mut self, target: TaskKey) {
        let mut woken = 0;
        for slot in &mut self.slots {
            if slot.waiting_on == Some(target) {
                slot.waiting_on = None;
                woken += 1;
            }
        }
        self.runnable += woken;
    }

    /// Delta waits on producers that nobody started.
    fn unstarted_delta_waits(&self) -> Vec<TaskKey> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.delta_wait
                    && slot
                        .waiting_on
                        .is_some_and(|target| matches!(self.slot(target).state, SlotState::Unstarted))
            })
            .map(|(index, _)| TaskKey(index as u32))
            .collect()
    }

    /// Fails the given waiters with a deadlock and returns their ids.
    fn fail_waiters(&mut self, keys: &[TaskKey]) -> Vec<TaskIdentifier> {
        let mut ids = Vec::with_capacity(keys.len());
        for &key in keys {
            let slot = self.slot_mut(key);
            slot.deadlocked = true;
            ids.push(slot.id.clone());
            if slot.waiting_on.take().is_some() {
                self.runnable += 1;
            }
        }
        ids
    }
}

/// Who started a task.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Starter {
    /// Requested directly by the caller of the build.
    Root,
    /// Started by a running task body.
    Task(TaskKey),
    /// Restarted by the engine on behalf of a reused parent.
    Implicit(TaskKey),
}

impl Starter {
    fn key(self) -> Option<TaskKey> {
        match self {
            Starter::Root => None,
            Starter::Task(key) | Starter::Implicit(key) => Some(key),
        }
    }
}

/// The task on whose behalf a thread blocks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Waiter {
    pub key: TaskKey,
    pub holder: HolderId,
    pub short: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitPurpose {
    /// A task body asked for the result; legality rules apply.
    Result,
    /// The delta check of a task needs a producer's fresh result.
    Delta,
}

/// Snapshot of one started task at the end of an execution.
pub(crate) struct SlotSummary {
    pub id: TaskIdentifier,
    pub finished: Arc<FinishedTask>,
    pub root: bool,
    pub starters: BTreeSet<TaskIdentifier>,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    arena: Mutex<Arena>,
    cond: Condvar,
}

impl Scheduler {
    fn lock(&self) -> MutexGuard<'_, Arena> {
        lock(&self.arena)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Arena>) -> MutexGuard<'a, Arena> {
        self.cond.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn notify_all(&self) {
        let _arena = self.lock();
        self.cond.notify_all();
    }
}

impl Execution {
    /// Starts `id` unless it was already started in this execution, and
    /// returns its key. Starting the same id with a different factory is a
    /// protocol violation.
    pub(crate) fn start(
        self: &Arc<Self>,
        starter: Starter,
        id: &TaskIdentifier,
        factory: Arc<dyn TaskFactory>,
        snapshot: Snapshot,
    ) -> Result<TaskKey, TaskError> {
        let short = factory.capabilities().short;

        let mut arena = self.scheduler.lock();
        let key = arena.key_of(id);

        if starter.key() == Some(key) {
            return Err(TaskError::illegal(id, "A task cannot start itself"));
        }

        let slot = arena.slot_mut(key);
        if let SlotState::Unstarted = slot.state {
            slot.state = SlotState::Started;
            slot.factory = Some(factory);
            slot.snapshot = Some(snapshot);
            slot.short = short;
        } else {
            if slot.snapshot.as_ref() != Some(&snapshot) {
                return Err(TaskError::illegal(
                    id,
                    "The task was already started with a different factory",
                ));
            }
            record_starter(slot, starter);
            return Ok(key);
        }

        record_starter(slot, starter);
        arena.unfinished += 1;

        if short {
            drop(arena);
            tracing::trace!(%id, "running short task inline");
            self.run_slot(key);
        } else {
            arena.runnable += 1;
            drop(arena);
            let execution = self.clone();
            self.pool.submit(move || execution.run_slot(key));
        }

        Ok(key)
    }

    fn run_slot(self: &Arc<Self>, key: TaskKey) {
        let (id, started) = {
            let arena = self.scheduler.lock();
            let slot = arena.slot(key);
            (slot.id.clone(), slot.factory.clone().zip(slot.snapshot.clone()))
        };

        let finished = match started {
            Some((factory, snapshot)) => match catch_unwind(AssertUnwindSafe(|| {
                self.evaluate(key, &id, factory, snapshot)
            })) {
                Ok(finished) => finished,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(%id, "Engine panicked while evaluating task: {message}");
                    FinishedTask::failed(
                        id.clone(),
                        self.stamp,
                        TaskError::Execution {
                            id,
                            cause: SharedError::new(anyhow::anyhow!("panicked: {message}")),
                            suppressed: vec![],
                        },
                    )
                }
            },
            None => FinishedTask::failed(
                id.clone(),
                self.stamp,
                TaskError::illegal(&id, "Started task has no factory"),
            ),
        };

        self.finish(key, finished);
    }

    fn finish(&self, key: TaskKey, finished: FinishedTask) {
        let mut arena = self.scheduler.lock();
        let slot = arena.slot_mut(key);
        let short = slot.short;
        slot.state = SlotState::Finished(Arc::new(finished));

        arena.unfinished -= 1;
        if !short {
            arena.runnable = arena.runnable.saturating_sub(1);
        }
        arena.wake_waiters_of(key);
        self.check_stall(&mut arena);
        self.scheduler.cond.notify_all();
    }

    /// Key of `id`, creating an unstarted slot for it if needed.
    pub(crate) fn key_of(&self, id: &TaskIdentifier) -> TaskKey {
        self.scheduler.lock().key_of(id)
    }

    pub(crate) fn lookup(&self, id: &TaskIdentifier) -> Option<TaskKey> {
        self.scheduler.lock().index.get(id).copied()
    }

    pub(crate) fn is_started(&self, key: TaskKey) -> bool {
        !matches!(self.scheduler.lock().slot(key).state, SlotState::Unstarted)
    }

    pub(crate) fn finished(&self, key: TaskKey) -> Option<Arc<FinishedTask>> {
        self.scheduler.lock().slot(key).finished().cloned()
    }

    pub(crate) fn id_of(&self, key: TaskKey) -> TaskIdentifier {
        self.scheduler.lock().slot(key).id.clone()
    }

    /// Returns the result of an already finished task.
    pub(crate) fn get_finished(&self, waiter: Option<&Waiter>, target: TaskKey) -> Result<Arc<FinishedTask>, TaskError> {
        let arena = self.scheduler.lock();
        let slot = arena.slot(target);
        match slot.finished() {
            Some(finished) => Ok(finished.clone()),
            None => {
                let requester = waiter.map_or(&slot.id, |w| &arena.slot(w.key).id);
                Err(TaskError::illegal(requester, format!("Task '{}' is not finished yet", slot.id)))
            }
        }
    }

    /// Blocks until `target` finishes.
    ///
    /// A waiting task lends its computation tokens and worker thread to other
    /// work for the duration of the wait.
    pub(crate) fn wait_for(
        &self,
        waiter: Option<&Waiter>,
        target: TaskKey,
        purpose: WaitPurpose,
    ) -> Result<Arc<FinishedTask>, TaskError> {
        let Some(waiter) = waiter else {
            return Ok(self.wait_unattributed(target));
        };

        let mut arena = self.scheduler.lock();

        if purpose == WaitPurpose::Result {
            self.check_wait(&arena, waiter, target)?;
        }

        if let Some(finished) = arena.slot(target).finished() {
            return Ok(finished.clone());
        }

        if let Some(cycle) = arena.waits.add(waiter.key, target) {
            let ids = arena.fail_waiters(&cycle);
            tracing::warn!("Deadlock between {}", join(&ids));
            self.report_deadlock(&ids);
            self.scheduler.cond.notify_all();
        }

        let deadlocked = arena.slot(waiter.key).deadlocked;
        if !deadlocked {
            let slot = arena.slot_mut(waiter.key);
            slot.waiting_on = Some(target);
            slot.delta_wait = purpose == WaitPurpose::Delta;
            arena.runnable = arena.runnable.saturating_sub(1);
            self.check_stall(&mut arena);
        }
        drop(arena);

        self.pool.park();
        self.tokens.lend(waiter.holder);

        let mut arena = self.scheduler.lock();
        let result = loop {
            if let Some(finished) = arena.slot(target).finished() {
                break Ok(finished.clone());
            }
            if arena.slot(waiter.key).deadlocked {
                break Err(TaskError::Deadlock(arena.slot(waiter.key).id.clone()));
            }
            if arena.slot(waiter.key).unstarted_producer {
                break Err(TaskError::illegal(
                    &arena.slot(waiter.key).id,
                    format!("Task '{}' was not started in this build", arena.slot(target).id),
                ));
            }
            if self.cancelled.load(Ordering::SeqCst) {
                break Err(TaskError::Cancelled);
            }
            arena = self.scheduler.wait(arena);
        };

        arena.waits.remove(waiter.key, target);
        let slot = arena.slot_mut(waiter.key);
        slot.deadlocked = false;
        slot.delta_wait = false;
        slot.unstarted_producer = false;
        if slot.waiting_on.take().is_some() {
            arena.runnable += 1;
        }
        drop(arena);

        self.tokens.reclaim(waiter.holder, &self.cancelled);
        self.pool.unpark();
        result
    }

    /// Waits on behalf of the caller of the build, which is not a task.
    fn wait_unattributed(&self, target: TaskKey) -> Arc<FinishedTask> {
        let mut arena = self.scheduler.lock();
        loop {
            if let Some(finished) = arena.slot(target).finished() {
                return finished.clone();
            }
            arena = self.scheduler.wait(arena);
        }
    }

    fn check_wait(&self, arena: &Arena, waiter: &Waiter, target: TaskKey) -> Result<(), TaskError> {
        let own = &arena.slot(waiter.key).id;
        let slot = arena.slot(target);

        if waiter.key == target {
            return Err(TaskError::illegal(own, "A task cannot wait for itself"));
        }
        if self.stdio.is_held_by(waiter.key) {
            return Err(TaskError::illegal(
                own,
                "Cannot wait for a task while holding the standard IO lock",
            ));
        }
        if slot.finished().is_some() {
            return Ok(());
        }
        if let SlotState::Unstarted = slot.state {
            return Err(TaskError::illegal(
                own,
                format!("Task '{}' was not started in this build", slot.id),
            ));
        }
        if waiter.short && !slot.short {
            return Err(TaskError::illegal(
                own,
                format!("A short task cannot wait for the unfinished task '{}'", slot.id),
            ));
        }
        if !arena.is_descendant(target, waiter.key) {
            return Err(TaskError::illegal(
                own,
                format!("Task '{}' is unfinished and was not started by the waiting task", slot.id),
            ));
        }
        Ok(())
    }

    /// Fails all waiters once nothing is left that could wake them.
    ///
    /// Delta checks waiting on a producer that was never started are released
    /// first: once everything is idle, nobody is going to start it, and the
    /// delta treats the producer as changed.
    fn check_stall(&self, arena: &mut Arena) {
        if arena.runnable > 0 || arena.unfinished == 0 {
            return;
        }

        let unstarted = arena.unstarted_delta_waits();
        if !unstarted.is_empty() {
            for &key in &unstarted {
                let slot = arena.slot_mut(key);
                slot.unstarted_producer = true;
                slot.waiting_on = None;
            }
            arena.runnable += unstarted.len();
            tracing::debug!("Releasing {} delta checks on unstarted producers", unstarted.len());
            self.scheduler.cond.notify_all();
            return;
        }

        let stuck: Vec<TaskKey> = arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.waiting_on.is_some())
            .map(|(index, _)| TaskKey(index as u32))
            .collect();

        if stuck.is_empty() {
            return;
        }

        let ids = arena.fail_waiters(&stuck);
        tracing::warn!("No task can make progress, failing waiters {}", join(&ids));
        self.report_deadlock(&ids);
        self.scheduler.cond.notify_all();
    }

    fn report_deadlock(&self, ids: &[TaskIdentifier]) {
        lock(&self.deadlocked).extend(ids.iter().cloned());
        self.metric.deadlock_detected(ids);
    }

    /// Counts the calling thread as runnable, used around root starts.
    pub(crate) fn enter_runnable(&self) {
        self.scheduler.lock().runnable += 1;
    }

    pub(crate) fn leave_runnable(&self) {
        let mut arena = self.scheduler.lock();
        arena.runnable = arena.runnable.saturating_sub(1);
        self.check_stall(&mut arena);
    }

    /// Blocks until every started task has finished.
    pub(crate) fn wait_idle(&self) {
        let mut arena = self.scheduler.lock();
        while arena.unfinished > 0 {
            arena = self.scheduler.wait(arena);
        }
    }

    pub(crate) fn summaries(&self) -> Vec<SlotSummary> {
        let arena = self.scheduler.lock();
        arena
            .slots
            .iter()
            .filter_map(|slot| {
                let finished = slot.finished()?.clone();
                Some(SlotSummary {
                    id: slot.id.clone(),
                    finished,
                    root: slot.root,
                    starters: slot
                        .starters
                        .iter()
                        .map(|&key| arena.slot(key).id.clone())
                        .collect(),
                })
            })
            .collect()
    }
}

fn record_starter(slot: &mut Slot, starter: Starter) {
    match starter.key() {
        Some(key) => {
            slot.starters.insert(key);
        }
        None => slot.root = true,
    }
}

fn join(ids: &[TaskIdentifier]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
