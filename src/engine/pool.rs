//! Worker threads for task bodies.
//!
//! Task bodies block: they wait for other tasks, for inner task results, and
//! for computation tokens. A thread which is about to block on another task
//! parks itself, which lets the pool start a replacement thread, so at most
//! `limit` threads are actively running at once while blocked threads never
//! starve the queue.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::core::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

const IDLE_TIMEOUT: Duration = Duration::from_secs(2);

static POOL_IDS: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool this thread works for, 0 outside of any pool.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    id: usize,
    name: String,
    limit: usize,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    threads: usize,
    active: usize,
    idle: usize,
    spawned: usize,
    shutdown: bool,
}

impl WorkerPool {
    pub(crate) fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                limit: limit.max(1),
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = lock(&self.shared.state);
        state.jobs.push_back(Box::new(job));
        self.shared.dispatch(&mut state);
    }

    /// Marks the calling worker as blocked. No-op on foreign threads.
    pub(crate) fn park(&self) {
        if !self.is_worker() {
            return;
        }
        let mut state = lock(&self.shared.state);
        state.active -= 1;
        self.shared.dispatch(&mut state);
    }

    pub(crate) fn unpark(&self) {
        if !self.is_worker() {
            return;
        }
        lock(&self.shared.state).active += 1;
    }

    pub(crate) fn shutdown(&self) {
        let mut state = lock(&self.shared.state);
        state.shutdown = true;
        self.shared.cond.notify_all();
    }

    fn is_worker(&self) -> bool {
        WORKER_OF.with(Cell::get) == self.shared.id
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn dispatch(self: &Arc<Self>, state: &mut State) {
        if state.jobs.is_empty() {
            return;
        }
        if state.jobs.len() <= state.idle {
            self.cond.notify_one();
        } else if state.active < self.limit {
            self.spawn(state);
        } else if state.idle > 0 {
            self.cond.notify_one();
        }
    }

    fn spawn(self: &Arc<Self>, state: &mut State) {
        state.spawned += 1;
        state.threads += 1;
        state.active += 1;

        let shared = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, state.spawned))
            .spawn(move || shared.work());

        if let Err(e) = spawned {
            state.threads -= 1;
            state.active -= 1;
            tracing::error!("Couldn't spawn a worker thread: {e}");
        }
    }

    fn work(self: Arc<Self>) {
        WORKER_OF.with(|cell| cell.set(self.id));

        let mut state = lock(&self.state);
        loop {
            if let Some(job) = state.jobs.pop_front() {
                drop(state);
                job();
                state = lock(&self.state);
                continue;
            }

            if state.shutdown {
                break;
            }

            state.active -= 1;
            state.idle += 1;
            let (guard, timeout) = self
                .cond
                .wait_timeout(state, IDLE_TIMEOUT)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            state.idle -= 1;

            if state.jobs.is_empty() && (timeout.timed_out() || state.shutdown) {
                state.threads -= 1;
                return;
            }
            state.active += 1;
        }

        state.active -= 1;
        state.threads -= 1;
    }
}
