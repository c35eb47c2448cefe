//! Computation tokens: a bounded budget of concurrently running computation.
//!
//! Requests are served in arrival order. A request larger than the whole
//! capacity is admitted once nothing else is allocated, so it cannot starve.
//! A holder that blocks on something else lends its units back to the pool and
//! reclaims them, ahead of queued requests, when it wakes up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::core::lock;

pub(crate) type HolderId = u64;

pub struct TokenPool {
    capacity: usize,
    state: Mutex<PoolState>,
    cond: Condvar,
    next_holder: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    allocated: usize,
    held: HashMap<HolderId, usize>,
    lent: HashMap<HolderId, usize>,
    queue: VecDeque<u64>,
    reclaiming: usize,
    next_ticket: u64,
    peak: usize,
}

impl PoolState {
    fn admissible(&self, capacity: usize, count: usize) -> bool {
        self.allocated + count <= capacity || self.allocated == 0
    }

    fn allocate(&mut self, holder: HolderId, count: usize) {
        self.allocated += count;
        *self.held.entry(holder).or_default() += count;
        self.peak = self.peak.max(self.allocated);
    }
}

/// Units held by one holder, returned to the pool on drop.
pub struct ComputationToken {
    pool: Arc<TokenPool>,
    holder: HolderId,
    count: usize,
}

impl ComputationToken {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for ComputationToken {
    fn drop(&mut self) {
        self.pool.release(self.holder, self.count);
    }
}

impl std::fmt::Debug for ComputationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationToken")
            .field("holder", &self.holder)
            .field("count", &self.count)
            .finish()
    }
}

impl TokenPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(PoolState::default()),
            cond: Condvar::new(),
            next_holder: AtomicU64::new(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated(&self) -> usize {
        lock(&self.state).allocated
    }

    /// Highest allocation observed since the last [`reset_peak`](Self::reset_peak).
    pub fn peak(&self) -> usize {
        lock(&self.state).peak
    }

    pub fn reset_peak(&self) {
        let mut state = lock(&self.state);
        state.peak = state.allocated;
    }

    pub(crate) fn holder(&self) -> HolderId {
        self.next_holder.fetch_add(1, Ordering::Relaxed)
    }

    /// Blocks until `count` units can be allocated to `holder`. Returns `None`
    /// when `cancelled` was raised while waiting.
    pub(crate) fn acquire(
        self: &Arc<Self>,
        holder: HolderId,
        count: usize,
        cancelled: &AtomicBool,
    ) -> Option<ComputationToken> {
        if count == 0 {
            return Some(ComputationToken {
                pool: self.clone(),
                holder,
                count,
            });
        }

        let mut state = lock(&self.state);
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            if cancelled.load(Ordering::SeqCst) {
                state.queue.retain(|&t| t != ticket);
                self.cond.notify_all();
                return None;
            }

            let first = state.queue.front() == Some(&ticket);
            if first && state.reclaiming == 0 && state.admissible(self.capacity, count) {
                state.queue.pop_front();
                state.allocate(holder, count);
                self.cond.notify_all();
                return Some(ComputationToken {
                    pool: self.clone(),
                    holder,
                    count,
                });
            }

            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn release(&self, holder: HolderId, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = lock(&self.state);
        let held = state.held.get(&holder).copied().unwrap_or(0);
        let returned = held.min(count);
        if held > returned {
            state.held.insert(holder, held - returned);
        } else {
            state.held.remove(&holder);
        }
        state.allocated -= returned;
        self.cond.notify_all();
    }

    /// Temporarily gives back everything `holder` has allocated.
    pub(crate) fn lend(&self, holder: HolderId) {
        let mut state = lock(&self.state);
        if let Some(count) = state.held.remove(&holder) {
            state.allocated -= count;
            state.lent.insert(holder, count);
            self.cond.notify_all();
        }
    }

    /// Takes back what [`lend`](Self::lend) gave away, with priority over
    /// queued requests. When cancelled, the units are dropped instead.
    pub(crate) fn reclaim(&self, holder: HolderId, cancelled: &AtomicBool) {
        let mut state = lock(&self.state);
        let Some(count) = state.lent.remove(&holder) else {
            return;
        };

        state.reclaiming += 1;
        loop {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            if state.admissible(self.capacity, count) {
                state.allocate(holder, count);
                break;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.reclaiming -= 1;
        self.cond.notify_all();
    }

    /// Wakes every waiter so that it can observe cancellation.
    pub(crate) fn wake_all(&self) {
        let _state = lock(&self.state);
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated())
            .finish()
    }
}
