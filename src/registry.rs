//! Bookkeeping of which workers exist and what they are doing.
//!
//! The idle and busy sets are a single identity-keyed table of state tags
//! guarded by one mutex, so a worker can never be observed in both. The
//! condition variable is notified on every change that could unblock a
//! waiter: a worker becoming idle, a worker leaving the pool, the size limits
//! changing, or shutdown starting.

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::task::Task;

/// Opaque identity of a worker, unique within a single pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Waiting on its inbox and available to the dispatcher.
    Idle,

    /// Claimed by the dispatcher. The worker is either running a task or
    /// about to receive one.
    Busy,

    /// Asked to stop. The entry is removed once the worker thread exits.
    Terminated,
}

/// The outcome of the dispatcher asking for a worker.
pub(crate) enum Claim {
    /// An idle worker was reused.
    Reused(WorkerId, Sender<Task>),

    /// A new worker was spawned to grow the pool.
    Spawned(WorkerId, Sender<Task>),

    /// Growing the pool was necessary but the worker thread failed to spawn.
    SpawnFailed(io::Error),

    /// The pool is shutting down and no worker will be handed out.
    ShuttingDown,
}

/// A worker that was told to stop during shutdown.
pub(crate) struct Terminated {
    pub(crate) id: WorkerId,
    pub(crate) was: WorkerState,
    pub(crate) thread: Option<JoinHandle<()>>,
}

struct Entry {
    state: WorkerState,

    /// Sending half of the worker's single-slot inbox. Dropping it tells the
    /// worker to exit once it next waits for work.
    inbox: Option<Sender<Task>>,

    thread: Option<JoinHandle<()>>,
}

struct State {
    workers: HashMap<WorkerId, Entry>,

    /// Idle workers in the order they became idle. May contain ids of workers
    /// that have since left the idle state; those are skipped when popped.
    idle_order: VecDeque<WorkerId>,

    idle_count: usize,
    busy_count: usize,
    next_id: u64,

    min_size: usize,
    max_size: usize,
    idle_timeout: Option<Duration>,

    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
}

impl State {
    fn transition(&mut self, id: WorkerId, to: WorkerState) {
        let from = match self.workers.get_mut(&id) {
            Some(entry) => std::mem::replace(&mut entry.state, to),
            None => return,
        };

        match from {
            WorkerState::Idle => self.idle_count -= 1,
            WorkerState::Busy => self.busy_count -= 1,
            WorkerState::Terminated => {}
        }

        match to {
            WorkerState::Idle => {
                self.idle_count += 1;
                self.idle_order.push_back(id);
            }
            WorkerState::Busy => self.busy_count += 1,
            WorkerState::Terminated => {
                if let Some(entry) = self.workers.get_mut(&id) {
                    entry.inbox.take();
                }
            }
        }
    }

    fn remove(&mut self, id: WorkerId) -> bool {
        if !self.workers.contains_key(&id) {
            return false;
        }

        self.transition(id, WorkerState::Terminated);
        self.workers.remove(&id);

        true
    }

    fn pop_idle(&mut self) -> Option<WorkerId> {
        if self.idle_count == 0 {
            self.idle_order.clear();
            return None;
        }

        while let Some(id) = self.idle_order.pop_front() {
            if self.state_of(id) == WorkerState::Idle {
                return Some(id);
            }
        }

        None
    }

    fn state_of(&self, id: WorkerId) -> WorkerState {
        self.workers
            .get(&id)
            .map(|entry| entry.state)
            .unwrap_or(WorkerState::Terminated)
    }

    fn inbox(&self, id: WorkerId) -> Option<Sender<Task>> {
        self.workers.get(&id).and_then(|entry| entry.inbox.clone())
    }

    /// Number of workers not yet told to stop.
    fn live(&self) -> usize {
        self.idle_count + self.busy_count
    }

    /// Number of workers exempt from idle eviction.
    fn retained_size(&self) -> usize {
        self.min_size.min(self.max_size)
    }
}

pub(crate) struct Registry {
    state: Mutex<State>,
    changed: Condvar,
}

impl Registry {
    pub(crate) fn new(min_size: usize, max_size: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(State {
                workers: HashMap::new(),
                idle_order: VecDeque::new(),
                idle_count: 0,
                busy_count: 0,
                next_id: 0,
                min_size,
                max_size,
                idle_timeout,
                shutting_down: false,
                shutdown_deadline: None,
            }),
            changed: Condvar::new(),
        }
    }

    // No user code ever runs under this lock, so a poisoned lock still holds
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, State>, bool) {
        match deadline {
            None => (self.wait(guard), true),
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(timeout) if !timeout.is_zero() => {
                    let (guard, _) = self
                        .changed
                        .wait_timeout(guard, timeout)
                        .unwrap_or_else(PoisonError::into_inner);
                    (guard, true)
                }
                _ => (guard, false),
            },
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.lock().workers.len()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.lock().idle_count
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.lock().busy_count
    }

    pub(crate) fn max_size(&self) -> usize {
        self.lock().max_size
    }

    pub(crate) fn min_size(&self) -> usize {
        self.lock().min_size
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.lock().idle_timeout
    }

    /// Change the maximum size. Idle workers in excess of the new limit are
    /// told to stop; busy ones retire when their current task completes.
    pub(crate) fn set_max_size(&self, max_size: usize) {
        let mut state = self.lock();
        state.max_size = max_size;

        for _ in max_size..state.live() {
            match state.pop_idle() {
                Some(id) => {
                    log::debug!("retiring idle worker {}, size limit is now {}", id, max_size);
                    state.transition(id, WorkerState::Terminated);
                }
                None => break,
            }
        }

        self.changed.notify_all();
    }

    pub(crate) fn set_idle_timeout(&self, idle_timeout: Option<Duration>) {
        self.lock().idle_timeout = idle_timeout;
    }

    /// Find a worker for the next task, marking it busy.
    ///
    /// Prefers the longest-idle worker. If none is idle and the pool is below
    /// its maximum size, a new worker is spawned via `spawn` while the lock is
    /// held, so registration and the size increment are a single step. At
    /// capacity this blocks until something changes.
    pub(crate) fn claim<S>(&self, mut spawn: S) -> Claim
    where
        S: FnMut(WorkerId, Receiver<Task>) -> io::Result<JoinHandle<()>>,
    {
        let mut state = self.lock();

        loop {
            if state.shutting_down {
                return Claim::ShuttingDown;
            }

            if let Some(id) = state.pop_idle() {
                state.transition(id, WorkerState::Busy);

                match state.inbox(id) {
                    Some(inbox) => return Claim::Reused(id, inbox),
                    None => continue,
                }
            }

            if state.workers.len() < state.max_size {
                let id = WorkerId(state.next_id);
                state.next_id += 1;

                let (sender, receiver) = bounded(1);

                return match spawn(id, receiver) {
                    Ok(thread) => {
                        state.workers.insert(
                            id,
                            Entry {
                                state: WorkerState::Busy,
                                inbox: Some(sender.clone()),
                                thread: Some(thread),
                            },
                        );
                        state.busy_count += 1;

                        Claim::Spawned(id, sender)
                    }
                    Err(e) => Claim::SpawnFailed(e),
                };
            }

            state = self.wait(state);
        }
    }

    /// Register a worker spawned ahead of demand. It starts out idle.
    pub(crate) fn prestart<S>(&self, mut spawn: S) -> io::Result<()>
    where
        S: FnMut(WorkerId, Receiver<Task>) -> io::Result<JoinHandle<()>>,
    {
        let mut state = self.lock();

        let id = WorkerId(state.next_id);
        state.next_id += 1;

        let (sender, receiver) = bounded(1);
        let thread = spawn(id, receiver)?;

        state.workers.insert(
            id,
            Entry {
                state: WorkerState::Idle,
                inbox: Some(sender),
                thread: Some(thread),
            },
        );
        state.idle_count += 1;
        state.idle_order.push_back(id);
        self.changed.notify_all();

        Ok(())
    }

    /// Called by a worker after running a task. Returns true if the worker
    /// should exit instead of waiting for more work.
    pub(crate) fn finish_task(&self, id: WorkerId) -> bool {
        let mut state = self.lock();

        let retire = match state.state_of(id) {
            WorkerState::Busy => state.live() > state.max_size,
            WorkerState::Idle => return false,
            WorkerState::Terminated => true,
        };

        if retire {
            state.remove(id);
        } else {
            state.transition(id, WorkerState::Idle);
        }

        self.changed.notify_all();

        retire
    }

    /// Called by a worker whose wait for work timed out. Returns true if the
    /// worker should exit.
    ///
    /// A worker the dispatcher has already claimed must stay, since a task
    /// is on its way to it. Workers at or below the minimum size also stay.
    pub(crate) fn idle_timed_out(&self, id: WorkerId) -> bool {
        let mut state = self.lock();

        let exit = match state.state_of(id) {
            WorkerState::Busy => false,
            WorkerState::Idle => state.live() > state.retained_size(),
            WorkerState::Terminated => true,
        };

        if exit {
            state.remove(id);
            self.changed.notify_all();
        }

        exit
    }

    /// Remove a worker that is exiting. Removing a worker twice is a no-op.
    pub(crate) fn deregister(&self, id: WorkerId) {
        let mut state = self.lock();

        if state.remove(id) {
            self.changed.notify_all();
        }
    }

    /// Flag the pool as shutting down and wake every waiter. A deadline, if
    /// given, bounds how long the dispatcher waits for each worker.
    pub(crate) fn begin_shutdown(&self, deadline: Option<Instant>) {
        let mut state = self.lock();
        state.shutting_down = true;

        if deadline.is_some() {
            state.shutdown_deadline = deadline;
        }

        self.changed.notify_all();
    }

    pub(crate) fn shutdown_deadline(&self) -> Option<Instant> {
        self.lock().shutdown_deadline
    }

    /// Tell every worker to stop, busy workers first, and hand back their
    /// thread handles. Busy workers finish their current task before they
    /// notice.
    pub(crate) fn terminate_all(&self) -> Vec<Terminated> {
        let mut state = self.lock();

        let mut ids: Vec<(WorkerId, WorkerState)> = state
            .workers
            .iter()
            .map(|(id, entry)| (*id, entry.state))
            .collect();
        ids.sort_by_key(|(id, was)| (*was != WorkerState::Busy, *id));

        let terminated = ids
            .into_iter()
            .map(|(id, was)| {
                state.transition(id, WorkerState::Terminated);

                Terminated {
                    id,
                    was,
                    thread: state
                        .workers
                        .get_mut(&id)
                        .and_then(|entry| entry.thread.take()),
                }
            })
            .collect();

        self.changed.notify_all();

        terminated
    }

    /// Block until the given worker has left the pool or the deadline passes.
    /// Returns true if the worker is gone.
    pub(crate) fn wait_for_exit(&self, id: WorkerId, deadline: Option<Instant>) -> bool {
        let mut state = self.lock();

        while state.workers.contains_key(&id) {
            let (guard, in_time) = self.wait_until(state, deadline);
            state = guard;

            if !in_time {
                return !state.workers.contains_key(&id);
            }
        }

        true
    }

    /// Block until every worker has left the pool or the deadline passes.
    /// Returns true if the pool is empty.
    pub(crate) fn wait_until_empty(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.lock();

        while !state.workers.is_empty() {
            let (guard, in_time) = self.wait_until(state, deadline);
            state = guard;

            if !in_time {
                return state.workers.is_empty();
            }
        }

        true
    }
}
