//! The control loop that hands queued tasks to workers.

use std::{io, sync::Arc, thread::JoinHandle, time::Duration};

use crossbeam_channel::{select, Receiver, TryRecvError, TrySendError};
use thiserror::Error;

use crate::{
    registry::{Claim, Registry, WorkerId},
    task::Task,
    worker::{self, ThreadConfig},
};

/// How long to wait before retrying a task after a worker failed to spawn.
const SPAWN_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Starts a worker thread. Called with the registry lock held.
pub(crate) type Spawner =
    fn(WorkerId, Receiver<Task>, Arc<Registry>, &ThreadConfig) -> io::Result<JoinHandle<()>>;

#[derive(Debug, Error)]
enum DispatchError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("worker {0} could not accept a task")]
    Handoff(WorkerId),
}

/// Pulls tasks off the queue in submission order and delivers each one to an
/// idle worker, growing the pool when nothing is idle and there is room.
pub(crate) struct Dispatcher {
    tasks: Receiver<Task>,

    /// Never receives a value. Disconnects when the pool is shut down.
    cancel: Receiver<()>,

    registry: Arc<Registry>,
    config: ThreadConfig,
    spawner: Spawner,

    /// A task that could not be dispatched on a previous iteration. It is
    /// retried before anything else is taken off the queue.
    pending: Option<Task>,
}

impl Dispatcher {
    pub(crate) fn new(
        tasks: Receiver<Task>,
        cancel: Receiver<()>,
        registry: Arc<Registry>,
        config: ThreadConfig,
    ) -> Self {
        Self {
            tasks,
            cancel,
            registry,
            config,
            spawner: worker::spawn,
            pending: None,
        }
    }

    #[cfg(test)]
    fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = spawner;
        self
    }

    pub(crate) fn run(mut self) {
        log::debug!("dispatcher started");

        while let Some(task) = self.next_task() {
            if let Err(e) = self.dispatch(task) {
                log::error!("failed to dispatch task: {}", e);

                if let DispatchError::Spawn(_) = e {
                    self.backoff();
                }
            }
        }

        self.terminate_workers();

        log::debug!("dispatcher stopped");
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn next_task(&mut self) -> Option<Task> {
        if self.is_cancelled() {
            return None;
        }

        if let Some(task) = self.pending.take() {
            return Some(task);
        }

        select! {
            recv(self.tasks) -> task => task.ok(),
            recv(self.cancel) -> _ => None,
        }
    }

    fn dispatch(&mut self, task: Task) -> Result<(), DispatchError> {
        let registry = &self.registry;
        let config = &self.config;
        let spawner = self.spawner;

        let claim = registry.claim(|id, inbox| spawner(id, inbox, registry.clone(), config));

        let (id, inbox) = match claim {
            Claim::Reused(id, inbox) => {
                log::trace!("handing task to idle worker {}", id);
                (id, inbox)
            }
            Claim::Spawned(id, inbox) => {
                log::trace!("handing task to new worker {}", id);
                (id, inbox)
            }
            Claim::SpawnFailed(e) => {
                self.pending = Some(task);
                return Err(e.into());
            }
            Claim::ShuttingDown => {
                self.pending = Some(task);

                // Cancellation always follows; wait for it instead of
                // claiming again.
                let _ = self.cancel.recv();
                return Ok(());
            }
        };

        // The inbox is empty: a worker only becomes idle after taking its
        // previous task out of it.
        match inbox.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                self.pending = Some(task);
                Err(DispatchError::Handoff(id))
            }
        }
    }

    fn backoff(&self) {
        select! {
            recv(self.cancel) -> _ => {}
            default(SPAWN_RETRY_BACKOFF) => {}
        }
    }

    /// Stop every worker, busy ones first, waiting for each to exit until the
    /// shutdown deadline (if any) passes.
    fn terminate_workers(&mut self) {
        let discarded = self.pending.take().into_iter().count() + self.tasks.try_iter().count();

        if discarded > 0 {
            log::debug!("discarding {} queued tasks", discarded);
        }

        let deadline = self.registry.shutdown_deadline();

        for worker in self.registry.terminate_all() {
            if !self.registry.wait_for_exit(worker.id, deadline) {
                log::warn!(
                    "worker {} ({:?}) did not stop before the shutdown deadline, detaching it",
                    worker.id,
                    worker.was
                );
                continue;
            }

            if let Some(thread) = worker.thread {
                if thread.join().is_err() {
                    log::error!("worker {} panicked while stopping", worker.id);
                }
            }
        }
    }
}
