use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{select, Receiver};

use crate::{
    registry::{Registry, WorkerId},
    task::Task,
};

/// A type which receives notifications from a worker and decides when it
/// should stop.
///
/// The listener is dropped when the worker thread exits, for whatever reason.
pub(crate) trait Listener {
    /// How long to wait for a task before calling [`Listener::on_idle`].
    /// `None` waits forever.
    fn idle_timeout(&self) -> Option<Duration>;

    /// Called after each task, successful or not. Returns true if the worker
    /// should stop.
    fn on_task_completed(&mut self) -> bool;

    /// Called when no task arrived within the idle timeout. Returns true if
    /// the worker should stop.
    fn on_idle(&mut self) -> bool;
}

/// Thread settings shared by every worker of a pool.
#[derive(Clone, Debug, Default)]
pub(crate) struct ThreadConfig {
    pub(crate) name: Option<String>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadConfig {
    pub(crate) fn builder(&self) -> thread::Builder {
        let mut builder = thread::Builder::new();

        if let Some(name) = self.name.as_ref() {
            builder = builder.name(name.clone());
        }

        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        builder
    }
}

/// A worker thread which belongs to a thread pool and executes tasks handed
/// to it one at a time through its inbox.
pub(crate) struct Worker<L: Listener> {
    id: WorkerId,

    /// Single-slot inbox the dispatcher delivers tasks through. Disconnected
    /// when the pool wants this worker gone.
    inbox: Receiver<Task>,

    listener: L,
}

enum Wake {
    Task(Task),
    Idle,
    Closed,
}

impl<L: Listener> Worker<L> {
    pub(crate) fn new(id: WorkerId, inbox: Receiver<Task>, listener: L) -> Self {
        Self {
            id,
            inbox,
            listener,
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!("worker {} started", self.id);

        let reason = loop {
            match self.next() {
                Wake::Task(task) => {
                    if let Err(failure) = task.run() {
                        log::error!("worker {}: {}", self.id, failure);
                    }

                    if self.listener.on_task_completed() {
                        break "retired";
                    }
                }
                Wake::Idle => {
                    if self.listener.on_idle() {
                        break "idle timeout";
                    }
                }
                Wake::Closed => break "terminated",
            }
        };

        log::debug!("worker {} stopped ({})", self.id, reason);
    }

    fn next(&self) -> Wake {
        match self.listener.idle_timeout() {
            Some(timeout) => select! {
                recv(self.inbox) -> task => task.map(Wake::Task).unwrap_or(Wake::Closed),
                default(timeout) => Wake::Idle,
            },
            None => self.inbox.recv().map(Wake::Task).unwrap_or(Wake::Closed),
        }
    }
}

/// Start a worker thread that reports to the given registry.
///
/// Called with the registry lock held.
pub(crate) fn spawn(
    id: WorkerId,
    inbox: Receiver<Task>,
    registry: Arc<Registry>,
    config: &ThreadConfig,
) -> io::Result<JoinHandle<()>> {
    struct PoolListener {
        id: WorkerId,
        registry: Arc<Registry>,
    }

    impl Listener for PoolListener {
        fn idle_timeout(&self) -> Option<Duration> {
            self.registry.idle_timeout()
        }

        fn on_task_completed(&mut self) -> bool {
            self.registry.finish_task(self.id)
        }

        fn on_idle(&mut self) -> bool {
            self.registry.idle_timed_out(self.id)
        }
    }

    impl Drop for PoolListener {
        fn drop(&mut self) {
            self.registry.deregister(self.id);
        }
    }

    // The listener deregisters on drop, so it must only come into existence
    // on the new thread. If spawning fails the closure is dropped on this
    // thread, which may be holding the registry lock.
    config.builder().spawn(move || {
        let listener = PoolListener {
            id,
            registry,
        };

        Worker::new(id, inbox, listener).run()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crossbeam_channel::{bounded, Sender};

    use super::*;

    #[derive(Clone, Default)]
    struct Counts {
        completed: Arc<AtomicUsize>,
        idle: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    struct TestListener {
        counts: Counts,
        timeout: Option<Duration>,
        stop_when_idle: bool,
    }

    impl Listener for TestListener {
        fn idle_timeout(&self) -> Option<Duration> {
            self.timeout
        }

        fn on_task_completed(&mut self) -> bool {
            self.counts.completed.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn on_idle(&mut self) -> bool {
            self.counts.idle.fetch_add(1, Ordering::SeqCst);
            self.stop_when_idle
        }
    }

    impl Drop for TestListener {
        fn drop(&mut self) {
            self.counts.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start(
        timeout: Option<Duration>,
        stop_when_idle: bool,
    ) -> (Counts, Sender<Task>, JoinHandle<()>) {
        let counts = Counts::default();
        let (sender, receiver) = bounded(1);
        let worker = Worker::new(
            WorkerId::default(),
            receiver,
            TestListener {
                counts: counts.clone(),
                timeout,
                stop_when_idle,
            },
        );

        (counts, sender, thread::spawn(move || worker.run()))
    }

    #[test]
    fn runs_tasks_until_inbox_closes() {
        let (counts, inbox, handle) = start(None, false);
        let (done_tx, done_rx) = bounded(3);

        for i in 0..3 {
            let done_tx = done_tx.clone();
            inbox.send(Task::new(move || done_tx.send(i).unwrap())).unwrap();
        }

        drop(inbox);
        handle.join().unwrap();

        assert_eq!(done_rx.try_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(counts.completed.load(Ordering::SeqCst), 3);
        assert_eq!(counts.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_tasks_do_not_stop_worker() {
        let (counts, inbox, handle) = start(None, false);

        inbox.send(Task::new::<_, ()>(|| panic!("oh no!"))).unwrap();
        inbox.send(Task::new(|| Err::<(), _>("bad input"))).unwrap();
        inbox.send(Task::new(|| ())).unwrap();

        drop(inbox);
        handle.join().unwrap();

        assert_eq!(counts.completed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stops_after_idle_timeout() {
        let (counts, _inbox, handle) = start(Some(Duration::from_millis(20)), true);

        handle.join().unwrap();

        assert_eq!(counts.idle.load(Ordering::SeqCst), 1);
        assert_eq!(counts.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keeps_waiting_when_listener_declines_to_stop() {
        let (counts, inbox, handle) = start(Some(Duration::from_millis(10)), false);

        thread::sleep(Duration::from_millis(100));
        assert!(counts.idle.load(Ordering::SeqCst) >= 2);
        assert_eq!(counts.dropped.load(Ordering::SeqCst), 0);

        drop(inbox);
        handle.join().unwrap();
    }
}
