//! Implementation of the thread pool itself.

use std::{
    fmt,
    ops::{Range, RangeInclusive, RangeTo, RangeToInclusive},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, unbounded, Sender};
use once_cell::sync::Lazy;

use crate::{
    dispatcher::Dispatcher,
    error::Error,
    registry::Registry,
    task::{Task, TaskOutput},
    worker::{self, ThreadConfig},
};

/// The largest maximum size any pool can be configured with. Larger values
/// are clamped to this.
pub const HARD_CAP: usize = 200;

/// Maximum pool size used when none is configured.
pub const DEFAULT_MAX_SIZE: usize = 50;

/// How long an idle worker waits for a task before terminating, unless
/// configured otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Bounds on the number of worker threads, as accepted by [`Builder::size`].
///
/// Wrap a constraint in [`PerCore`] to scale it by the number of CPU cores.
pub trait SizeConstraint {
    /// Workers started eagerly and never evicted for being idle.
    fn min(&self) -> usize;

    /// The most workers that may be alive at once.
    fn max(&self) -> usize;
}

impl SizeConstraint for usize {
    fn min(&self) -> usize {
        *self
    }

    fn max(&self) -> usize {
        *self
    }
}

// The upper end of a range is used as the maximum whether or not the range
// includes it, so `2..4` and `2..=4` both allow four workers.
macro_rules! range_constraint {
    ($ty:ty, |$r:ident| $min:expr, $max:expr) => {
        #[allow(unused_variables)]
        impl SizeConstraint for $ty {
            fn min(&self) -> usize {
                let $r = self;
                $min
            }

            fn max(&self) -> usize {
                let $r = self;
                $max
            }
        }
    };
}

range_constraint!(Range<usize>, |r| r.start, r.end);
range_constraint!(RangeInclusive<usize>, |r| *r.start(), *r.end());
range_constraint!(RangeTo<usize>, |r| 0, r.end);
range_constraint!(RangeToInclusive<usize>, |r| 0, r.end);

/// Scales a size constraint by the number of CPU cores available.
///
/// Results saturate rather than overflow, and the builder clamps them to
/// [`HARD_CAP`] anyway.
///
/// # Examples
///
/// ```
/// use dynpool::{PerCore, ThreadPool};
///
/// // Up to two workers per core, none kept when idle.
/// let pool = ThreadPool::builder().size(PerCore(..2)).build();
/// assert_eq!(pool.min_pool_size(), 0);
/// # pool.shutdown();
/// ```
#[derive(Clone, Copy, Debug)]
pub struct PerCore<T>(pub T);

static CORE_COUNT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

impl<T> From<T> for PerCore<T> {
    fn from(size: T) -> Self {
        Self(size)
    }
}

impl<T: SizeConstraint> SizeConstraint for PerCore<T> {
    fn min(&self) -> usize {
        self.0.min().saturating_mul(*CORE_COUNT)
    }

    fn max(&self) -> usize {
        self.0.max().saturating_mul(*CORE_COUNT)
    }
}

/// A builder for constructing a customized [`ThreadPool`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// let custom_pool = dynpool::ThreadPool::builder()
///     .name("my-pool")
///     .max_size(8)
///     .idle_timeout(Duration::from_secs(30))
///     .build();
/// # custom_pool.shutdown();
/// ```
#[derive(Clone, Debug)]
pub struct Builder {
    name: Option<String>,
    size: (usize, usize),
    stack_size: Option<usize>,
    idle_timeout: Option<Duration>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            name: None,
            size: (0, DEFAULT_MAX_SIZE),
            stack_size: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl Builder {
    /// Set a custom thread name for threads spawned by this thread pool.
    ///
    /// Workers are given exactly this name; the pool's dispatcher thread is
    /// named `<name>-dispatcher`.
    ///
    /// # Panics
    ///
    /// Panics if the name contains null bytes (`\0`).
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = dynpool::ThreadPool::builder().name("my-pool").build();
    /// # pool.shutdown();
    /// ```
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        let name = name.into();

        if name.as_bytes().contains(&0) {
            panic!("thread pool name must not contain null bytes");
        }

        self.name = Some(name);
        self
    }

    /// Set the number of threads to be managed by this thread pool.
    ///
    /// If a `usize` is supplied, the pool will have a fixed number of threads
    /// which are started eagerly and never evicted for being idle. If a range
    /// is supplied, the lower bound is the number of threads kept alive even
    /// when idle, while the upper bound is the maximum size the pool grows to
    /// when every thread is busy.
    ///
    /// Both bounds are clamped to [`HARD_CAP`]. A maximum of zero is allowed,
    /// but no task will run until the maximum is raised with
    /// [`ThreadPool::set_max_pool_size`].
    ///
    /// # Examples
    ///
    /// ```
    /// // Create a thread pool with no idle threads, but will spawn up to 4
    /// // threads lazily when there's work to be done.
    /// let pool = dynpool::ThreadPool::builder().size(0..4).build();
    ///
    /// // Or equivalently:
    /// let pool = dynpool::ThreadPool::builder().size(..4).build();
    /// # pool.shutdown();
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if an invalid range is supplied with a lower bound larger than
    /// the upper bound.
    pub fn size<S: SizeConstraint>(mut self, size: S) -> Self {
        let (min, max) = (size.min(), size.max());

        if min > max {
            panic!("thread pool minimum size cannot be larger than maximum size");
        }

        self.size = (min.min(HARD_CAP), max.min(HARD_CAP));
        self
    }

    /// Set the maximum number of threads, keeping no threads alive when idle.
    ///
    /// Shorthand for `size(..=max)`.
    pub fn max_size(self, max: usize) -> Self {
        self.size(..=max)
    }

    /// Set the size of the stack (in bytes) for worker threads in this pool.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// enforces a larger minimum stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set how long a worker waits for a new task before terminating.
    ///
    /// Workers below the minimum pool size are never terminated for being
    /// idle. Defaults to [`DEFAULT_IDLE_TIMEOUT`].
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep idle workers alive indefinitely.
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Create a thread pool according to the configuration set with this
    /// builder.
    ///
    /// # Panics
    ///
    /// Panics if the operating system fails to create a thread, like
    /// [`std::thread::spawn`]. Use [`Builder::try_build`] to handle this.
    pub fn build(self) -> ThreadPool {
        match self.try_build() {
            Ok(pool) => pool,
            Err(e) => panic!("failed to create thread pool: {}", e),
        }
    }

    /// Create a thread pool according to the configuration set with this
    /// builder, returning an error if a thread could not be created.
    pub fn try_build(self) -> Result<ThreadPool, Error> {
        let (min, max) = self.size;
        let registry = Arc::new(Registry::new(min, max, self.idle_timeout));

        let dispatcher_name = match self.name.as_ref() {
            Some(name) => format!("{}-dispatcher", name),
            None => String::from("dynpool-dispatcher"),
        };

        let config = ThreadConfig {
            name: self.name,
            stack_size: self.stack_size,
        };

        let (queue, tasks) = unbounded();
        let (cancel, cancelled) = bounded(0);

        let started = (0..min)
            .try_for_each(|_| {
                registry.prestart(|id, inbox| worker::spawn(id, inbox, registry.clone(), &config))
            })
            .and_then(|_| {
                let dispatcher = Dispatcher::new(tasks, cancelled, registry.clone(), config.clone());

                thread::Builder::new()
                    .name(dispatcher_name)
                    .spawn(move || dispatcher.run())
            });

        let dispatcher = match started {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                // Stop whatever workers did start, they would otherwise wait
                // for tasks that can never arrive.
                registry.begin_shutdown(None);
                registry.terminate_all();

                return Err(e.into());
            }
        };

        Ok(ThreadPool {
            inner: Arc::new(Inner {
                queue,
                registry,
                closed: AtomicBool::new(false),
                cancel: Mutex::new(Some(cancel)),
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }
}

/// A thread pool that grows on demand up to a maximum size and shrinks again
/// as workers go idle.
///
/// Submitted tasks are placed on a queue and handed to workers in submission
/// order by a dedicated dispatcher thread. If a worker is idle it is reused;
/// otherwise a new worker is started, as long as the pool is smaller than its
/// maximum size. Workers that receive no task within the idle timeout
/// terminate themselves.
///
/// `ThreadPool` is a cheap handle: clones refer to the same pool. Dropping the
/// last handle stops the pool without waiting for running tasks; use
/// [`shutdown`](ThreadPool::shutdown) to wait.
///
/// # Saturation
///
/// When every worker is busy and the pool is at its maximum size, dispatch
/// stalls until a worker frees up. Tasks are never rejected, and the queue is
/// unbounded: submitting faster than the pool can run tasks grows memory
/// usage without limit. [`queued_tasks`](ThreadPool::queued_tasks) reports
/// the current backlog.
///
/// # Failures
///
/// A task that panics, or returns an `Err`, is logged and otherwise ignored.
/// The worker that ran it carries on with the next task.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Sender<Task>,
    registry: Arc<Registry>,
    closed: AtomicBool,

    /// Dropped to tell the dispatcher to stop.
    cancel: Mutex<Option<Sender<()>>>,

    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn request_shutdown(&self, deadline: Option<Instant>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("thread pool shutting down");
        }

        self.registry.begin_shutdown(deadline);
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.request_shutdown(None);
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Create a new thread pool with the default configuration.
    ///
    /// If you'd like to customize the thread pool's behavior then use
    /// [`ThreadPool::builder`].
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Get a builder for creating a customized thread pool.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Create a pool with a fixed number of threads that never time out.
    ///
    /// # Examples
    ///
    /// ```
    /// let pool = dynpool::ThreadPool::fixed(2);
    /// assert_eq!(pool.current_pool_size(), 2);
    /// # pool.shutdown();
    /// ```
    pub fn fixed(size: usize) -> Self {
        Self::builder().size(size).no_idle_timeout().build()
    }

    /// Submit a closure to be executed by the thread pool.
    ///
    /// The closure may return `()` or a `Result`; an `Err` is logged as a
    /// failed task. There is no way to wait for an individual task.
    ///
    /// If the pool has been shut down the task is dropped and a warning is
    /// logged. Use [`try_submit`](ThreadPool::try_submit) to detect this.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::mpsc;
    ///
    /// let pool = dynpool::ThreadPool::new();
    /// let (tx, rx) = mpsc::channel();
    ///
    /// pool.submit(move || tx.send(2 + 2).unwrap());
    ///
    /// assert_eq!(rx.recv().unwrap(), 4);
    /// # pool.shutdown();
    /// ```
    pub fn submit<F, R>(&self, closure: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        if let Err(e) = self.try_submit(closure) {
            log::warn!("dropping submitted task: {}", e);
        }
    }

    /// Submit a closure to be executed by the thread pool, returning
    /// [`Error::ShutDown`] if the pool no longer accepts tasks.
    pub fn try_submit<F, R>(&self, closure: F) -> Result<(), Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        self.inner
            .queue
            .send(Task::new(closure))
            .map_err(|_| Error::ShutDown)
    }

    /// Get the number of worker threads currently in the pool.
    pub fn current_pool_size(&self) -> usize {
        self.inner.registry.size()
    }

    /// Get the maximum number of worker threads.
    pub fn max_pool_size(&self) -> usize {
        self.inner.registry.max_size()
    }

    /// Get the number of worker threads kept alive even when idle.
    pub fn min_pool_size(&self) -> usize {
        self.inner.registry.min_size()
    }

    /// Change the maximum number of worker threads. Values above
    /// [`HARD_CAP`] are clamped.
    ///
    /// Lowering the maximum stops idle workers in excess of it right away,
    /// and busy ones as they finish their current task. Raising it lets a
    /// stalled dispatcher start new workers immediately.
    pub fn set_max_pool_size(&self, size: usize) {
        self.inner.registry.set_max_size(size.min(HARD_CAP));
    }

    /// Get the number of workers waiting for a task.
    pub fn idle_workers(&self) -> usize {
        self.inner.registry.idle_count()
    }

    /// Get the number of workers running a task or about to receive one.
    pub fn busy_workers(&self) -> usize {
        self.inner.registry.busy_count()
    }

    /// Get the number of tasks submitted but not yet handed to a worker.
    ///
    /// Note that the number returned may become immediately outdated after
    /// invocation.
    #[inline]
    pub fn queued_tasks(&self) -> usize {
        self.inner.queue.len()
    }

    /// Get how long idle workers wait for a task before terminating. `None`
    /// means they wait forever.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.registry.idle_timeout()
    }

    /// Change the idle timeout. Workers pick up the new value the next time
    /// they start waiting for a task.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.registry.set_idle_timeout(timeout);
    }

    /// Returns true once the pool has begun shutting down.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut down this thread pool and block until all running tasks have
    /// completed and every thread has stopped.
    ///
    /// Tasks still waiting in the queue are discarded. Calling this again,
    /// from any handle, returns once the pool is fully stopped.
    ///
    /// Calling this from inside a task running on the same pool will
    /// deadlock, since the pool waits for that task to finish.
    pub fn shutdown(&self) {
        self.shutdown_internal(None);
    }

    /// Shut down this thread pool and block until all running tasks have
    /// completed and threads have stopped, or until the given timeout passes.
    ///
    /// Returns `true` if the thread pool shut down fully before the timeout.
    /// Workers still running a task past the timeout are left to finish it
    /// on their own.
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.shutdown_deadline(Instant::now() + timeout)
    }

    /// Shut down this thread pool and block until all running tasks have
    /// completed and threads have stopped, or the given deadline passes.
    ///
    /// Returns `true` if the thread pool shut down fully before the deadline.
    pub fn shutdown_deadline(&self, deadline: Instant) -> bool {
        self.shutdown_internal(Some(deadline))
    }

    fn shutdown_internal(&self, deadline: Option<Instant>) -> bool {
        self.inner.request_shutdown(deadline);

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(dispatcher) = dispatcher {
            if dispatcher.join().is_err() {
                log::error!("dispatcher thread panicked");
            }
        }

        self.inner.registry.wait_until_empty(deadline)
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("current_pool_size", &self.current_pool_size())
            .field("max_pool_size", &self.max_pool_size())
            .field("idle_workers", &self.idle_workers())
            .field("busy_workers", &self.busy_workers())
            .field("queued_tasks", &self.queued_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let builder = Builder::default();

        assert_eq!(builder.size, (0, DEFAULT_MAX_SIZE));
        assert_eq!(builder.idle_timeout, Some(DEFAULT_IDLE_TIMEOUT));
    }

    #[test]
    fn size_is_clamped_to_hard_cap() {
        assert_eq!(Builder::default().size(1000).size, (HARD_CAP, HARD_CAP));
        assert_eq!(Builder::default().size(5..=1000).size, (5, HARD_CAP));
        assert_eq!(Builder::default().max_size(0).size, (0, 0));
    }

    #[test]
    fn per_core_scales_with_cores() {
        let size = PerCore(1..3);

        assert_eq!(size.min(), *CORE_COUNT);
        assert_eq!(size.max(), *CORE_COUNT * 3);
    }

    #[test]
    fn per_core_saturates() {
        let size = PerCore(usize::MAX);

        assert_eq!(size.min(), usize::MAX);
        assert_eq!(size.max(), usize::MAX);
        assert_eq!(Builder::default().size(size).size, (HARD_CAP, HARD_CAP));
    }

    #[test]
    fn range_constraints() {
        // Ranges are iterators too, so name the trait to avoid Iterator::min.
        assert_eq!(SizeConstraint::min(&(2..5)), 2);
        assert_eq!(SizeConstraint::max(&(2..5)), 5);
        assert_eq!(SizeConstraint::min(&(2..=5)), 2);
        assert_eq!(SizeConstraint::max(&(2..=5)), 5);
        assert_eq!(SizeConstraint::min(&(..=5)), 0);
        assert_eq!(SizeConstraint::max(&(..5)), 5);
    }
}
