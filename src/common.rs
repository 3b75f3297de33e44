use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::{Builder, Error, ThreadPool};

struct Common {
    pool: Option<ThreadPool>,
    builder: Option<Builder>,
}

static COMMON: Lazy<Mutex<Common>> = Lazy::new(|| {
    Mutex::new(Common {
        pool: None,
        builder: None,
    })
});

fn lock() -> MutexGuard<'static, Common> {
    COMMON.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Get a handle to the common thread pool for the entire process, creating
/// it if it is not running. A common pool that was shut down through one of
/// its handles is replaced by a fresh one.
///
/// # Examples
///
/// ```
/// use std::sync::mpsc;
///
/// let (tx, rx) = mpsc::channel();
/// dynpool::common().submit(move || tx.send(2 + 2).unwrap());
///
/// assert_eq!(rx.recv().unwrap(), 4);
/// ```
pub fn common() -> ThreadPool {
    let mut common = lock();

    // A handle may have been shut down directly rather than through
    // `shutdown_common`.
    if let Some(pool) = common.pool.as_ref().filter(|pool| !pool.is_shut_down()) {
        return pool.clone();
    }

    let builder = common.builder.clone().unwrap_or_else(common_builder);
    let pool = builder.build();
    common.pool = Some(pool.clone());

    pool
}

/// Configure the common thread pool.
///
/// This should be done near the start of your program before any other code
/// uses the common pool, as this function will return an error if the common
/// pool is already running. The configuration is kept for every common pool
/// created after a [`shutdown_common`].
///
/// Only programs should use this function! Libraries should not use this
/// function and instead allow the running program to configure the common pool.
/// If you need a customized pool in a library then you should use a separate
/// pool instance.
///
/// # Examples
///
/// ```
/// dynpool::configure_common(|builder| builder.size(2..3)).unwrap();
///
/// assert_eq!(dynpool::common().max_pool_size(), 3);
/// ```
pub fn configure_common<F>(f: F) -> Result<(), Error>
where
    F: FnOnce(Builder) -> Builder,
{
    let mut common = lock();

    if common.pool.as_ref().map_or(false, |pool| !pool.is_shut_down()) {
        return Err(Error::CommonAlreadyInitialized);
    }

    let builder = f(common_builder());
    common.pool = Some(builder.clone().try_build()?);
    common.builder = Some(builder);

    Ok(())
}

/// Shut down the common thread pool, blocking until its threads have stopped.
///
/// The next call to [`common`] starts a new pool from scratch. Does nothing
/// if the common pool is not running.
pub fn shutdown_common() {
    // Release the lock first: tasks still running may call `common()`.
    let pool = lock().pool.take();

    if let Some(pool) = pool {
        pool.shutdown();
    }
}

fn common_builder() -> Builder {
    Builder::default().name("common-pool")
}
