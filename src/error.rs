use std::io;

use thiserror::Error;

/// Errors reported by a thread pool.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool has been shut down and no longer accepts tasks.
    #[error("thread pool has been shut down")]
    ShutDown,

    /// Attempted to configure the common thread pool while one is running.
    #[error("common thread pool already initialized")]
    CommonAlreadyInitialized,

    /// The operating system refused to create a thread for the pool.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

impl Error {
    /// Returns true if this error was caused by submitting to a pool that has
    /// been shut down.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Error::ShutDown)
    }
}
