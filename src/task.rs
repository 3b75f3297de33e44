use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

/// The return type of a closure that can be submitted to a thread pool.
///
/// A task "fails" when its closure panics, or when it returns a value that
/// reports a failure through this trait. Failures are logged by the worker
/// that ran the task and are otherwise absorbed; they never reach the caller
/// or take down the worker.
///
/// Implemented for `()`, which never fails, and for `Result<T, E>` where the
/// error can be displayed.
pub trait TaskOutput {
    /// Describe the failure carried by this value, if any.
    fn into_failure(self) -> Option<String>;
}

impl TaskOutput for () {
    fn into_failure(self) -> Option<String> {
        None
    }
}

impl<T, E: fmt::Display> TaskOutput for Result<T, E> {
    fn into_failure(self) -> Option<String> {
        self.err().map(|e| e.to_string())
    }
}

/// Why a task did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    /// The closure panicked. Contains the panic message when one could be
    /// recovered from the payload.
    Panicked(String),

    /// The closure returned an error value.
    Errored(String),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Panicked(message) => write!(f, "task panicked: {}", message),
            Failure::Errored(message) => write!(f, "task failed: {}", message),
        }
    }
}

/// A type-erased unit of work waiting in the queue or in a worker's inbox.
pub(crate) struct Task {
    closure: Box<dyn FnOnce() -> Option<String> + Send>,
}

impl Task {
    pub(crate) fn new<F, R>(closure: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: TaskOutput,
    {
        Self {
            closure: Box::new(move || closure().into_failure()),
        }
    }

    /// Run the task to completion on the current thread, capturing any panic.
    pub(crate) fn run(self) -> Result<(), Failure> {
        match catch_unwind(AssertUnwindSafe(self.closure)) {
            Ok(None) => Ok(()),
            Ok(Some(message)) => Err(Failure::Errored(message)),
            Err(payload) => Err(Failure::Panicked(panic_message(&*payload))),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task(..)")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}
