#![doc = include_str!("../README.md")]

mod common;
mod dispatcher;
mod error;
mod pool;
mod registry;
mod task;
mod worker;

pub use crate::{
    common::{common, configure_common, shutdown_common},
    error::Error,
    pool::{
        Builder,
        PerCore,
        SizeConstraint,
        ThreadPool,
        DEFAULT_IDLE_TIMEOUT,
        DEFAULT_MAX_SIZE,
        HARD_CAP,
    },
    task::TaskOutput,
};
