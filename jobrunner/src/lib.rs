#![doc = include_str!("../README.md")]
use serde::{Deserialize, Serialize};
use std::{any::Any, fmt::Display, time::Duration};
use typed_builder::TypedBuilder;

pub use anyhow;
pub use async_trait::async_trait;
pub use jobrunner_derive::job_handlers;
pub use tracing;

pub mod commands;
pub mod connection;
pub mod core;
mod encoder;
pub mod engine;
pub mod executor;
pub mod hooks;
pub mod listener;
mod metrics;
pub mod models;
pub mod runner;

pub use crate::core::{HandlerRegistry, JobHandler, JobParameter};
pub use executor::PausableExecutor;
pub use listener::{JobCompleteListener, JobCompleteManager};
pub use models::{Job, JobList, JobResult, RunnerSnapshot, Stage};
pub use runner::{JobRunner, RunnerState};

pub type UtcDateTime = chrono::DateTime<chrono::Utc>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn generate_id() -> String {
    rusty_ulid::generate_ulid_string()
}

/// Settings of a [`JobRunner`].
#[derive(TypedBuilder, Clone, Debug)]
pub struct Config {
    /// Used as prefix in log lines of the runner and its workers.
    #[builder(default = String::from("jobrunner"), setter(into))]
    pub name: String,

    /// Requested number of workers, anything below 1 means `max_threads`.
    #[builder(default = -1)]
    pub num_threads: i32,

    /// Upper bound for the number of workers.
    /// The available processors clamp this further.
    #[builder(default = executor::available_processors())]
    pub max_threads: usize,

    /// How long `stop()` waits between checks whether the workers have ended.
    #[builder(default = Duration::from_millis(100))]
    pub termination_poll_interval: Duration,

    /// Drop the payload of a job once its result has been reported, so
    /// completed jobs only keep their result.
    #[builder(default = true)]
    pub clear_payloads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Prometheus text export of all job and command counters.
pub fn get_metrics() -> anyhow::Result<String> {
    metrics::COUNTER.output()
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
