// src/exec/mod.rs

//! External job execution layer.
//!
//! This module is responsible for actually running the commands behind
//! services, using `tokio::process::Command`, and exposing their progress
//! through synchronous [`JobHandle`]s that suspend conditions can poll.
//!
//! - [`job`] defines the handle trait and job file layout.
//! - [`process`] supervises one child process.
//! - [`local`] and [`cluster`] are the two backends.
//! - [`throttle`] bounds concurrently running jobs per job type.
//! - [`error_checker`] scans job output for error lines.
//! - [`processor`] is the command-running service processor built on the
//!   pieces above.

pub mod cluster;
pub mod error_checker;
pub mod job;
pub mod local;
pub mod process;
pub mod processor;
pub mod throttle;

pub use cluster::ClusterJob;
pub use error_checker::DefaultErrorChecker;
pub use job::{JobHandle, JobInstanceInfo, JobSpec, JobStatus};
pub use local::LocalProcessJob;
pub use processor::{CMD_ARG, ExeOptions, ExeServiceProcessor, JobCompletion};
pub use throttle::{JobThrottle, ThrottleOptions, ThrottleStatus, ThrottledJob};
