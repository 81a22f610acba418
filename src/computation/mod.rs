// src/computation/mod.rs

//! Cooperative staged computations.
//!
//! A [`Computation`] is a handle on a task that the [`ComputationScheduler`]
//! attempts repeatedly until it completes. Long waits are expressed with
//! [`Computation::suspend_until`] and cost no thread while suspended.

pub mod computation;
pub mod cond;
pub mod scheduler;
pub mod task;

pub use computation::{Computation, SuspendOptions, budget_exceeded};
pub use cond::{CondResult, Negate, SuspendCondition};
pub use scheduler::{ComputationScheduler, SchedulerOptions};
pub use task::{ComputationTask, Schedulable, Step};
