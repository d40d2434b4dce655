//! Job Scheduling Module
//!
//! Dispatches the jobs of a phase to bounded, resource-scoped worker pools
//! and collects their outcomes through a shared completion queue.
//!
//! # Architecture
//!
//! - [`job`]: [`Job`] trait, [`CommandJob`], execution context and monitor
//! - [`pool`]: fixed-size worker pools keyed by resource name
//! - [`executor`]: [`JobExecutor`] dispatch and [`Executing`] handles
//! - [`phase`]: [`JobScheduler`] wait-for-all phase execution

pub mod executor;
pub mod job;
pub mod phase;
pub mod pool;

pub use executor::{DoneQueue, Executing, JobExecutor, JobResult};
pub use job::{CommandJob, ExecutionContext, ExecutionMonitor, ExecutionPhase, Job};
pub use phase::{JobScheduler, PhaseFailure, PhaseReport};
pub use pool::{ResourcePools, WorkerPool};
