//! batchcore - Phase-Scoped Batch Execution Core
//!
//! Runs the jobs of a batch phase concurrently on bounded worker pools, one
//! pool per resource, and waits for every job before reporting the phase.
//! Commands run as local processes or on a remote host over SSH.
//!
//! # Architecture
//!
//! - [`config`]: profile loading, `parallel.*` pool sizes and `ssh.*` credentials
//! - [`scheduler`]: jobs, worker pools, dispatch and per-phase scheduling
//! - [`execution`]: local and SSH command executors, shell quoting
//! - [`liveness`]: keep-alive ticker for long silent operations
//! - [`monitoring`]: per-phase job timeline
//! - [`workflow`]: YAML batch plans and the flow runner
//! - [`error`]: error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batchcore::config::{ParallelConfig, Profile};
//! use batchcore::execution::ProcessCommandExecutor;
//! use batchcore::scheduler::JobScheduler;
//! use batchcore::workflow::{load_plan, ExecutorSet, FlowRunner};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = Profile::load("profile.yaml")?;
//!     let mut scheduler = JobScheduler::new();
//!     scheduler.configure(&ParallelConfig::from_profile(&profile)?)?;
//!
//!     let executors = ExecutorSet::new(Arc::new(ProcessCommandExecutor::new()));
//!     let runner = FlowRunner::new(scheduler, executors);
//!     let summary = runner.run(&load_plan("batch.yaml")?)?;
//!     println!("{}", summary.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod liveness;
pub mod monitoring;
pub mod scheduler;
pub mod workflow;

// Re-export commonly used types
pub use error::{ConfigError, ExecutionError, LivenessError, PhaseError, PlanError};
pub use execution::{CommandExecutor, ProcessCommandExecutor, SshCommandExecutor};
pub use liveness::{LivenessCounter, LivenessKeeper};
pub use scheduler::{CommandJob, ExecutionContext, ExecutionMonitor, ExecutionPhase, Job, JobScheduler};
pub use workflow::{load_plan, FlowRunner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "batchcore";
