//! Batch Workflow Module
//!
//! Describes batches as YAML plans and runs them phase by phase.
//!
//! # Structure
//!
//! - [`plan`]: plan data model, loading and validation
//! - [`runner`]: phase ordering and run summaries

pub mod plan;
pub mod runner;

pub use plan::{load_plan, BatchPlan, ExecutorSet, FlowPlan, JobSpec};
pub use runner::{FlowRunner, FlowSummary, PhaseSummary, RunStatus, RunSummary};
