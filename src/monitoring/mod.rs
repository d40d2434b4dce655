//! Monitoring Module
//!
//! Records when each job of a phase started and finished, for reports
//! and Gantt-style summaries.
//!
//! - [`ExecutionTimeline`]: job start/end timing

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, JobSpan, TimelineEvent};
