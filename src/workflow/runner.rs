//! Flow Runner
//!
//! Runs the flows of a [`BatchPlan`] one after another, each flow's phases in
//! execution order through a [`JobScheduler`].
//!
//! Phase rules:
//!
//! - once a phase fails, later phases are skipped, except `finalize`
//! - `cleanup` runs only if every earlier phase succeeded
//! - the first failing phase decides the flow result
//! - the batch stops at the first failed flow
//!
//! After cancellation every remaining phase is skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::error::PlanError;
use crate::execution::shell;
use crate::monitoring::{ExecutionTimeline, JobSpan};
use crate::scheduler::{ExecutionContext, ExecutionMonitor, ExecutionPhase, Job, JobScheduler};

use super::plan::{BatchPlan, ExecutorSet, FlowPlan};

const TARGET: &str = "batchcore::runner";

/// Outcome of a phase, flow or batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Dry run: listed, not executed.
    Planned,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Planned => "planned",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: ExecutionPhase,
    pub status: RunStatus,
    pub jobs: usize,
    pub fallbacks: usize,
    pub elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<JobSpan>,
    /// Rendered command lines, filled in dry runs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(skip)]
    pub timeline: Option<ExecutionTimeline>,
}

impl PhaseSummary {
    fn new(phase: ExecutionPhase, status: RunStatus, jobs: usize) -> Self {
        Self {
            phase,
            status,
            jobs,
            fallbacks: 0,
            elapsed_ms: 0,
            failed_job: None,
            error: None,
            spans: Vec::new(),
            commands: Vec::new(),
            timeline: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub flow_id: String,
    pub status: RunStatus,
    /// Message of the first failing phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub phases: Vec<PhaseSummary>,
}

/// Result of a whole batch, serializable as a JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batch_id: String,
    pub execution_id: String,
    pub dry_run: bool,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub flows: Vec<FlowSummary>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded | RunStatus::Planned)
    }

    /// First failure message in the batch, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.flows.iter().find_map(|flow| flow.error.as_deref())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Runs batch plans on a configured scheduler.
pub struct FlowRunner {
    scheduler: JobScheduler,
    executors: ExecutorSet,
    monitor: Arc<ExecutionMonitor>,
    execution_id: String,
    dry_run: bool,
}

impl FlowRunner {
    /// Creates a runner; the execution id defaults to the current UTC time.
    pub fn new(scheduler: JobScheduler, executors: ExecutorSet) -> Self {
        Self {
            scheduler,
            executors,
            monitor: Arc::new(ExecutionMonitor::new()),
            execution_id: Utc::now().format("%Y%m%dT%H%M%S").to_string(),
            dry_run: false,
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<ExecutionMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Shared with the scheduler; cancel it to stop the batch.
    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    /// Runs every flow of `plan`.
    ///
    /// Jobs of all flows are built before anything runs, so a plan that
    /// names an unavailable executor fails without side effects. Job
    /// failures are reported in the summary, not as `Err`.
    pub fn run(&self, plan: &BatchPlan) -> Result<RunSummary, PlanError> {
        plan.validate()?;
        let built = plan
            .flows
            .iter()
            .map(|flow| flow.build(&self.executors))
            .collect::<Result<Vec<_>, _>>()?;

        let started_at = Utc::now();
        info!(
            target: TARGET,
            "Running batch '{}' (execution {}) with {} flow(s){}",
            plan.batch_id,
            self.execution_id,
            plan.flows.len(),
            if self.dry_run { " [dry run]" } else { "" }
        );

        let mut flows = Vec::with_capacity(plan.flows.len());
        let mut status = if self.dry_run {
            RunStatus::Planned
        } else {
            RunStatus::Succeeded
        };

        for (flow, jobs) in plan.flows.iter().zip(built) {
            if status == RunStatus::Failed {
                flows.push(skipped_flow(flow));
                continue;
            }

            let context = ExecutionContext::new(
                plan.batch_id.clone(),
                flow.flow_id.clone(),
                self.execution_id.clone(),
                ExecutionPhase::Setup,
            );
            let summary = if self.dry_run {
                self.plan_flow(&context, jobs)
            } else {
                self.run_flow(&context, jobs)
            };

            if summary.status == RunStatus::Failed {
                status = RunStatus::Failed;
            }
            flows.push(summary);
        }

        Ok(RunSummary {
            batch_id: plan.batch_id.clone(),
            execution_id: self.execution_id.clone(),
            dry_run: self.dry_run,
            status,
            started_at,
            finished_at: Utc::now(),
            flows,
        })
    }

    fn run_flow(
        &self,
        context: &ExecutionContext,
        jobs: BTreeMap<ExecutionPhase, Vec<Arc<dyn Job>>>,
    ) -> FlowSummary {
        info!(target: TARGET, "Starting flow '{}'", context.flow_id);
        let start = Instant::now();
        let mut phases = Vec::with_capacity(jobs.len());
        let mut error: Option<String> = None;

        for (phase, phase_jobs) in jobs {
            let count = phase_jobs.len();
            let cancelled = self.monitor.is_cancelled();
            let runnable = !cancelled
                && match phase {
                    ExecutionPhase::Finalize => true,
                    _ => error.is_none(),
                };

            if !runnable {
                info!(target: TARGET, "Skipping phase {} of flow '{}'", phase, context.flow_id);
                phases.push(PhaseSummary::new(phase, RunStatus::Skipped, count));
                if cancelled && error.is_none() {
                    error = Some("cancelled".to_string());
                }
                continue;
            }

            let phase_context = context.with_phase(phase);
            let summary = match self.scheduler.execute(&self.monitor, &phase_context, phase_jobs) {
                Ok(report) => PhaseSummary {
                    fallbacks: report.fallbacks,
                    elapsed_ms: report.elapsed.as_millis(),
                    spans: report.timeline.spans(),
                    timeline: Some(report.timeline),
                    ..PhaseSummary::new(phase, RunStatus::Succeeded, report.jobs)
                },
                Err(failure) => {
                    let message = failure.error.to_string();
                    if error.is_none() {
                        error = Some(message.clone());
                    }
                    PhaseSummary {
                        fallbacks: failure.report.fallbacks,
                        elapsed_ms: failure.report.elapsed.as_millis(),
                        failed_job: failure.error.job_label().map(str::to_string),
                        error: Some(message),
                        spans: failure.report.timeline.spans(),
                        timeline: Some(failure.report.timeline),
                        ..PhaseSummary::new(phase, RunStatus::Failed, failure.report.jobs)
                    }
                }
            };
            phases.push(summary);
        }

        let status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        match &error {
            Some(message) => warn!(
                target: TARGET,
                "Flow '{}' failed after {:.2?}: {}",
                context.flow_id,
                start.elapsed(),
                message
            ),
            None => info!(
                target: TARGET,
                "Flow '{}' completed in {:.2?}",
                context.flow_id,
                start.elapsed()
            ),
        }

        FlowSummary {
            flow_id: context.flow_id.clone(),
            status,
            error,
            phases,
        }
    }

    fn plan_flow(
        &self,
        context: &ExecutionContext,
        jobs: BTreeMap<ExecutionPhase, Vec<Arc<dyn Job>>>,
    ) -> FlowSummary {
        let phases = jobs
            .into_iter()
            .map(|(phase, phase_jobs)| {
                let phase_context = context.with_phase(phase);
                let commands = phase_jobs
                    .iter()
                    .map(|job| {
                        format!(
                            "[{}] {}: {}",
                            job.resource_id(&phase_context),
                            job.label(),
                            shell::build_command_line(
                                &job.command_line(&phase_context),
                                &job.environment(&phase_context)
                            )
                        )
                    })
                    .collect();
                PhaseSummary {
                    commands,
                    ..PhaseSummary::new(phase, RunStatus::Planned, phase_jobs.len())
                }
            })
            .collect();

        FlowSummary {
            flow_id: context.flow_id.clone(),
            status: RunStatus::Planned,
            error: None,
            phases,
        }
    }
}

impl std::fmt::Debug for FlowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRunner")
            .field("execution_id", &self.execution_id)
            .field("dry_run", &self.dry_run)
            .field("executors", &self.executors)
            .finish()
    }
}

fn skipped_flow(flow: &FlowPlan) -> FlowSummary {
    FlowSummary {
        flow_id: flow.flow_id.clone(),
        status: RunStatus::Skipped,
        error: None,
        phases: flow
            .phases
            .iter()
            .map(|(phase, jobs)| PhaseSummary::new(*phase, RunStatus::Skipped, jobs.len()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParallelConfig;
    use crate::execution::ProcessCommandExecutor;
    use crate::workflow::plan::JobSpec;

    fn runner() -> FlowRunner {
        let mut limits = BTreeMap::new();
        limits.insert("default".to_string(), 2);
        let mut scheduler = JobScheduler::new();
        scheduler.configure(&ParallelConfig::new(limits).unwrap()).unwrap();
        FlowRunner::new(scheduler, ExecutorSet::new(Arc::new(ProcessCommandExecutor::new())))
            .with_execution_id("exec-1")
    }

    fn sh(label: &str, script: &str) -> JobSpec {
        JobSpec::new(label, vec!["sh".into(), "-c".into(), script.into()])
    }

    fn phase<'a>(flow: &'a FlowSummary, phase: ExecutionPhase) -> &'a PhaseSummary {
        flow.phases.iter().find(|p| p.phase == phase).unwrap()
    }

    #[test]
    fn test_successful_flow_runs_every_phase() {
        let plan = BatchPlan::new("b").with_flow(
            FlowPlan::new("f")
                .with_phase(ExecutionPhase::Main, vec![sh("a", "exit 0"), sh("b", "exit 0")])
                .with_phase(ExecutionPhase::Setup, vec![sh("prepare", "exit 0")])
                .with_phase(ExecutionPhase::Cleanup, vec![sh("tidy", "exit 0")]),
        );

        let summary = runner().run(&plan).unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.execution_id, "exec-1");

        let flow = &summary.flows[0];
        let order: Vec<_> = flow.phases.iter().map(|p| p.phase).collect();
        assert_eq!(order, vec![ExecutionPhase::Setup, ExecutionPhase::Main, ExecutionPhase::Cleanup]);
        assert!(flow.phases.iter().all(|p| p.status == RunStatus::Succeeded));
        assert_eq!(phase(flow, ExecutionPhase::Main).spans.len(), 2);
    }

    #[test]
    fn test_failure_skips_to_finalize() {
        let plan = BatchPlan::new("b").with_flow(
            FlowPlan::new("f")
                .with_phase(ExecutionPhase::Import, vec![sh("load", "exit 4")])
                .with_phase(ExecutionPhase::Main, vec![sh("work", "exit 0")])
                .with_phase(ExecutionPhase::Finalize, vec![sh("report", "exit 0")])
                .with_phase(ExecutionPhase::Cleanup, vec![sh("tidy", "exit 0")]),
        );

        let summary = runner().run(&plan).unwrap();
        assert!(!summary.succeeded());
        assert_eq!(summary.status, RunStatus::Failed);

        let flow = &summary.flows[0];
        let import = phase(flow, ExecutionPhase::Import);
        assert_eq!(import.status, RunStatus::Failed);
        assert_eq!(import.failed_job.as_deref(), Some("load"));
        assert_eq!(phase(flow, ExecutionPhase::Main).status, RunStatus::Skipped);
        assert_eq!(phase(flow, ExecutionPhase::Finalize).status, RunStatus::Succeeded);
        assert_eq!(phase(flow, ExecutionPhase::Cleanup).status, RunStatus::Skipped);
        assert!(summary.first_error().unwrap().contains("status 4"));
    }

    #[test]
    fn test_failed_finalize_keeps_first_error() {
        let plan = BatchPlan::new("b").with_flow(
            FlowPlan::new("f")
                .with_phase(ExecutionPhase::Main, vec![sh("work", "exit 2")])
                .with_phase(ExecutionPhase::Finalize, vec![sh("report", "exit 3")]),
        );

        let summary = runner().run(&plan).unwrap();
        let flow = &summary.flows[0];
        assert_eq!(phase(flow, ExecutionPhase::Finalize).status, RunStatus::Failed);
        assert!(flow.error.as_deref().unwrap().contains("'work'"));
    }

    #[test]
    fn test_batch_stops_at_failed_flow() {
        let plan = BatchPlan::new("b")
            .with_flow(FlowPlan::new("first").with_phase(ExecutionPhase::Main, vec![sh("x", "exit 1")]))
            .with_flow(FlowPlan::new("second").with_phase(ExecutionPhase::Main, vec![sh("y", "exit 0")]));

        let summary = runner().run(&plan).unwrap();
        assert_eq!(summary.flows[0].status, RunStatus::Failed);
        assert_eq!(summary.flows[1].status, RunStatus::Skipped);
        assert_eq!(summary.flows[1].phases[0].status, RunStatus::Skipped);
    }

    #[test]
    fn test_dry_run_renders_commands() {
        let mut spec = JobSpec::new("echo", vec!["echo".into(), "{flow_id}-{phase}".into()]);
        spec.env.insert("RUN".to_string(), "{execution_id}".to_string());
        let plan = BatchPlan::new("b").with_flow(FlowPlan::new("sales").with_phase(ExecutionPhase::Main, vec![spec]));

        let mut runner = runner();
        runner.set_dry_run(true);
        let summary = runner.run(&plan).unwrap();

        assert!(summary.succeeded());
        assert_eq!(summary.status, RunStatus::Planned);
        let commands = &summary.flows[0].phases[0].commands;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0], "[default] echo: RUN=\"exec-1\" \"echo\" \"sales-main\"");
    }

    #[test]
    fn test_unavailable_remote_fails_before_running() {
        let mut spec = sh("remote", "exit 0");
        spec.remote = true;
        let plan = BatchPlan::new("b").with_flow(FlowPlan::new("f").with_phase(ExecutionPhase::Main, vec![spec]));

        assert!(matches!(runner().run(&plan), Err(PlanError::RemoteUnavailable { .. })));
    }

    #[test]
    fn test_cancelled_monitor_skips_phases() {
        let plan = BatchPlan::new("b")
            .with_flow(FlowPlan::new("f").with_phase(ExecutionPhase::Main, vec![sh("x", "exit 0")]));
        let runner = runner();
        runner.monitor().cancel();

        let summary = runner.run(&plan).unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.flows[0].phases[0].status, RunStatus::Skipped);
        assert_eq!(summary.first_error(), Some("cancelled"));
    }

    #[test]
    fn test_summary_serializes_to_json() {
        let plan = BatchPlan::new("b")
            .with_flow(FlowPlan::new("f").with_phase(ExecutionPhase::Main, vec![sh("x", "exit 0")]));
        let json = runner().run(&plan).unwrap().to_json().unwrap();

        assert!(json.contains("\"batch_id\": \"b\""));
        assert!(json.contains("\"phase\": \"main\""));
        assert!(json.contains("\"status\": \"succeeded\""));
        assert!(!json.contains("timeline"));
    }
}
