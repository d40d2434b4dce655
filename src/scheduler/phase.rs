//! Phase Scheduling
//!
//! [`JobScheduler`] runs every job of one phase concurrently and waits for
//! all of them to reach a terminal state. A failing job never stops its
//! siblings; the first failure by completion order becomes the phase result.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::ParallelConfig;
use crate::error::{ConfigError, PhaseError};
use crate::monitoring::{EventType, ExecutionTimeline};

use super::executor::{Executing, JobExecutor};
use super::job::{ExecutionContext, ExecutionMonitor, Job};

const TARGET: &str = "batchcore::scheduler";

/// How often the draining thread checks for cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Summary of a successful phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub context: ExecutionContext,
    /// Number of jobs that ran.
    pub jobs: usize,
    /// Jobs dispatched to `default` because their resource was unknown.
    pub fallbacks: usize,
    pub elapsed: Duration,
    pub timeline: ExecutionTimeline,
}

/// Failed phase: the representative error plus the same bookkeeping.
#[derive(Debug)]
pub struct PhaseFailure {
    pub error: PhaseError,
    pub report: PhaseReport,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phase {} failed: {}", self.report.context, self.error)
    }
}

impl std::error::Error for PhaseFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Per-phase orchestration over a configured [`JobExecutor`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use batchcore::config::{ParallelConfig, Profile};
/// use batchcore::execution::ProcessCommandExecutor;
/// use batchcore::scheduler::{CommandJob, ExecutionContext, ExecutionMonitor, ExecutionPhase, Job, JobScheduler};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let profile = Profile::load("profile.yaml")?;
///     let mut scheduler = JobScheduler::new();
///     scheduler.configure(&ParallelConfig::from_profile(&profile)?)?;
///
///     let local = Arc::new(ProcessCommandExecutor::new());
///     let jobs: Vec<Arc<dyn Job>> = vec![
///         Arc::new(CommandJob::new("a", vec!["true".into()], local.clone())),
///         Arc::new(CommandJob::new("b", vec!["true".into()], local)),
///     ];
///     let context = ExecutionContext::new("batch", "flow", "exec-1", ExecutionPhase::Main);
///     scheduler.execute(&Arc::new(ExecutionMonitor::new()), &context, jobs)?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Default)]
pub struct JobScheduler {
    executor: Option<JobExecutor>,
    cancel_check_interval: Option<Duration>,
}

impl JobScheduler {
    /// Creates an unconfigured scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler over an existing executor.
    pub fn with_executor(executor: JobExecutor) -> Self {
        Self {
            executor: Some(executor),
            cancel_check_interval: None,
        }
    }

    /// Builds the resource pools. Replaces any previous configuration.
    pub fn configure(&mut self, config: &ParallelConfig) -> Result<(), ConfigError> {
        self.executor = Some(JobExecutor::from_config(config)?);
        Ok(())
    }

    /// Sets how often cancellation is checked while waiting.
    pub fn set_cancel_check_interval(&mut self, interval: Duration) {
        self.cancel_check_interval = Some(interval);
    }

    pub fn is_configured(&self) -> bool {
        self.executor.is_some()
    }

    pub fn executor(&self) -> Option<&JobExecutor> {
        self.executor.as_ref()
    }

    /// Runs one phase and waits for every job.
    pub fn execute(
        &self,
        monitor: &Arc<ExecutionMonitor>,
        context: &ExecutionContext,
        jobs: Vec<Arc<dyn Job>>,
    ) -> Result<PhaseReport, PhaseFailure> {
        let start_time = Instant::now();
        let context = Arc::new(context.clone());

        let Some(executor) = &self.executor else {
            return Err(PhaseFailure {
                error: PhaseError::NotConfigured,
                report: PhaseReport::empty(&context, start_time),
            });
        };

        info!(target: TARGET, "Starting phase {} with {} job(s)", context, jobs.len());

        let mut timeline = ExecutionTimeline::new();
        let (tx, rx) = mpsc::channel::<Arc<Executing>>();

        let handles: Vec<Arc<Executing>> = jobs
            .into_iter()
            .map(|job| executor.submit(monitor, &context, job, &tx))
            .collect();
        drop(tx);

        let poll = self.cancel_check_interval.unwrap_or(CANCEL_CHECK_INTERVAL);
        let mut first_failure: Option<PhaseError> = None;
        let mut received = 0;
        let mut interrupted = false;

        while received < handles.len() {
            let done = match rx.recv_timeout(poll) {
                Ok(done) => done,
                Err(RecvTimeoutError::Timeout) => {
                    if monitor.is_cancelled() && !interrupted {
                        warn!(
                            target: TARGET,
                            "Phase {} cancelled; interrupting {} outstanding job(s)",
                            context,
                            handles.len() - received
                        );
                        handles.iter().for_each(|handle| handle.interrupt());
                        interrupted = true;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let outstanding = handles.len() - received;
                    let report = PhaseReport::from_handles(&context, &handles, start_time, timeline);
                    return Err(PhaseFailure {
                        error: first_failure.unwrap_or(PhaseError::QueueClosed { outstanding }),
                        report,
                    });
                }
            };
            received += 1;

            if let Some(started) = done.started_at() {
                timeline.add_event_at(done.label().to_string(), EventType::Started, started);
            }
            let finished = done.finished_at().unwrap_or_else(Instant::now);

            let failure = match done.take_result() {
                Some(Ok(0)) => None,
                Some(Ok(exit_code)) => Some(PhaseError::JobFailed {
                    label: done.label().to_string(),
                    resource_id: done.resource_id().to_string(),
                    exit_code,
                }),
                Some(Err(source)) => Some(PhaseError::JobError {
                    label: done.label().to_string(),
                    resource_id: done.resource_id().to_string(),
                    source,
                }),
                None => None,
            };

            match failure {
                None => {
                    timeline.add_event_at(done.label().to_string(), EventType::Completed, finished);
                }
                Some(error) => {
                    timeline.add_event_at(done.label().to_string(), EventType::Failed, finished);
                    if first_failure.is_none() {
                        first_failure = Some(error);
                    } else {
                        debug!(target: TARGET, "Additional failure in phase {}: {}", context, error);
                    }
                }
            }

            debug!(
                target: TARGET,
                "Phase {}: {}/{} job(s) finished",
                context,
                received,
                handles.len()
            );
        }

        let report = PhaseReport::from_handles(&context, &handles, start_time, timeline);
        match first_failure {
            Some(error) => {
                warn!(target: TARGET, "Phase {} failed: {}", context, error);
                Err(PhaseFailure { error, report })
            }
            None => {
                info!(
                    target: TARGET,
                    "Phase {} completed in {:.2?}",
                    context,
                    report.elapsed
                );
                Ok(report)
            }
        }
    }
}

impl PhaseReport {
    fn empty(context: &ExecutionContext, start_time: Instant) -> Self {
        Self {
            context: context.clone(),
            jobs: 0,
            fallbacks: 0,
            elapsed: start_time.elapsed(),
            timeline: ExecutionTimeline::new(),
        }
    }

    fn from_handles(
        context: &ExecutionContext,
        handles: &[Arc<Executing>],
        start_time: Instant,
        timeline: ExecutionTimeline,
    ) -> Self {
        Self {
            context: context.clone(),
            jobs: handles.len(),
            fallbacks: handles.iter().filter(|h| h.used_fallback_pool()).count(),
            elapsed: start_time.elapsed(),
            timeline,
        }
    }
}
