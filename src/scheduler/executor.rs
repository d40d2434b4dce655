//! Job Dispatch
//!
//! [`JobExecutor`] resolves a job's resource id to a worker pool and queues
//! it there. Each submission yields an [`Executing`] handle that posts itself
//! to the caller's completion queue exactly once, whatever the outcome.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::ParallelConfig;
use crate::error::{ConfigError, ExecutionError};
use crate::execution::Interrupt;

use super::job::{ExecutionContext, ExecutionMonitor, Job};
use super::pool::ResourcePools;

const TARGET: &str = "batchcore::scheduler";

/// Exit code of a finished command, or why there is none.
pub type JobResult = Result<i32, ExecutionError>;

/// Sender side of a completion queue.
pub type DoneQueue = Sender<Arc<Executing>>;

#[derive(Debug, Default)]
struct Progress {
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    result: Option<JobResult>,
    finished: bool,
}

/// One job's in-flight execution.
pub struct Executing {
    monitor: Arc<ExecutionMonitor>,
    context: Arc<ExecutionContext>,
    job: Arc<dyn Job>,
    label: String,
    resource_id: String,
    pool: String,
    interrupt: Interrupt,
    progress: Mutex<Progress>,
}

impl Executing {
    fn new(
        monitor: Arc<ExecutionMonitor>,
        context: Arc<ExecutionContext>,
        job: Arc<dyn Job>,
        resource_id: String,
        pool: String,
    ) -> Self {
        Self {
            label: job.label().to_string(),
            monitor,
            context,
            job,
            resource_id,
            pool,
            interrupt: Interrupt::new(),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn service_label(&self) -> Option<&str> {
        self.job.service_label()
    }

    /// Resource id the job asked for.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Pool the job actually ran on.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// True if the requested resource was unknown and `default` was used.
    pub fn used_fallback_pool(&self) -> bool {
        self.pool != self.resource_id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Asks the running command to stop; a command not yet started never starts.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// True once the job reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.progress().finished
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.progress().started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.progress().finished_at
    }

    /// Wall time between start and finish.
    pub fn elapsed(&self) -> Option<Duration> {
        let progress = self.progress();
        match (progress.started_at, progress.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Takes the outcome. Returns `None` before the job finished or if already taken.
    pub fn take_result(&self) -> Option<JobResult> {
        self.progress().result.take()
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run(&self) {
        self.progress().started_at = Some(Instant::now());
        self.monitor.job_started();
        debug!(target: TARGET, "Starting job '{}' on pool '{}'", self.label, self.pool);

        let result = if self.interrupt.is_interrupted() || self.monitor.is_cancelled() {
            Err(ExecutionError::Interrupted {
                command: self.label.clone(),
            })
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| self.execute_job())).unwrap_or_else(|payload| {
                Err(ExecutionError::Panicked {
                    label: self.label.clone(),
                    message: panic_message(payload.as_ref()),
                })
            })
        };

        match &result {
            Ok(0) => info!(target: TARGET, "Job '{}' completed successfully", self.label),
            Ok(code) => error!(target: TARGET, "Job '{}' failed with exit code: {}", self.label, code),
            Err(e) => error!(target: TARGET, "Job '{}' failed: {}", self.label, e),
        }

        self.finish(result);
    }

    fn execute_job(&self) -> JobResult {
        let mut session = self.job.launch(&self.monitor, &self.context)?;
        let result = session.wait_for(&self.interrupt);
        session.close();
        result
    }

    fn finish(&self, result: JobResult) {
        let mut progress = self.progress();
        if progress.finished {
            return;
        }
        if progress.started_at.is_some() {
            self.monitor.job_finished();
        }
        progress.finished_at = Some(Instant::now());
        progress.result = Some(result);
        progress.finished = true;
    }
}

impl std::fmt::Debug for Executing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executing")
            .field("label", &self.label)
            .field("resource_id", &self.resource_id)
            .field("pool", &self.pool)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Posts the handle to the completion queue when dropped, whether or not
/// the task ever ran.
struct CompletionNotice {
    executing: Arc<Executing>,
    done: DoneQueue,
}

impl CompletionNotice {
    fn run(self) {
        self.executing.run();
    }
}

impl Drop for CompletionNotice {
    fn drop(&mut self) {
        if !self.executing.is_finished() {
            self.executing.finish(Err(ExecutionError::Dispatch {
                resource: self.executing.pool.clone(),
                message: "job was discarded before it ran".to_string(),
            }));
        }
        if self.done.send(Arc::clone(&self.executing)).is_err() {
            warn!(
                target: TARGET,
                "Completion of job '{}' has no receiver", self.executing.label
            );
        }
    }
}

/// Dispatches jobs to resource-scoped pools.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    pools: Arc<ResourcePools>,
}

impl JobExecutor {
    pub fn new(pools: Arc<ResourcePools>) -> Self {
        Self { pools }
    }

    /// Builds the pool registry from a concurrency configuration.
    pub fn from_config(config: &ParallelConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(Arc::new(ResourcePools::from_config(config)?)))
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    /// Queues `job` on its resource pool and returns immediately.
    ///
    /// An unknown resource id falls back to the `default` pool with a warning.
    /// The returned handle is posted to `done` exactly once when the job
    /// terminates; failures to dispatch are reported the same way.
    pub fn submit(
        &self,
        monitor: &Arc<ExecutionMonitor>,
        context: &Arc<ExecutionContext>,
        job: Arc<dyn Job>,
        done: &DoneQueue,
    ) -> Arc<Executing> {
        let resource_id = job.resource_id(context);
        let pool = match self.pools.get(&resource_id) {
            Some(pool) => pool,
            None => {
                warn!(
                    target: TARGET,
                    "Unknown resource '{}' for job '{}'; using the default pool",
                    resource_id,
                    job.label()
                );
                self.pools.default_pool()
            }
        };

        let executing = Arc::new(Executing::new(
            Arc::clone(monitor),
            Arc::clone(context),
            job,
            resource_id,
            pool.name().to_string(),
        ));

        let notice = CompletionNotice {
            executing: Arc::clone(&executing),
            done: done.clone(),
        };

        // On failure the task is dropped and the notice reports the dispatch error.
        if let Err(e) = pool.execute(move || notice.run()) {
            error!(target: TARGET, "Job '{}' was not dispatched: {}", executing.label, e);
        }

        executing
    }
}
