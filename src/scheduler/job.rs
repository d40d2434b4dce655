//! Jobs and Their Execution Context
//!
//! A [`Job`] is the unit the scheduler dispatches: a resource id choosing the
//! worker pool, a command line, environment variables and a way to start the
//! command. [`CommandJob`] is the standard implementation on top of a
//! [`CommandExecutor`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_POOL;
use crate::error::ExecutionError;
use crate::execution::{CommandExecutor, Redirect, RemoteSession};

/// Stage of a flow. Phases run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Setup,
    Initialize,
    Import,
    Prologue,
    Main,
    Epilogue,
    Export,
    Finalize,
    Cleanup,
}

impl ExecutionPhase {
    /// Every phase, in execution order.
    pub const ALL: [ExecutionPhase; 9] = [
        Self::Setup,
        Self::Initialize,
        Self::Import,
        Self::Prologue,
        Self::Main,
        Self::Epilogue,
        Self::Export,
        Self::Finalize,
        Self::Cleanup,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Initialize => "initialize",
            Self::Import => "import",
            Self::Prologue => "prologue",
            Self::Main => "main",
            Self::Epilogue => "epilogue",
            Self::Export => "export",
            Self::Finalize => "finalize",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for ExecutionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|phase| phase.symbol().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown phase: '{}'", s))
    }
}

/// Identifies the running unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub batch_id: String,
    pub flow_id: String,
    pub execution_id: String,
    pub phase: ExecutionPhase,
}

impl ExecutionContext {
    pub fn new(
        batch_id: impl Into<String>,
        flow_id: impl Into<String>,
        execution_id: impl Into<String>,
        phase: ExecutionPhase,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            flow_id: flow_id.into(),
            execution_id: execution_id.into(),
            phase,
        }
    }

    /// Same batch, flow and execution, different phase.
    pub fn with_phase(&self, phase: ExecutionPhase) -> Self {
        Self {
            phase,
            ..self.clone()
        }
    }

    /// Replaces `{batch_id}`, `{flow_id}`, `{execution_id}` and `{phase}`.
    pub fn substitute(&self, text: &str) -> String {
        text.replace("{batch_id}", &self.batch_id)
            .replace("{flow_id}", &self.flow_id)
            .replace("{execution_id}", &self.execution_id)
            .replace("{phase}", self.phase.symbol())
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.batch_id, self.flow_id, self.execution_id, self.phase
        )
    }
}

/// Progress and cancellation shared by every job of a phase.
#[derive(Debug, Default)]
pub struct ExecutionMonitor {
    cancelled: AtomicBool,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the phase.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn job_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn job_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    /// Jobs that have started and not yet finished.
    pub fn running(&self) -> usize {
        self.started
            .load(Ordering::SeqCst)
            .saturating_sub(self.finished.load(Ordering::SeqCst))
    }

    /// Jobs that have reached a terminal state.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// A unit of work dispatched by the scheduler.
pub trait Job: Send + Sync {
    /// Diagnostic name, unique within a phase.
    fn label(&self) -> &str;

    /// Name of the service this job belongs to, for diagnostics.
    fn service_label(&self) -> Option<&str> {
        None
    }

    /// Name of the worker pool this job asks for.
    fn resource_id(&self, context: &ExecutionContext) -> String;

    /// Command line tokens, with context placeholders resolved.
    fn command_line(&self, context: &ExecutionContext) -> Vec<String>;

    /// Environment variables, with context placeholders resolved.
    fn environment(&self, _context: &ExecutionContext) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Starts the command.
    fn launch(
        &self,
        monitor: &ExecutionMonitor,
        context: &ExecutionContext,
    ) -> Result<Box<dyn RemoteSession>, ExecutionError>;
}

/// A job that runs a command line through a [`CommandExecutor`].
#[derive(Clone)]
pub struct CommandJob {
    label: String,
    service_label: Option<String>,
    resource_id: Option<String>,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
    executor: Arc<dyn CommandExecutor>,
    redirect: Redirect,
}

impl CommandJob {
    /// Creates a job. Output is logged under the job label by default.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use batchcore::execution::ProcessCommandExecutor;
    /// use batchcore::scheduler::CommandJob;
    ///
    /// let job = CommandJob::new("load", vec!["echo".into(), "{batch_id}".into()], Arc::new(ProcessCommandExecutor::new()))
    ///     .with_resource("hadoop")
    ///     .with_env("MODE", "full");
    /// ```
    pub fn new(label: impl Into<String>, command: Vec<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        let label = label.into();
        Self {
            redirect: Redirect::logged(label.clone()),
            label,
            service_label: None,
            resource_id: None,
            command,
            environment: BTreeMap::new(),
            executor,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource_id = Some(resource.into());
        self
    }

    pub fn with_service_label(mut self, service: impl Into<String>) -> Self {
        self.service_label = Some(service.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment.extend(environment);
        self
    }

    pub fn with_redirect(mut self, redirect: Redirect) -> Self {
        self.redirect = redirect;
        self
    }
}

impl fmt::Debug for CommandJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandJob")
            .field("label", &self.label)
            .field("service_label", &self.service_label)
            .field("resource_id", &self.resource_id)
            .field("command", &self.command)
            .finish()
    }
}

impl Job for CommandJob {
    fn label(&self) -> &str {
        &self.label
    }

    fn service_label(&self) -> Option<&str> {
        self.service_label.as_deref()
    }

    fn resource_id(&self, _context: &ExecutionContext) -> String {
        match &self.resource_id {
            Some(resource) if !resource.trim().is_empty() => resource.clone(),
            _ => DEFAULT_POOL.to_string(),
        }
    }

    fn command_line(&self, context: &ExecutionContext) -> Vec<String> {
        self.command.iter().map(|token| context.substitute(token)).collect()
    }

    fn environment(&self, context: &ExecutionContext) -> BTreeMap<String, String> {
        self.environment
            .iter()
            .map(|(name, value)| (name.clone(), context.substitute(value)))
            .collect()
    }

    fn launch(
        &self,
        monitor: &ExecutionMonitor,
        context: &ExecutionContext,
    ) -> Result<Box<dyn RemoteSession>, ExecutionError> {
        if monitor.is_cancelled() {
            return Err(ExecutionError::Interrupted {
                command: self.command.join(" "),
            });
        }

        let command_line = self.command_line(context);
        if command_line.is_empty() {
            return Err(ExecutionError::Launch {
                label: self.label.clone(),
                message: "command line is empty".to_string(),
            });
        }

        debug!(target: "batchcore::job", "Launching '{}' in {}: {:?}", self.label, context, command_line);
        self.executor
            .launch(&command_line, &self.environment(context), &self.redirect)
    }
}
