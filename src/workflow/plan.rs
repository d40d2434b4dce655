//! Batch Plan
//!
//! The YAML description of what a batch runs: flows, and for each flow the
//! jobs of every phase.
//!
//! # Example YAML Format
//!
//! ```yaml
//! batch_id: nightly
//! flows:
//!   - flow_id: sales
//!     phases:
//!       import:
//!         - label: fetch
//!           command: [curl, -fsSO, "https://example.org/{batch_id}.csv"]
//!       main:
//!         - label: aggregate
//!           resource: hadoop
//!           remote: true
//!           command: [hadoop, jar, agg.jar, "{execution_id}"]
//!           env:
//!             MODE: full
//!         - label: index
//!           command: ./reindex.sh --flow {flow_id}
//! ```
//!
//! A command given as a single string runs through `sh -c`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::PlanError;
use crate::execution::CommandExecutor;
use crate::scheduler::{CommandJob, ExecutionPhase, Job};

/// One command to run in a phase.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub label: String,

    /// Optional service name, reported alongside the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Worker pool to run on; `default` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(deserialize_with = "command_tokens")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Run over SSH instead of as a local process.
    #[serde(default)]
    pub remote: bool,
}

/// Accepts either a token list or a shell string.
fn command_tokens<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec!["sh".to_string(), "-c".to_string(), s]),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                _ => Err(de::Error::custom("expected a string in command list")),
            })
            .collect(),
        _ => Err(de::Error::custom("expected a command string or list")),
    }
}

impl JobSpec {
    pub fn new(label: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            label: label.into(),
            service: None,
            resource: None,
            command,
            env: BTreeMap::new(),
            remote: false,
        }
    }

    /// Builds the schedulable job on the matching executor.
    pub fn to_job(&self, executors: &ExecutorSet) -> Result<Arc<dyn Job>, PlanError> {
        let executor = executors.select(self)?;
        let mut job = CommandJob::new(self.label.clone(), self.command.clone(), executor)
            .with_environment(self.env.clone());
        if let Some(resource) = &self.resource {
            job = job.with_resource(resource.clone());
        }
        if let Some(service) = &self.service {
            job = job.with_service_label(service.clone());
        }
        Ok(Arc::new(job))
    }
}

/// One flow: its jobs grouped by phase.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowPlan {
    pub flow_id: String,

    /// Iterates in execution order since phases order by declaration.
    #[serde(default)]
    pub phases: BTreeMap<ExecutionPhase, Vec<JobSpec>>,
}

impl FlowPlan {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            phases: BTreeMap::new(),
        }
    }

    pub fn with_phase(mut self, phase: ExecutionPhase, jobs: Vec<JobSpec>) -> Self {
        self.phases.insert(phase, jobs);
        self
    }

    /// Jobs of one phase; empty if the phase is absent.
    pub fn jobs(&self, phase: ExecutionPhase) -> &[JobSpec] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn job_count(&self) -> usize {
        self.phases.values().map(Vec::len).sum()
    }

    /// Builds every job of the flow, failing before anything runs.
    pub fn build(
        &self,
        executors: &ExecutorSet,
    ) -> Result<BTreeMap<ExecutionPhase, Vec<Arc<dyn Job>>>, PlanError> {
        self.phases
            .iter()
            .map(|(phase, specs)| {
                let jobs = specs
                    .iter()
                    .map(|spec| spec.to_job(executors))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((*phase, jobs))
            })
            .collect()
    }

    fn validate(&self) -> Result<(), PlanError> {
        for (phase, jobs) in &self.phases {
            let mut seen = HashSet::new();
            for (index, job) in jobs.iter().enumerate() {
                if job.label.trim().is_empty() {
                    return Err(PlanError::EmptyLabel {
                        flow: self.flow_id.clone(),
                        phase: phase.to_string(),
                        index,
                    });
                }
                if job.command.is_empty() || job.command[0].trim().is_empty() {
                    return Err(PlanError::EmptyCommand {
                        flow: self.flow_id.clone(),
                        phase: phase.to_string(),
                        label: job.label.clone(),
                    });
                }
                if !seen.insert(job.label.as_str()) {
                    return Err(PlanError::DuplicateLabel {
                        flow: self.flow_id.clone(),
                        phase: phase.to_string(),
                        label: job.label.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A whole batch: flows run one after another.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_id: String,

    #[serde(default)]
    pub flows: Vec<FlowPlan>,
}

impl BatchPlan {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
            flows: Vec::new(),
        }
    }

    pub fn with_flow(mut self, flow: FlowPlan) -> Self {
        self.flows.push(flow);
        self
    }

    /// Parses and validates a plan held in memory.
    pub fn from_yaml_str(content: &str, source: &str) -> Result<Self, PlanError> {
        let plan: BatchPlan = serde_yaml::from_str(content).map_err(|e| PlanError::Parse {
            path: source.to_string(),
            message: e.to_string(),
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Checks ids, labels and commands.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.batch_id.trim().is_empty() {
            return Err(PlanError::MissingBatchId);
        }

        let mut flows = HashSet::new();
        for (index, flow) in self.flows.iter().enumerate() {
            if flow.flow_id.trim().is_empty() {
                return Err(PlanError::MissingFlowId { index });
            }
            if !flows.insert(flow.flow_id.as_str()) {
                return Err(PlanError::DuplicateFlow {
                    flow: flow.flow_id.clone(),
                });
            }
            flow.validate()?;
        }
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.flows.iter().map(FlowPlan::job_count).sum()
    }

    /// True if any job asks for remote execution.
    pub fn needs_remote(&self) -> bool {
        self.flows
            .iter()
            .flat_map(|flow| flow.phases.values())
            .flatten()
            .any(|job| job.remote)
    }
}

/// Loads a batch plan from a YAML file and validates it.
///
/// # Example
///
/// ```rust,no_run
/// use batchcore::workflow::load_plan;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let plan = load_plan("batch.yaml")?;
///     println!("{} flow(s), {} job(s)", plan.flows.len(), plan.job_count());
///     Ok(())
/// }
/// ```
pub fn load_plan(path: impl AsRef<Path>) -> Result<BatchPlan, PlanError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    info!(target: "batchcore::plan", "Loading plan from: {}", display);

    let content = fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: display.clone(),
        source,
    })?;
    debug!(target: "batchcore::plan", "Plan content loaded ({} bytes)", content.len());

    let plan = BatchPlan::from_yaml_str(&content, &display)?;
    info!(
        target: "batchcore::plan",
        "Plan '{}': {} flow(s), {} job(s)",
        plan.batch_id,
        plan.flows.len(),
        plan.job_count()
    );
    Ok(plan)
}

/// The executors jobs may run on.
#[derive(Clone)]
pub struct ExecutorSet {
    local: Arc<dyn CommandExecutor>,
    remote: Option<Arc<dyn CommandExecutor>>,
}

impl ExecutorSet {
    pub fn new(local: Arc<dyn CommandExecutor>) -> Self {
        Self { local, remote: None }
    }

    pub fn with_remote(mut self, remote: Arc<dyn CommandExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn select(&self, spec: &JobSpec) -> Result<Arc<dyn CommandExecutor>, PlanError> {
        if !spec.remote {
            return Ok(Arc::clone(&self.local));
        }
        self.remote
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| PlanError::RemoteUnavailable {
                label: spec.label.clone(),
            })
    }
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSet")
            .field("remote", &self.remote.is_some())
            .finish()
    }
}
