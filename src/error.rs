//! Error Types
//!
//! One enum per failure domain:
//!
//! - [`ConfigError`]: fatal, raised before any job starts
//! - [`ExecutionError`]: per-job transport, launch and interruption failures
//! - [`PhaseError`]: the single representative failure of a phase
//! - [`LivenessError`]: misuse of a closed liveness keeper
//! - [`PlanError`]: unreadable or invalid batch plans

use std::time::Duration;

use thiserror::Error;

/// Configuration failures. Never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing mandatory configuration key '{key}'")]
    MissingKey { key: String },

    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unresolved variable '${{{variable}}}' in '{key}'")]
    UnresolvedVariable { key: String, variable: String },

    #[error("'parallel.default' must be configured")]
    MissingDefaultPool,

    #[error("failed to start worker pool '{resource}': {source}")]
    PoolSpawn {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {message}")]
    Parse { path: String, message: String },
}

/// Failures of a single job's execution.
///
/// Transport variants carry the connection coordinates and the command, never
/// the private key or its passphrase.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{stage} failed for {user}@{host}:{port} (command: {command}): {message}")]
    Transport {
        stage: &'static str,
        user: String,
        host: String,
        port: u16,
        command: String,
        message: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted while waiting for: {command}")]
    Interrupted { command: String },

    #[error("gave up waiting after {waited:?} for: {command}")]
    Timeout { command: String, waited: Duration },

    #[error("failed to launch job '{label}': {message}")]
    Launch { label: String, message: String },

    #[error("failed to dispatch to pool '{resource}': {message}")]
    Dispatch { resource: String, message: String },

    #[error("job '{label}' panicked: {message}")]
    Panicked { label: String, message: String },
}

impl ExecutionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if this failure was caused by an interrupt request.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Outcome of a failed phase.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("job '{label}' (resource '{resource_id}') exited with status {exit_code}")]
    JobFailed {
        label: String,
        resource_id: String,
        exit_code: i32,
    },

    #[error("job '{label}' (resource '{resource_id}') failed: {source}")]
    JobError {
        label: String,
        resource_id: String,
        #[source]
        source: ExecutionError,
    },

    #[error("scheduler has not been configured")]
    NotConfigured,

    #[error("completion queue closed with {outstanding} job(s) unreported")]
    QueueClosed { outstanding: usize },
}

impl PhaseError {
    /// Label of the job this failure is attributed to, if any.
    pub fn job_label(&self) -> Option<&str> {
        match self {
            Self::JobFailed { label, .. } | Self::JobError { label, .. } => Some(label),
            _ => None,
        }
    }
}

/// Liveness keeper failures.
#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("liveness keeper is closed")]
    Closed,

    #[error("failed to start liveness ticker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Batch plan loading and validation failures.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("failed to read plan '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("plan has no batch_id")]
    MissingBatchId,

    #[error("flow #{index} has no flow_id")]
    MissingFlowId { index: usize },

    #[error("duplicate flow '{flow}'")]
    DuplicateFlow { flow: String },

    #[error("job #{index} of {flow}/{phase} has an empty label")]
    EmptyLabel {
        flow: String,
        phase: String,
        index: usize,
    },

    #[error("job '{label}' in {flow}/{phase} has an empty command")]
    EmptyCommand {
        flow: String,
        phase: String,
        label: String,
    },

    #[error("duplicate job label '{label}' in {flow}/{phase}")]
    DuplicateLabel {
        flow: String,
        phase: String,
        label: String,
    },

    #[error("job '{label}' is remote but no ssh configuration was given")]
    RemoteUnavailable { label: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_names_coordinates() {
        let err = ExecutionError::Transport {
            stage: "authentication",
            user: "batch".to_string(),
            host: "example.org".to_string(),
            port: 2222,
            command: "\"hadoop\" \"jar\"".to_string(),
            message: "denied".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("batch@example.org:2222"));
        assert!(text.contains("authentication"));
        assert!(text.contains("hadoop"));
    }

    #[test]
    fn test_unresolved_variable_message() {
        let err = ConfigError::UnresolvedVariable {
            key: "ssh.host".to_string(),
            variable: "REMOTE_HOST".to_string(),
        };
        assert_eq!(err.to_string(), "unresolved variable '${REMOTE_HOST}' in 'ssh.host'");
    }

    #[test]
    fn test_phase_error_job_label() {
        let err = PhaseError::JobFailed {
            label: "import".to_string(),
            resource_id: "default".to_string(),
            exit_code: 3,
        };
        assert_eq!(err.job_label(), Some("import"));
        assert_eq!(PhaseError::NotConfigured.job_label(), None);
    }

    #[test]
    fn test_is_interrupted() {
        let err = ExecutionError::Interrupted {
            command: "sleep 10".to_string(),
        };
        assert!(err.is_interrupted());
        assert!(!ExecutionError::Launch {
            label: "x".to_string(),
            message: "y".to_string()
        }
        .is_interrupted());
    }
}
