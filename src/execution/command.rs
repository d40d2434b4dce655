//! Command Executors
//!
//! The boundary the job-construction layer talks to: turn a command line plus
//! environment into a running [`RemoteSession`], and optionally wait for its
//! exit code.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};

use crate::error::ExecutionError;

use super::session::{Interrupt, LocalSession, Redirect, RemoteSession, LOCAL_POLL_INTERVAL};

/// Starts commands and waits for them.
pub trait CommandExecutor: Send + Sync {
    /// Starts a command without waiting for it.
    fn launch(
        &self,
        command_line: &[String],
        environment: &BTreeMap<String, String>,
        redirect: &Redirect,
    ) -> Result<Box<dyn RemoteSession>, ExecutionError>;

    /// Runs a command to completion and returns its exit code.
    fn execute(
        &self,
        command_line: &[String],
        environment: &BTreeMap<String, String>,
    ) -> Result<i32, ExecutionError> {
        self.execute_interruptibly(command_line, environment, &Interrupt::new())
    }

    /// Like [`CommandExecutor::execute`], abandoning the wait when `interrupt` fires.
    fn execute_interruptibly(
        &self,
        command_line: &[String],
        environment: &BTreeMap<String, String>,
        interrupt: &Interrupt,
    ) -> Result<i32, ExecutionError> {
        let mut session = self.launch(command_line, environment, &Redirect::default())?;
        let result = session.wait_for(interrupt);
        session.close();
        result
    }
}

/// Runs commands as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessCommandExecutor {
    working_dir: Option<PathBuf>,
    poll_interval: Duration,
}

impl ProcessCommandExecutor {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            poll_interval: LOCAL_POLL_INTERVAL,
        }
    }

    /// Sets the working directory for started processes.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets how often a running process is checked for exit.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for ProcessCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor for ProcessCommandExecutor {
    fn launch(
        &self,
        command_line: &[String],
        environment: &BTreeMap<String, String>,
        redirect: &Redirect,
    ) -> Result<Box<dyn RemoteSession>, ExecutionError> {
        debug!(target: "batchcore::local", "Launching locally: {:?}", command_line);

        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                warn!(target: "batchcore::local", "Working directory does not exist: {}", dir.display());
            }
        }

        let session = LocalSession::spawn(
            command_line,
            environment,
            self.working_dir.as_ref(),
            redirect,
            self.poll_interval,
        )?;
        Ok(Box::new(session))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use tempfile::tempdir;

    use crate::execution::session::OutputSink;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_execute_returns_exit_code() {
        let executor = ProcessCommandExecutor::new();
        assert_eq!(executor.execute(&sh("exit 0"), &BTreeMap::new()).unwrap(), 0);
        assert_eq!(executor.execute(&sh("exit 7"), &BTreeMap::new()).unwrap(), 7);
    }

    #[test]
    fn test_execute_passes_environment() {
        let executor = ProcessCommandExecutor::new();
        let mut env = BTreeMap::new();
        env.insert("EXPECTED".to_string(), "yes".to_string());

        let code = executor
            .execute(&sh("test \"$EXPECTED\" = yes"), &env)
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_execute_in_working_dir() {
        let temp_dir = tempdir().unwrap();
        let executor = ProcessCommandExecutor::new().with_working_dir(temp_dir.path());

        let code = executor.execute(&sh("echo hi > marker.txt"), &BTreeMap::new()).unwrap();
        assert_eq!(code, 0);
        assert!(temp_dir.path().join("marker.txt").exists());
    }

    #[test]
    fn test_execute_missing_program_is_error() {
        let executor = ProcessCommandExecutor::new();
        let result = executor.execute(&["/no/such/binary".to_string()], &BTreeMap::new());
        assert!(matches!(result, Err(ExecutionError::Io { .. })));
    }

    #[test]
    fn test_execute_interruptibly() {
        let executor = ProcessCommandExecutor::new().with_poll_interval(Duration::from_millis(5));
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.interrupt();
        });
        let result = executor.execute_interruptibly(&sh("sleep 30"), &BTreeMap::new(), &interrupt);
        handle.join().unwrap();

        assert!(result.unwrap_err().is_interrupted());
    }

    #[test]
    fn test_launch_with_redirect() {
        let executor = ProcessCommandExecutor::new();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let redirect = Redirect {
            stdout: OutputSink::Buffer(Arc::clone(&buffer)),
            stderr: OutputSink::Null,
        };

        let mut session = executor.launch(&sh("echo redirected"), &BTreeMap::new(), &redirect).unwrap();
        assert_eq!(session.wait_for(&Interrupt::new()).unwrap(), 0);
        session.close();

        assert_eq!(String::from_utf8_lossy(&buffer.lock().unwrap()), "redirected\n");
    }
}
