//! Running Command Sessions
//!
//! A [`RemoteSession`] is a started command whose exit can be awaited. The
//! local variant wraps a child process; the secure-shell variant lives in
//! [`super::ssh`].
//!
//! Waiting is interruptible through a shared [`Interrupt`] flag. An
//! interrupted wait tears the command down and reports
//! [`ExecutionError::Interrupted`].

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::ExecutionError;

/// Default interval between local exit checks.
pub const LOCAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output pumps may keep draining after the process is gone.
/// Pumps still blocked afterwards (a detached descendant holds the pipe) are
/// left behind.
const PUMP_JOIN_DEADLINE: Duration = Duration::from_millis(250);

/// Shared request to abandon a wait.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests interruption. Idempotent.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Destination for a command's stdout or stderr.
#[derive(Clone, Default)]
pub enum OutputSink {
    /// Write to this process's own stdout/stderr.
    #[default]
    Inherit,
    /// Throw the output away.
    Null,
    /// Emit each line through the `log` facade, prefixed with a label.
    Log(String),
    /// Append to a shared buffer.
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl OutputSink {
    /// Opens a writer; `error` selects stderr for [`OutputSink::Inherit`].
    pub fn open(&self, error: bool) -> Box<dyn Write + Send> {
        match self {
            Self::Inherit if error => Box::new(io::stderr()),
            Self::Inherit => Box::new(io::stdout()),
            Self::Null => Box::new(io::sink()),
            Self::Log(label) => Box::new(LogWriter::new(label.clone(), error)),
            Self::Buffer(buffer) => Box::new(BufferWriter(Arc::clone(buffer))),
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherit => write!(f, "Inherit"),
            Self::Null => write!(f, "Null"),
            Self::Log(label) => write!(f, "Log({})", label),
            Self::Buffer(_) => write!(f, "Buffer"),
        }
    }
}

/// Where a session's output streams are bound.
#[derive(Debug, Clone, Default)]
pub struct Redirect {
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Redirect {
    /// Logs both streams under `label`.
    pub fn logged(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            stdout: OutputSink::Log(label.clone()),
            stderr: OutputSink::Log(label),
        }
    }

    pub fn discard() -> Self {
        Self {
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
        }
    }
}

struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Line-buffered writer that forwards complete lines to the logger.
struct LogWriter {
    label: String,
    error: bool,
    pending: Vec<u8>,
}

impl LogWriter {
    fn new(label: String, error: bool) -> Self {
        Self {
            label,
            error,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if self.error {
            warn!(target: "batchcore::output", "[{}] {}", self.label, text);
        } else {
            info!(target: "batchcore::output", "[{}] {}", self.label, text);
        }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest);
        }
    }
}

/// A started command.
pub trait RemoteSession: Send {
    /// Human-readable command, used in diagnostics.
    fn command(&self) -> &str;

    /// The command's stdin, if it is still open.
    fn input(&mut self) -> Option<&mut dyn Write>;

    /// Signals end of input to the command.
    fn close_input(&mut self) -> Result<(), ExecutionError>;

    /// Blocks until the command exits and returns its exit status.
    ///
    /// If `interrupt` fires first, the command is torn down and
    /// [`ExecutionError::Interrupted`] is returned.
    fn wait_for(&mut self, interrupt: &Interrupt) -> Result<i32, ExecutionError>;

    /// Releases the session. Teardown failures are logged, never returned.
    fn close(&mut self);
}

/// A command running as a local child process.
pub struct LocalSession {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    pumps: Vec<JoinHandle<()>>,
    poll_interval: Duration,
    finished: bool,
}

impl LocalSession {
    /// Spawns `command_line[0]` with the remaining tokens as arguments.
    pub fn spawn(
        command_line: &[String],
        environment: &BTreeMap<String, String>,
        working_dir: Option<&PathBuf>,
        redirect: &Redirect,
        poll_interval: Duration,
    ) -> Result<Self, ExecutionError> {
        let (program, args) = command_line.split_first().ok_or_else(|| {
            ExecutionError::io(
                "cannot start process",
                io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
            )
        })?;
        let command = command_line.join(" ");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so an interrupt reaches every descendant.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
            debug!(target: "batchcore::local", "Executing in directory: {}", dir.display());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::io(format!("failed to start '{}'", command), e))?;
        debug!(target: "batchcore::local", "Started process {} for: {}", child.id(), command);

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, redirect.stdout.open(false)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, redirect.stderr.open(true)));
        }
        let stdin = child.stdin.take();

        Ok(Self {
            command,
            child,
            stdin,
            pumps,
            poll_interval,
            finished: false,
        })
    }

    /// OS process id of the child.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Joins the output pumps, giving up on stragglers after a deadline.
    fn join_pumps(&mut self) {
        let deadline = Instant::now() + PUMP_JOIN_DEADLINE;
        while self.pumps.iter().any(|handle| !handle.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        for handle in self.pumps.drain(..) {
            if !handle.is_finished() {
                debug!(
                    target: "batchcore::local",
                    "Output of '{}' is still held open by a descendant; not waiting for it",
                    self.command
                );
                continue;
            }
            if handle.join().is_err() {
                warn!(target: "batchcore::local", "Output pump panicked for: {}", self.command);
            }
        }
    }

    fn destroy(&mut self) {
        #[cfg(unix)]
        self.kill_process_group();

        if let Err(e) = self.child.kill() {
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!(target: "batchcore::local", "Failed to kill '{}': {}", self.command, e);
            }
        }
        if let Err(e) = self.child.wait() {
            warn!(target: "batchcore::local", "Failed to reap '{}': {}", self.command, e);
        }
        self.finished = true;
        self.join_pumps();
    }

    /// Sends SIGKILL to the child's process group.
    #[cfg(unix)]
    fn kill_process_group(&self) {
        let Ok(pgid) = libc::pid_t::try_from(self.child.id()) else {
            return;
        };
        // SAFETY: the child was spawned as the leader of its own process group,
        // so -pgid addresses only that group. kill(2) has no memory effects.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(target: "batchcore::local", "Failed to kill process group of '{}': {}", self.command, err);
            }
        }
    }
}

fn pump<R>(mut source: R, mut sink: Box<dyn Write + Send>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        if let Err(e) = io::copy(&mut source, &mut sink) {
            debug!(target: "batchcore::local", "Output stream closed: {}", e);
        }
        let _ = sink.flush();
    })
}

/// Maps an exit status to an integer code; signal deaths become `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl RemoteSession for LocalSession {
    fn command(&self) -> &str {
        &self.command
    }

    fn input(&mut self) -> Option<&mut dyn Write> {
        self.stdin.as_mut().map(|stdin| stdin as &mut dyn Write)
    }

    fn close_input(&mut self) -> Result<(), ExecutionError> {
        self.stdin.take();
        Ok(())
    }

    fn wait_for(&mut self, interrupt: &Interrupt) -> Result<i32, ExecutionError> {
        self.stdin.take();

        loop {
            let polled = self
                .child
                .try_wait()
                .map_err(|e| ExecutionError::io(format!("failed to wait for '{}'", self.command), e))?;

            if let Some(status) = polled {
                self.finished = true;
                self.join_pumps();
                let code = exit_code(status);
                debug!(target: "batchcore::local", "Process exited with {}: {}", code, self.command);
                return Ok(code);
            }

            if interrupt.is_interrupted() {
                info!(target: "batchcore::local", "Interrupted, destroying process: {}", self.command);
                self.destroy();
                return Err(ExecutionError::Interrupted {
                    command: self.command.clone(),
                });
            }

            thread::sleep(self.poll_interval);
        }
    }

    fn close(&mut self) {
        self.stdin.take();
        if !self.finished {
            self.destroy();
        }
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn spawn(script: &str, redirect: &Redirect) -> LocalSession {
        LocalSession::spawn(&sh(script), &BTreeMap::new(), None, redirect, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_local_exit_code() {
        let mut session = spawn("exit 7", &Redirect::discard());
        assert_eq!(session.wait_for(&Interrupt::new()).unwrap(), 7);
    }

    #[test]
    fn test_local_captures_output() {
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let redirect = Redirect {
            stdout: OutputSink::Buffer(Arc::clone(&stdout)),
            stderr: OutputSink::Buffer(Arc::clone(&stderr)),
        };

        let mut session = spawn("echo out; echo err >&2", &redirect);
        assert_eq!(session.wait_for(&Interrupt::new()).unwrap(), 0);

        assert_eq!(String::from_utf8_lossy(&stdout.lock().unwrap()), "out\n");
        assert_eq!(String::from_utf8_lossy(&stderr.lock().unwrap()), "err\n");
    }

    #[test]
    fn test_local_environment_and_stdin() {
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let redirect = Redirect {
            stdout: OutputSink::Buffer(Arc::clone(&stdout)),
            stderr: OutputSink::Null,
        };
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());

        let mut session = LocalSession::spawn(
            &sh("read line; echo \"$GREETING $line\""),
            &env,
            None,
            &redirect,
            Duration::from_millis(10),
        )
        .unwrap();
        session.input().unwrap().write_all(b"there\n").unwrap();
        session.close_input().unwrap();
        assert!(session.input().is_none());

        assert_eq!(session.wait_for(&Interrupt::new()).unwrap(), 0);
        assert_eq!(String::from_utf8_lossy(&stdout.lock().unwrap()), "hi there\n");
    }

    #[test]
    fn test_local_interrupt_destroys_process() {
        let mut session = spawn("sleep 30", &Redirect::discard());
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();

        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.interrupt();
        });

        let err = session.wait_for(&interrupt).unwrap_err();
        handle.join().unwrap();

        assert!(err.is_interrupted());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Zombies count as dead: an orphan may wait for a reaper that never comes.
    fn process_alive(pid: libc::pid_t) -> bool {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            let state = stat.rsplit(')').next().and_then(|rest| rest.trim_start().chars().next());
            return !matches!(state, Some('Z') | Some('X'));
        }
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, 0) };
        ret == 0 && !std::path::Path::new("/proc/self").exists()
    }

    #[test]
    fn test_local_interrupt_kills_shell_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleep.pid");
        let script = format!("sleep 5 & echo $! > '{}'; wait; echo x", pid_file.display());
        let mut session = spawn(&script, &Redirect::discard());

        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.interrupt();
        });

        let err = session.wait_for(&interrupt).unwrap_err();
        handle.join().unwrap();
        assert!(err.is_interrupted());
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());

        let pid: libc::pid_t = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while process_alive(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!process_alive(pid), "sleep {} outlived the interrupt", pid);
    }

    #[test]
    fn test_local_interrupt_of_sequential_shell_is_prompt() {
        let mut session = spawn("sleep 5; echo x", &Redirect::discard());
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.interrupt();
        });

        assert!(session.wait_for(&interrupt).unwrap_err().is_interrupted());
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_background_child_does_not_delay_exit() {
        let started = Instant::now();
        let mut session = spawn("sleep 5 & exit 0", &Redirect::discard());

        assert_eq!(session.wait_for(&Interrupt::new()).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_local_signal_exit_code() {
        let mut session = spawn("kill -9 $$", &Redirect::discard());
        assert_eq!(session.wait_for(&Interrupt::new()).unwrap(), 137);
    }

    #[test]
    fn test_local_missing_program() {
        let result = LocalSession::spawn(
            &["/nonexistent/program".to_string()],
            &BTreeMap::new(),
            None,
            &Redirect::discard(),
            LOCAL_POLL_INTERVAL,
        );
        assert!(matches!(result, Err(ExecutionError::Io { .. })));
    }

    #[test]
    fn test_local_empty_command_line() {
        let result = LocalSession::spawn(&[], &BTreeMap::new(), None, &Redirect::discard(), LOCAL_POLL_INTERVAL);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_writer_splits_lines() {
        let mut writer = LogWriter::new("job".to_string(), false);
        writer.write_all(b"one\ntwo\nthr").unwrap();
        assert_eq!(writer.pending, b"thr");
    }

    #[test]
    fn test_interrupt_is_shared() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!clone.is_interrupted());
        interrupt.interrupt();
        interrupt.interrupt();
        assert!(clone.is_interrupted());
    }
}
