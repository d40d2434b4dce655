//! Secure-Shell Command Execution
//!
//! Runs a command on a remote host over SSH using public-key
//! authentication. A session walks through
//! `New → Authenticated → ChannelOpen → Running → Closed`.
//!
//! Host keys are not verified against a known-hosts file. Completion is
//! detected by polling the channel on a fixed interval while pumping its
//! output, with an upper bound on the total wait.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use ssh2::{Channel, ErrorCode, Session};

use crate::error::ExecutionError;
use crate::liveness::{LivenessCounter, LivenessKeeper};

use super::command::CommandExecutor;
use super::session::{Interrupt, Redirect, RemoteSession};
use super::shell::build_command_line;

const TARGET: &str = "batchcore::ssh";

/// Port used when a credential does not name one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// libssh2's "would block" code.
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Who to log in as, and where.
#[derive(Clone)]
pub struct RemoteCredential {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub private_key: PathBuf,
    pub pass_phrase: Option<String>,
}

impl RemoteCredential {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }
}

impl std::fmt::Debug for RemoteCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCredential")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("private_key", &self.private_key)
            .field("pass_phrase", &self.pass_phrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Transport timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshSettings {
    /// Upper bound for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Timeout applied to every blocking libssh2 call.
    pub idle_timeout: Duration,
    /// Sleep between channel checks while waiting.
    pub poll_interval: Duration,
    /// Upper bound for the whole wait; exceeding it is a failure.
    pub wait_timeout: Duration,
    /// Keep-alive interval; zero disables keep-alives unless a liveness keeper is attached.
    pub keep_alive_interval: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            wait_timeout: Duration::from_secs(12 * 60 * 60),
            keep_alive_interval: Duration::ZERO,
        }
    }
}

/// Lifecycle of an [`SshSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticated,
    ChannelOpen,
    Running,
    Closed,
}

/// One remote command over one SSH connection.
pub struct SshSession {
    user: String,
    host: String,
    port: u16,
    private_key: PathBuf,
    pass_phrase: Option<String>,
    settings: SshSettings,
    command: String,
    state: SessionState,
    session: Option<Session>,
    channel: Option<Channel>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    liveness: Option<Arc<LivenessKeeper>>,
    keep_alive_due: Arc<AtomicBool>,
}

impl SshSession {
    /// Creates a session in the `New` state. Nothing is connected yet.
    pub fn new(credential: &RemoteCredential, settings: SshSettings, command: impl Into<String>) -> Self {
        Self {
            user: credential.user.clone(),
            host: credential.host.clone(),
            port: credential.effective_port(),
            private_key: credential.private_key.clone(),
            pass_phrase: credential.pass_phrase.clone(),
            settings,
            command: command.into(),
            state: SessionState::New,
            session: None,
            channel: None,
            stdout: Box::new(io::sink()),
            stderr: Box::new(io::sink()),
            liveness: None,
            keep_alive_due: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends keep-alives whenever `keeper` bumps this session's counter.
    pub fn with_liveness(mut self, keeper: Arc<LivenessKeeper>) -> Self {
        self.liveness = Some(keeper);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transport(&self, stage: &'static str, message: impl Into<String>) -> ExecutionError {
        ExecutionError::Transport {
            stage,
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            command: self.command.clone(),
            message: message.into(),
        }
    }

    fn expect_state(&self, expected: SessionState, stage: &'static str) -> Result<(), ExecutionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.transport(
                stage,
                format!("session is {:?}, expected {:?}", self.state, expected),
            ))
        }
    }

    fn session(&self, stage: &'static str) -> Result<&Session, ExecutionError> {
        self.session
            .as_ref()
            .ok_or_else(|| self.transport(stage, "no session"))
    }

    fn channel_mut(&mut self, stage: &'static str) -> Result<&mut Channel, ExecutionError> {
        if self.channel.is_none() {
            return Err(self.transport(stage, "no channel"));
        }
        self.channel.as_mut().ok_or_else(|| {
            ExecutionError::io(stage, io::Error::new(io::ErrorKind::NotConnected, "no channel"))
        })
    }

    /// Connects, performs the handshake and authenticates with the private key.
    pub fn authenticate(&mut self) -> Result<(), ExecutionError> {
        self.expect_state(SessionState::New, "connect")?;

        let stream = self.connect_tcp()?;

        let mut session = Session::new().map_err(|e| self.transport("session", e.message()))?;
        session.set_tcp_stream(stream);
        session.set_timeout(millis_u32(self.settings.idle_timeout));
        session
            .handshake()
            .map_err(|e| self.transport("handshake", e.message()))?;

        let keep_alive = match (&self.liveness, self.settings.keep_alive_interval) {
            (_, interval) if !interval.is_zero() => interval.as_secs().max(1),
            (Some(keeper), _) => keeper.period().as_secs().max(1),
            (None, _) => 0,
        };
        if keep_alive > 0 {
            session.set_keepalive(false, u32::try_from(keep_alive).unwrap_or(u32::MAX));
        }

        session
            .userauth_pubkey_file(
                &self.user,
                None,
                &self.private_key,
                self.pass_phrase.as_deref(),
            )
            .map_err(|e| self.transport("authentication", e.message()))?;

        if !session.authenticated() {
            return Err(self.transport("authentication", "server rejected the key"));
        }

        debug!(target: TARGET, "Authenticated {}@{}:{}", self.user, self.host, self.port);
        self.session = Some(session);
        self.state = SessionState::Authenticated;
        Ok(())
    }

    fn connect_tcp(&self) -> Result<TcpStream, ExecutionError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.transport("connect", format!("cannot resolve host: {}", e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(target: TARGET, "Connection to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(self.transport(
            "connect",
            match last_error {
                Some(e) => e.to_string(),
                None => "host resolved to no addresses".to_string(),
            },
        ))
    }

    /// Opens the exec channel and binds its output streams.
    pub fn open_channel(&mut self, redirect: &Redirect) -> Result<(), ExecutionError> {
        self.expect_state(SessionState::Authenticated, "channel open")?;

        self.stdout = redirect.stdout.open(false);
        self.stderr = redirect.stderr.open(true);

        let channel = self
            .session("channel open")?
            .channel_session()
            .map_err(|e| self.transport("channel open", e.message()))?;

        self.channel = Some(channel);
        self.state = SessionState::ChannelOpen;
        Ok(())
    }

    /// Starts the command on the open channel.
    pub fn start(&mut self) -> Result<(), ExecutionError> {
        self.expect_state(SessionState::ChannelOpen, "exec")?;

        let command = self.command.clone();
        let result = self.channel_mut("exec")?.exec(&command);
        result.map_err(|e| self.transport("exec", e.message()))?;

        info!(target: TARGET, "Started on {}@{}: {}", self.user, self.host, self.command);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Copies whatever output is available without blocking.
    fn pump_output(&mut self) -> Result<(), ExecutionError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        let context = format!("reading output from {}", self.host);

        drain(channel, self.stdout.as_mut()).map_err(|e| ExecutionError::io(context.clone(), e))?;
        let mut stderr = channel.stderr();
        drain(&mut stderr, self.stderr.as_mut()).map_err(|e| ExecutionError::io(context, e))?;
        Ok(())
    }

    /// True once the remote side has sent EOF and closed the channel.
    fn poll_closed(&mut self) -> Result<bool, ExecutionError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(true);
        };
        if !channel.eof() {
            return Ok(false);
        }
        match channel.wait_close() {
            Ok(()) => Ok(true),
            Err(e) if would_block(&e) => Ok(false),
            Err(e) => Err(self.transport("wait", e.message())),
        }
    }

    fn send_keep_alive(&self) {
        if let Some(session) = &self.session {
            match session.keepalive_send() {
                Ok(_) => debug!(target: TARGET, "Sent keep-alive to {}", self.host),
                Err(e) if would_block(&e) => {}
                Err(e) => warn!(target: TARGET, "Keep-alive to {} failed: {}", self.host, e),
            }
        }
    }

    fn poll_until_closed(&mut self, interrupt: &Interrupt) -> Result<(), ExecutionError> {
        let started = Instant::now();
        let always_keep_alive = self.liveness.is_none() && !self.settings.keep_alive_interval.is_zero();

        loop {
            self.pump_output()?;
            if self.poll_closed()? {
                return Ok(());
            }
            if interrupt.is_interrupted() {
                return Err(ExecutionError::Interrupted {
                    command: self.command.clone(),
                });
            }
            let waited = started.elapsed();
            if waited >= self.settings.wait_timeout {
                return Err(ExecutionError::Timeout {
                    command: self.command.clone(),
                    waited,
                });
            }
            if always_keep_alive || self.keep_alive_due.swap(false, Ordering::SeqCst) {
                self.send_keep_alive();
            }
            thread::sleep(self.settings.poll_interval);
        }
    }
}

fn would_block(error: &ssh2::Error) -> bool {
    matches!(error.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn millis_u32(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn drain<R: Read + ?Sized>(source: &mut R, sink: &mut dyn Write) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => sink.write_all(&buf[..n])?,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

impl RemoteSession for SshSession {
    fn command(&self) -> &str {
        &self.command
    }

    fn input(&mut self) -> Option<&mut dyn Write> {
        if self.state != SessionState::Running {
            return None;
        }
        self.channel.as_mut().map(|channel| channel as &mut dyn Write)
    }

    fn close_input(&mut self) -> Result<(), ExecutionError> {
        if self.state != SessionState::Running {
            return Ok(());
        }
        let result = self.channel_mut("send eof")?.send_eof();
        result.map_err(|e| self.transport("send eof", e.message()))
    }

    fn wait_for(&mut self, interrupt: &Interrupt) -> Result<i32, ExecutionError> {
        self.expect_state(SessionState::Running, "wait")?;

        let keeper = self.liveness.clone();
        let due = Arc::clone(&self.keep_alive_due);
        let counter = LivenessCounter::with_callback(format!("ssh:{}", self.host), move |_| {
            due.store(true, Ordering::SeqCst);
        });
        let _guard = match keeper.as_deref().map(|k| k.keep_alive(&counter)) {
            Some(Ok(guard)) => Some(guard),
            Some(Err(e)) => {
                warn!(target: TARGET, "Waiting without keep-alive: {}", e);
                None
            }
            None => None,
        };

        self.session("wait")?.set_blocking(false);
        let polled = self.poll_until_closed(interrupt);
        if let Some(session) = &self.session {
            session.set_blocking(true);
        }

        if let Err(e) = polled {
            if e.is_interrupted() {
                info!(target: TARGET, "Interrupted, disconnecting from {}: {}", self.host, self.command);
            }
            self.close();
            return Err(e);
        }

        self.pump_output()?;
        let status = self.channel_mut("exit status")?.exit_status();
        let code = status.map_err(|e| self.transport("exit status", e.message()))?;

        debug!(target: TARGET, "Remote command exited with {}: {}", code, self.command);
        Ok(code)
    }

    fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(session) = &self.session {
            session.set_blocking(true);
        }

        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                warn!(target: TARGET, "Failed to close channel to {}: {}", self.host, e);
            }
        }

        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "batch job finished", None) {
                warn!(target: TARGET, "Failed to disconnect from {}: {}", self.host, e);
            }
        }

        let _ = self.stdout.flush();
        let _ = self.stderr.flush();
        self.state = SessionState::Closed;
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs commands on one remote host.
#[derive(Debug, Clone)]
pub struct SshCommandExecutor {
    credential: RemoteCredential,
    settings: SshSettings,
    liveness: Option<Arc<LivenessKeeper>>,
}

impl SshCommandExecutor {
    pub fn new(credential: RemoteCredential, settings: SshSettings) -> Self {
        Self {
            credential,
            settings,
            liveness: None,
        }
    }

    /// Builds an executor from a parsed `ssh.*` profile section.
    pub fn from_config(config: crate::config::SshConfig) -> Self {
        Self::new(config.credential, config.settings)
    }

    /// Sends keep-alives on every tick of `keeper` while waiting.
    pub fn with_liveness(mut self, keeper: Arc<LivenessKeeper>) -> Self {
        self.liveness = Some(keeper);
        self
    }

    pub fn credential(&self) -> &RemoteCredential {
        &self.credential
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }
}

impl CommandExecutor for SshCommandExecutor {
    fn launch(
        &self,
        command_line: &[String],
        environment: &BTreeMap<String, String>,
        redirect: &Redirect,
    ) -> Result<Box<dyn RemoteSession>, ExecutionError> {
        let line = build_command_line(command_line, environment);
        debug!(
            target: TARGET,
            "Launching on {}@{}:{}: {}",
            self.credential.user,
            self.credential.host,
            self.credential.effective_port(),
            line
        );

        let mut session = SshSession::new(&self.credential, self.settings, line);
        if let Some(keeper) = &self.liveness {
            session = session.with_liveness(Arc::clone(keeper));
        }

        session.authenticate()?;
        session.open_channel(redirect)?;
        session.start()?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn credential(port: u16) -> RemoteCredential {
        RemoteCredential {
            user: "batch".to_string(),
            host: "127.0.0.1".to_string(),
            port: Some(port),
            private_key: PathBuf::from("/nonexistent/id_rsa"),
            pass_phrase: Some("hunter2".to_string()),
        }
    }

    fn fast_settings() -> SshSettings {
        SshSettings {
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            wait_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::ZERO,
        }
    }

    /// A port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_default_settings() {
        let settings = SshSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert!(settings.wait_timeout > settings.idle_timeout);
        assert!(settings.keep_alive_interval.is_zero());
    }

    #[test]
    fn test_credential_debug_redacts_pass_phrase() {
        let text = format!("{:?}", credential(22));
        assert!(text.contains("batch"));
        assert!(!text.contains("hunter2"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn test_effective_port() {
        let mut cred = credential(2222);
        assert_eq!(cred.effective_port(), 2222);
        cred.port = None;
        assert_eq!(cred.effective_port(), DEFAULT_SSH_PORT);
    }

    #[test]
    fn test_new_session_state() {
        let session = SshSession::new(&credential(22), fast_settings(), "\"true\"");
        assert_eq!(session.state(), SessionState::New);
        assert_eq!(session.command(), "\"true\"");
    }

    #[test]
    fn test_out_of_order_transitions_fail() {
        let mut session = SshSession::new(&credential(22), fast_settings(), "\"true\"");

        assert!(matches!(session.start(), Err(ExecutionError::Transport { stage: "exec", .. })));
        assert!(session.open_channel(&Redirect::discard()).is_err());
        assert!(session.wait_for(&Interrupt::new()).is_err());
        assert!(session.input().is_none());
        assert!(session.close_input().is_ok());
        assert_eq!(session.state(), SessionState::New);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = SshSession::new(&credential(22), fast_settings(), "\"true\"");
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.authenticate().is_err());
    }

    #[test]
    fn test_unreachable_port_is_transport_error() {
        let port = closed_port();
        let executor = SshCommandExecutor::new(credential(port), fast_settings());

        let started = Instant::now();
        let err = executor
            .execute(&["echo".to_string(), "hi".to_string()], &BTreeMap::new())
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match &err {
            ExecutionError::Transport { stage, host, port: p, user, .. } => {
                assert_eq!(*stage, "connect");
                assert_eq!(host, "127.0.0.1");
                assert_eq!(*p, port);
                assert_eq!(user, "batch");
            }
            other => panic!("unexpected error: {}", other),
        }

        let text = err.to_string();
        assert!(text.contains(&port.to_string()));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_non_ssh_peer_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            }
        });

        let mut session = SshSession::new(&credential(port), fast_settings(), "\"true\"");
        let err = session.authenticate().unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, ExecutionError::Transport { stage: "handshake", .. }));
        assert_eq!(session.state(), SessionState::New);
    }

    #[test]
    fn test_unknown_host_is_transport_error() {
        let mut cred = credential(22);
        cred.host = "no-such-host.invalid".to_string();

        let mut session = SshSession::new(&cred, fast_settings(), "\"true\"");
        let err = session.authenticate().unwrap_err();
        assert!(matches!(err, ExecutionError::Transport { stage: "connect", .. }));
    }

    #[test]
    fn test_drain_stops_on_would_block() {
        struct Blocking(bool);
        impl Read for Blocking {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "later"))
                } else {
                    self.0 = true;
                    buf[..3].copy_from_slice(b"abc");
                    Ok(3)
                }
            }
        }

        let mut out = Vec::new();
        drain(&mut Blocking(false), &mut out).unwrap();
        assert_eq!(out, b"abc");
    }
}
