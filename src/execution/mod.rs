//! Command Execution Module
//!
//! Runs job command lines either as local processes or on a remote host
//! over SSH, behind one [`CommandExecutor`] interface.
//!
//! # Architecture
//!
//! - [`command`]: [`CommandExecutor`] trait and the local implementation
//! - [`session`]: [`RemoteSession`] trait, interrupts and output redirection
//! - [`ssh`]: secure-shell session state machine and executor
//! - [`shell`]: quoting rules for remote shell command lines

pub mod command;
pub mod session;
pub mod shell;
pub mod ssh;

pub use command::{CommandExecutor, ProcessCommandExecutor};
pub use session::{Interrupt, LocalSession, OutputSink, Redirect, RemoteSession};
pub use ssh::{RemoteCredential, SessionState, SshCommandExecutor, SshSession, SshSettings};
