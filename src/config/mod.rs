//! Configuration Module
//!
//! Turns profile files into the typed maps the scheduler and the SSH
//! executor are constructed from.
//!
//! - [`profile`]: YAML profile loading, `parallel.*` and `ssh.*` views
//! - [`variables`]: `${NAME}` placeholder resolution

pub mod profile;
pub mod variables;

pub use profile::{ParallelConfig, Profile, SshConfig, DEFAULT_POOL};
