//! Execution Profiles
//!
//! Loads a YAML profile and extracts the two typed views the core consumes:
//!
//! - [`ParallelConfig`]: `parallel.<resource>` concurrency limits
//! - [`SshConfig`]: `ssh.*` credential and timing settings
//!
//! # Example YAML Format
//!
//! ```yaml
//! parallel:
//!   default: 4
//!   hadoop: 2
//! ssh:
//!   user: batch
//!   host: ${BATCH_HOST}
//!   privateKey: ${HOME}/.ssh/id_rsa
//! ```
//!
//! Nested mappings are flattened into dotted keys, so the profile above is
//! equivalent to writing `parallel.default: 4` at the top level.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde_yaml::Value;

use crate::error::ConfigError;
use crate::execution::ssh::{RemoteCredential, SshSettings};

use super::variables;

/// Prefix of concurrency keys.
pub const PARALLEL_PREFIX: &str = "parallel.";

/// Name of the mandatory fallback pool.
pub const DEFAULT_POOL: &str = "default";

pub const KEY_SSH_USER: &str = "ssh.user";
pub const KEY_SSH_HOST: &str = "ssh.host";
pub const KEY_SSH_PORT: &str = "ssh.port";
pub const KEY_SSH_PRIVATE_KEY: &str = "ssh.privateKey";
pub const KEY_SSH_PASS_PHRASE: &str = "ssh.passPhrase";
pub const KEY_SSH_CONNECT_TIMEOUT: &str = "ssh.connectTimeout";
pub const KEY_SSH_IDLE_TIMEOUT: &str = "ssh.idleTimeout";
pub const KEY_SSH_POLL_INTERVAL: &str = "ssh.pollInterval";
pub const KEY_SSH_WAIT_TIMEOUT: &str = "ssh.waitTimeout";
pub const KEY_SSH_KEEP_ALIVE: &str = "ssh.keepAlive";

/// Flat, string-valued view of a profile file.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    source: String,
    values: BTreeMap<String, String>,
    variables: HashMap<String, String>,
    use_environment: bool,
}

impl Profile {
    /// Creates a profile from already-flattened key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            source: "<memory>".to_string(),
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            variables: HashMap::new(),
            use_environment: true,
        }
    }

    /// Loads a profile from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;

        Self::from_yaml_str(&content, &display)
    }

    /// Parses a profile from YAML text. `source` names the origin in errors.
    pub fn from_yaml_str(content: &str, source: &str) -> Result<Self, ConfigError> {
        let root: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: source.to_string(),
            message: e.to_string(),
        })?;

        let mut values = BTreeMap::new();
        match root {
            Value::Null => {}
            Value::Mapping(_) => flatten(source, "", &root, &mut values)?,
            _ => {
                return Err(ConfigError::Parse {
                    path: source.to_string(),
                    message: "profile root must be a mapping".to_string(),
                })
            }
        }

        debug!(target: "batchcore::config", "Loaded {} profile keys from {}", values.len(), source);

        Ok(Self {
            source: source.to_string(),
            values,
            variables: HashMap::new(),
            use_environment: true,
        })
    }

    /// Adds variables consulted before the process environment.
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Stops falling back to the process environment for `${...}` lookups.
    pub fn without_environment(mut self) -> Self {
        self.use_environment = false;
        self
    }

    /// Where this profile came from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the raw, unresolved value of a key.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the resolved value of a key, or `None` if the key is absent.
    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.values.get(key) {
            Some(raw) => variables::resolve(key, raw, |name| self.lookup(name)).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the resolved value of a mandatory key.
    ///
    /// A key that is present but resolves to blank counts as missing.
    pub fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)?
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingKey {
                key: key.to_string(),
            })
    }

    /// Iterates over keys that start with `prefix`.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.values
            .keys()
            .filter(move |key| key.starts_with(prefix))
            .map(String::as_str)
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        if self.use_environment {
            return std::env::var(name).ok();
        }
        None
    }
}

/// Flattens nested YAML mappings into dotted keys.
fn flatten(
    source: &str,
    prefix: &str,
    value: &Value,
    out: &mut BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let name = scalar_to_string(key).ok_or_else(|| ConfigError::Parse {
                    path: source.to_string(),
                    message: format!("unsupported key under '{}'", prefix),
                })?;
                let full = if prefix.is_empty() {
                    name
                } else {
                    format!("{}.{}", prefix, name)
                };
                flatten(source, &full, child, out)?;
            }
            Ok(())
        }
        other => {
            let text = scalar_to_string(other).ok_or_else(|| ConfigError::InvalidValue {
                key: prefix.to_string(),
                value: format!("{:?}", other),
                reason: "expected a scalar value".to_string(),
            })?;
            out.insert(prefix.to_string(), text);
            Ok(())
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Concurrency limit per resource, including the mandatory `default` pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelConfig {
    limits: BTreeMap<String, usize>,
}

impl ParallelConfig {
    /// Validates a `{resource → concurrency}` map.
    pub fn new(limits: BTreeMap<String, usize>) -> Result<Self, ConfigError> {
        for (resource, limit) in &limits {
            if *limit == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}{}", PARALLEL_PREFIX, resource),
                    value: "0".to_string(),
                    reason: "concurrency must be a positive integer".to_string(),
                });
            }
        }
        if !limits.contains_key(DEFAULT_POOL) {
            return Err(ConfigError::MissingDefaultPool);
        }
        Ok(Self { limits })
    }

    /// Collects every `parallel.<resource>` key of a profile.
    pub fn from_profile(profile: &Profile) -> Result<Self, ConfigError> {
        let mut limits = BTreeMap::new();

        for key in profile.keys_with_prefix(PARALLEL_PREFIX) {
            let resource = &key[PARALLEL_PREFIX.len()..];
            if resource.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: String::new(),
                    reason: "resource name is empty".to_string(),
                });
            }

            let value = profile.require(key)?;
            let limit = parse_positive(key, &value)?;
            limits.insert(resource.to_string(), limit);
        }

        Self::new(limits)
    }

    /// Concurrency of the `default` pool.
    pub fn default_concurrency(&self) -> usize {
        self.limits.get(DEFAULT_POOL).copied().unwrap_or(1)
    }

    /// Concurrency configured for a resource.
    pub fn get(&self, resource: &str) -> Option<usize> {
        self.limits.get(resource).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.limits.iter().map(|(name, limit)| (name.as_str(), *limit))
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "concurrency must be a positive integer".to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, what: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: format!("expected {}", what),
    })
}

/// Secure-shell credential plus transport timing.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub credential: RemoteCredential,
    pub settings: SshSettings,
}

impl SshConfig {
    /// Reads `ssh.*` keys from a profile.
    ///
    /// `ssh.user`, `ssh.host` and `ssh.privateKey` are mandatory; a missing
    /// one is reported by name.
    pub fn from_profile(profile: &Profile) -> Result<Self, ConfigError> {
        let user = profile.require(KEY_SSH_USER)?;
        let host = profile.require(KEY_SSH_HOST)?;
        let private_key = PathBuf::from(profile.require(KEY_SSH_PRIVATE_KEY)?);

        let port = match profile.get(KEY_SSH_PORT)? {
            Some(value) if !value.trim().is_empty() => {
                Some(parse_number::<u16>(KEY_SSH_PORT, &value, "a TCP port")?)
            }
            _ => None,
        };

        let pass_phrase = profile
            .get(KEY_SSH_PASS_PHRASE)?
            .filter(|value| !value.is_empty());

        let mut settings = SshSettings::default();
        if let Some(value) = profile.get(KEY_SSH_CONNECT_TIMEOUT)? {
            settings.connect_timeout =
                Duration::from_secs(parse_number(KEY_SSH_CONNECT_TIMEOUT, &value, "seconds")?);
        }
        if let Some(value) = profile.get(KEY_SSH_IDLE_TIMEOUT)? {
            settings.idle_timeout =
                Duration::from_secs(parse_number(KEY_SSH_IDLE_TIMEOUT, &value, "seconds")?);
        }
        if let Some(value) = profile.get(KEY_SSH_POLL_INTERVAL)? {
            let millis: u64 = parse_number(KEY_SSH_POLL_INTERVAL, &value, "milliseconds")?;
            if millis == 0 {
                return Err(ConfigError::InvalidValue {
                    key: KEY_SSH_POLL_INTERVAL.to_string(),
                    value,
                    reason: "poll interval must be positive".to_string(),
                });
            }
            settings.poll_interval = Duration::from_millis(millis);
        }
        if let Some(value) = profile.get(KEY_SSH_WAIT_TIMEOUT)? {
            settings.wait_timeout =
                Duration::from_secs(parse_number(KEY_SSH_WAIT_TIMEOUT, &value, "seconds")?);
        }
        if let Some(value) = profile.get(KEY_SSH_KEEP_ALIVE)? {
            settings.keep_alive_interval =
                Duration::from_secs(parse_number(KEY_SSH_KEEP_ALIVE, &value, "seconds")?);
        }

        Ok(Self {
            credential: RemoteCredential {
                user,
                host,
                port,
                private_key,
                pass_phrase,
            },
            settings,
        })
    }
}
