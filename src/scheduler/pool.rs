//! Resource-Scoped Worker Pools
//!
//! One fixed-size [`WorkerPool`] per configured resource name, plus the
//! mandatory `default` pool. The registry is built once and never changes,
//! so it can be shared across threads without locking.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::config::{ParallelConfig, DEFAULT_POOL};
use crate::error::{ConfigError, ExecutionError};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of threads draining one task queue.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` worker threads named `<name>-worker-<n>`.
    pub fn new(name: impl Into<String>, size: usize) -> io::Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pool '{}' needs at least one worker", name),
            ));
        }

        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = Arc::clone(&rx);
            let thread_name = format!("{}-worker-{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || loop {
                    let next = {
                        let queue = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        queue.recv()
                    };
                    match next {
                        Ok(task) => {
                            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!(target: "batchcore::pool", "Task panicked on {}", thread_name);
                            }
                        }
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }

        debug!(target: "batchcore::pool", "Started pool '{}' with {} worker(s)", name, size);

        Ok(Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of tasks running at once.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a task. Never blocks.
    pub fn execute<F>(&self, task: F) -> Result<(), ExecutionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(ExecutionError::Dispatch {
                resource: self.name.clone(),
                message: "pool is shut down".to_string(),
            });
        };

        sender.send(Box::new(task)).map_err(|_| ExecutionError::Dispatch {
            resource: self.name.clone(),
            message: "all workers have exited".to_string(),
        })
    }

    /// Stops accepting tasks, lets queued ones finish and joins the workers.
    pub fn shutdown(&mut self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(target: "batchcore::pool", "Worker of pool '{}' panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

/// Registry of worker pools keyed by resource name.
#[derive(Debug)]
pub struct ResourcePools {
    default: WorkerPool,
    named: HashMap<String, WorkerPool>,
}

impl ResourcePools {
    /// Starts one pool per configured resource.
    pub fn from_config(config: &ParallelConfig) -> Result<Self, ConfigError> {
        let spawn = |resource: &str, size: usize| {
            WorkerPool::new(resource, size).map_err(|source| ConfigError::PoolSpawn {
                resource: resource.to_string(),
                source,
            })
        };

        let default = spawn(DEFAULT_POOL, config.default_concurrency())?;
        let mut named = HashMap::new();
        for (resource, size) in config.iter() {
            if resource == DEFAULT_POOL {
                continue;
            }
            named.insert(resource.to_string(), spawn(resource, size)?);
        }

        info!(
            target: "batchcore::pool",
            "Configured {} resource pool(s): {}",
            named.len() + 1,
            config
                .iter()
                .map(|(name, size)| format!("{}={}", name, size))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self { default, named })
    }

    /// Looks up a pool by exact name.
    pub fn get(&self, resource: &str) -> Option<&WorkerPool> {
        if resource == DEFAULT_POOL {
            return Some(&self.default);
        }
        self.named.get(resource)
    }

    pub fn default_pool(&self) -> &WorkerPool {
        &self.default
    }

    /// Number of pools, including `default`.
    pub fn len(&self) -> usize {
        self.named.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}
