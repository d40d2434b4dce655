//! Liveness Keeper
//!
//! A single background ticker that bumps every registered
//! [`LivenessCounter`] once per period. Long, silent operations register a
//! counter for their duration so whatever watches the counter keeps seeing
//! progress.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::LivenessError;

const TARGET: &str = "batchcore::liveness";

/// A "still working" signal.
pub struct LivenessCounter {
    name: String,
    count: AtomicU64,
    on_bump: Box<dyn Fn(u64) + Send + Sync>,
}

impl LivenessCounter {
    /// Creates a counter with no callback.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_callback(name, |_| {})
    }

    /// Creates a counter that calls `on_bump` with the new count on every bump.
    pub fn with_callback<F>(name: impl Into<String>, on_bump: F) -> Arc<Self>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            count: AtomicU64::new(0),
            on_bump: Box::new(on_bump),
        })
    }

    /// Increments the counter and runs the callback. Returns the new count.
    pub fn bump(&self) -> u64 {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        (self.on_bump)(count);
        count
    }

    /// Number of bumps so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LivenessCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessCounter")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

/// Identity of a registered counter.
fn key_of(counter: &Arc<LivenessCounter>) -> usize {
    Arc::as_ptr(counter) as usize
}

#[derive(Default)]
struct Registry {
    counters: HashMap<usize, Arc<LivenessCounter>>,
    closed: bool,
}

/// Periodically bumps every registered counter.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use batchcore::liveness::{LivenessCounter, LivenessKeeper};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let keeper = LivenessKeeper::start(Duration::from_secs(10))?;
///     let counter = LivenessCounter::new("bulk-load");
///     {
///         let _guard = keeper.keep_alive(&counter)?;
///         // long, silent work
///     }
///     keeper.close();
///     Ok(())
/// }
/// ```
pub struct LivenessKeeper {
    period: Duration,
    registry: Arc<Mutex<Registry>>,
    shutdown: Mutex<Option<Sender<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessKeeper {
    /// Starts the ticker thread.
    pub fn start(period: Duration) -> Result<Self, LivenessError> {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (tx, rx) = mpsc::channel::<()>();

        let shared = Arc::clone(&registry);
        let handle = thread::Builder::new()
            .name("liveness-keeper".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => tick(&shared),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        debug!(target: TARGET, "Liveness keeper started (period: {:?})", period);

        Ok(Self {
            period,
            registry,
            shutdown: Mutex::new(Some(tx)),
            ticker: Mutex::new(Some(handle)),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Registers a counter.
    ///
    /// Returns `Ok(false)` if it was already registered. Fails once the keeper
    /// is closed.
    pub fn register(&self, counter: &Arc<LivenessCounter>) -> Result<bool, LivenessError> {
        let mut registry = lock(&*self.registry);
        if registry.closed {
            return Err(LivenessError::Closed);
        }
        let added = registry
            .counters
            .insert(key_of(counter), Arc::clone(counter))
            .is_none();
        if added {
            trace!(target: TARGET, "Registered liveness counter: {}", counter.name());
        }
        Ok(added)
    }

    /// Unregisters a counter. Returns false if it was not registered.
    pub fn unregister(&self, counter: &Arc<LivenessCounter>) -> bool {
        let removed = lock(&*self.registry)
            .counters
            .remove(&key_of(counter))
            .is_some();
        if removed {
            trace!(target: TARGET, "Unregistered liveness counter: {}", counter.name());
        }
        removed
    }

    /// Registers `counter` until the returned guard is dropped.
    pub fn keep_alive<'a>(
        &'a self,
        counter: &Arc<LivenessCounter>,
    ) -> Result<LivenessGuard<'a>, LivenessError> {
        let owned = self.register(counter)?;
        Ok(LivenessGuard {
            keeper: self,
            counter: Arc::clone(counter),
            owned,
        })
    }

    pub fn is_registered(&self, counter: &Arc<LivenessCounter>) -> bool {
        lock(&*self.registry).counters.contains_key(&key_of(counter))
    }

    /// Number of currently registered counters.
    pub fn registered(&self) -> usize {
        lock(&*self.registry).counters.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&*self.registry).closed
    }

    /// Stops the ticker and drops all registrations. Idempotent.
    pub fn close(&self) {
        {
            let mut registry = lock(&*self.registry);
            if registry.closed {
                return;
            }
            registry.closed = true;
            registry.counters.clear();
        }

        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }

        if let Some(handle) = lock(&self.ticker).take() {
            if handle.thread().id() == thread::current().id() {
                // Closed from inside a bump callback; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                warn!(target: TARGET, "Liveness ticker thread panicked");
            }
        }

        debug!(target: TARGET, "Liveness keeper closed");
    }
}

impl Drop for LivenessKeeper {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LivenessKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessKeeper")
            .field("period", &self.period)
            .field("registered", &self.registered())
            .finish()
    }
}

/// Keeps a counter registered while alive.
pub struct LivenessGuard<'a> {
    keeper: &'a LivenessKeeper,
    counter: Arc<LivenessCounter>,
    owned: bool,
}

impl LivenessGuard<'_> {
    pub fn counter(&self) -> &Arc<LivenessCounter> {
        &self.counter
    }
}

impl Drop for LivenessGuard<'_> {
    fn drop(&mut self) {
        // A guard for an already-registered counter leaves the outer registration alone.
        if self.owned {
            self.keeper.unregister(&self.counter);
        }
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bumps a snapshot of the registered counters outside the lock.
fn tick(registry: &Mutex<Registry>) {
    let snapshot: Vec<Arc<LivenessCounter>> = lock(registry).counters.values().cloned().collect();

    for counter in snapshot {
        if panic::catch_unwind(AssertUnwindSafe(|| counter.bump())).is_err() {
            warn!(target: TARGET, "Liveness callback panicked for counter: {}", counter.name());
        }
    }
}
