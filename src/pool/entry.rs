//! Pool entries: per-key coordination state
//!
//! A [`PoolEntry`] is the single mutual-exclusion domain for one [`PoolKey`]:
//! every state transition happens under its async mutex, and waiters park on
//! its [`Notify`]. Reference counts and idle bookkeeping use atomics and a
//! short-lived `parking_lot` lock so lease release stays synchronous (it runs
//! in `Drop`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::backend::Backend;
use crate::config::{ServerConfig, ServerMode};
use crate::error::{Error, Result};
use crate::server::ManagedServer;

/// Identity of a shareable server process.
///
/// Configurations that agree on these four fields share one process;
/// anything else (batch sizes, timeouts) may differ between leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub model_path: PathBuf,
    pub backend: Backend,
    pub context_size: u32,
    pub mode: ServerMode,
}

impl PoolKey {
    pub fn from_config(config: &ServerConfig, backend: Backend) -> Self {
        Self {
            model_path: config.model_path.clone(),
            backend,
            context_size: config.context_size,
            mode: config.mode,
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.model_path.display(),
            self.backend,
            self.context_size,
            self.mode
        )
    }
}

/// A health-checked server plus the shared crash signal its leases observe.
pub(crate) struct RunningServer {
    server: Box<dyn ManagedServer>,
    backend: Backend,
    shutdown_timeout: Duration,
    crashed: watch::Sender<Option<Error>>,
}

impl RunningServer {
    pub(crate) fn new(
        server: Box<dyn ManagedServer>,
        backend: Backend,
        shutdown_timeout: Duration,
    ) -> Self {
        let (crashed, _) = watch::channel(None);
        Self {
            server,
            backend,
            shutdown_timeout,
            crashed,
        }
    }

    pub(crate) fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn base_url(&self) -> &str {
        self.server.base_url()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.crash_error().is_none() && self.server.is_alive()
    }

    pub(crate) fn crash_error(&self) -> Option<Error> {
        self.crashed.borrow().clone()
    }

    /// Fail every lease bound to this server with `error`.
    pub(crate) fn mark_crashed(&self, error: Error) {
        self.crashed.send_replace(Some(error));
    }

    pub(crate) fn watch_exit(&self) -> watch::Receiver<Option<i32>> {
        self.server.watch_exit()
    }

    pub(crate) async fn probe_health(&self) -> bool {
        self.server.probe_health().await
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        self.server.stop(self.shutdown_timeout).await
    }
}

/// Lifecycle of one pool entry
pub(crate) enum EntryState {
    /// No process and no creation in flight
    Idle,
    /// A creation task is running; waiters park on the entry's notify
    Creating { attempt: u64 },
    /// A health-checked server is available
    Ready(std::sync::Arc<RunningServer>),
    /// Creation attempt `attempt` failed; its waiters take the error,
    /// the next fresh caller restarts
    Failed { error: Error, attempt: u64 },
    /// Entry was removed from the map; callers must re-fetch
    Stopped,
}

impl EntryState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Creating { .. } => "creating",
            Self::Ready(_) => "ready",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordination state for one pool key
pub(crate) struct PoolEntry {
    pub(crate) key: PoolKey,
    pub(crate) state: tokio::sync::Mutex<EntryState>,
    pub(crate) notify: Notify,
    refs: AtomicUsize,
    attempt: AtomicU64,
    idle_since: Mutex<Option<Instant>>,
    last_health: Mutex<Instant>,
    health_failures: AtomicU32,
}

impl PoolEntry {
    pub(crate) fn new(key: PoolKey) -> Self {
        Self {
            key,
            state: tokio::sync::Mutex::new(EntryState::Idle),
            notify: Notify::new(),
            refs: AtomicUsize::new(0),
            attempt: AtomicU64::new(0),
            idle_since: Mutex::new(None),
            last_health: Mutex::new(Instant::now()),
            health_failures: AtomicU32::new(0),
        }
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Take a reference; cancels any running idle clock.
    ///
    /// Callers hold the state lock, which is what serializes this against
    /// the eviction sweep's zero-reference check.
    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
        *self.idle_since.lock() = None;
    }

    /// Drop a reference; the last one out starts the idle clock.
    pub(crate) fn release(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "pool entry reference count underflow");
        if previous == 1 {
            *self.idle_since.lock() = Some(Instant::now());
        }
    }

    pub(crate) fn next_attempt(&self) -> u64 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start the idle clock; used when a server comes up with no waiters left.
    pub(crate) fn mark_idle(&self) {
        *self.idle_since.lock() = Some(Instant::now());
    }

    pub(crate) fn idle_since(&self) -> Option<Instant> {
        *self.idle_since.lock()
    }

    /// Whether a health probe is due, advancing the schedule if so.
    pub(crate) fn health_due(&self, now: Instant, interval: Duration) -> bool {
        let mut last = self.last_health.lock();
        if now.duration_since(*last) >= interval {
            *last = now;
            true
        } else {
            false
        }
    }

    pub(crate) fn record_health_failure(&self) -> u32 {
        self.health_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_health_failures(&self) {
        self.health_failures.store(0, Ordering::SeqCst);
    }
}
