//! Server pool and lease management
//!
//! The pool maps a [`PoolKey`] to at most one live server process and hands
//! out reference-counted [`Lease`]s. Callers racing on the same key coalesce
//! onto a single in-flight creation; creation runs on a detached task, so a
//! cancelled waiter never aborts provisioning for the others. A maintenance
//! task evicts servers that have sat at zero references past the idle window
//! and health-probes ready servers, replacing those that exhaust the retry
//! budget.
//!
//! The pool is an explicit object: construct one at application start and
//! pass it by reference wherever leases are needed. There is deliberately no
//! process-wide singleton.

mod entry;
mod lease;

pub use entry::PoolKey;
pub use lease::Lease;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backend::{resolve_backends, Backend};
use crate::client::LlamaClient;
use crate::config::{ServerConfig, Settings};
use crate::error::{BackendAttempt, Error, Result};
use crate::hardware::HardwareProfile;
use crate::provision::Provisioner;
use crate::server::{LlamaLauncher, ServerLauncher};
use entry::{EntryState, PoolEntry, RunningServer};

/// Snapshot of one pool entry for observability
#[derive(Debug, Clone)]
pub struct EntryStats {
    pub key: String,
    /// Backend the running server started on, when one is up
    pub backend: Option<Backend>,
    pub state: &'static str,
    pub refs: usize,
    pub idle_for: Option<Duration>,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub entries: Vec<EntryStats>,
}

/// Pool of inference server processes, keyed by [`PoolKey`]
#[derive(Clone)]
pub struct ServerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    launcher: Arc<dyn ServerLauncher>,
    profile: HardwareProfile,
    settings: Settings,
    entries: Mutex<HashMap<PoolKey, Arc<PoolEntry>>>,
    shutdown: watch::Sender<bool>,
}

impl ServerPool {
    /// Pool backed by the production llama.cpp launcher.
    ///
    /// Must be called within a tokio runtime; the maintenance task starts
    /// immediately.
    pub fn new(settings: Settings) -> Result<Self> {
        let profile = HardwareProfile::detect();
        let provisioner = Arc::new(Provisioner::new(settings.provision.clone())?);
        let launcher = Arc::new(LlamaLauncher::new(provisioner, profile.clone()));
        Ok(Self::with_launcher(launcher, settings, profile))
    }

    /// Pool with an injected launcher; the seam tests use.
    pub fn with_launcher(
        launcher: Arc<dyn ServerLauncher>,
        settings: Settings,
        profile: HardwareProfile,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            launcher,
            profile,
            settings,
            entries: Mutex::new(HashMap::new()),
            shutdown,
        });

        let sweep_interval = inner.settings.pool.sweep_interval();
        tokio::spawn(run_maintenance(Arc::downgrade(&inner), sweep_interval));

        Self { inner }
    }

    /// Acquire a lease on a server matching `config`.
    ///
    /// Reuses a ready server for the same pool key when one exists;
    /// otherwise resolves the backend chain, provisions, starts and
    /// health-checks a process, falling back along the chain on
    /// provisioning failures.
    #[instrument(name = "pool.lease", skip(self, config), fields(
        model = %config.model_path.display(),
        mode = %config.mode,
    ))]
    pub async fn lease(&self, config: &ServerConfig) -> Result<Lease> {
        let inner = &self.inner;
        let candidates = resolve_backends(&inner.profile, config.backend);
        let key = PoolKey::from_config(config, candidates[0]);

        'entry: loop {
            if *inner.shutdown.borrow() {
                return Err(Error::PoolShutdown);
            }

            let entry = inner.get_or_insert_entry(&key);

            // Decide whether to join an in-flight creation or start one.
            let joined_attempt;
            {
                let mut state = entry.state.lock().await;
                match &*state {
                    EntryState::Ready(server) if server.is_alive() => {
                        entry.acquire();
                        return Ok(self.grant(&entry, server.clone(), config));
                    }
                    EntryState::Stopped => {
                        inner.remove_entry(&entry);
                        continue 'entry;
                    }
                    EntryState::Creating { attempt } => {
                        joined_attempt = *attempt;
                    }
                    // Idle, a stale failure, or a dead server: start fresh.
                    EntryState::Idle | EntryState::Failed { .. } | EntryState::Ready(_) => {
                        if let EntryState::Ready(server) = &*state {
                            // Exit watcher has not caught up yet; fail the
                            // old leases before replacing the server.
                            server.mark_crashed(Error::ProcessCrashed {
                                key: key.to_string(),
                                reason: "process found dead on lease".to_string(),
                            });
                        }
                        let attempt = entry.next_attempt();
                        *state = EntryState::Creating { attempt };
                        joined_attempt = attempt;
                        debug!(key = %key, attempt, "starting server creation");
                        spawn_creation(
                            Arc::downgrade(inner),
                            entry.clone(),
                            config.clone(),
                            candidates.clone(),
                            attempt,
                        );
                    }
                }
            }

            // Wait for that attempt to conclude. Dropping this future leaves
            // the creation task running for the remaining waiters.
            loop {
                let mut notified = std::pin::pin!(entry.notify.notified());
                notified.as_mut().enable();
                {
                    let state = entry.state.lock().await;
                    match &*state {
                        EntryState::Ready(server) if server.is_alive() => {
                            entry.acquire();
                            return Ok(self.grant(&entry, server.clone(), config));
                        }
                        EntryState::Failed { error, attempt } if *attempt >= joined_attempt => {
                            return Err(error.clone());
                        }
                        EntryState::Stopped => {
                            inner.remove_entry(&entry);
                            continue 'entry;
                        }
                        _ => {}
                    }
                }
                notified.await;
            }
        }
    }

    fn grant(
        &self,
        entry: &Arc<PoolEntry>,
        server: Arc<RunningServer>,
        config: &ServerConfig,
    ) -> Lease {
        let client = LlamaClient::for_mode(server.base_url(), config.mode);
        Lease::new(entry.clone(), server, client)
    }

    /// The hardware profile this pool resolves backends against.
    pub fn profile(&self) -> &HardwareProfile {
        &self.inner.profile
    }

    /// Observability snapshot of every entry.
    pub async fn stats(&self) -> PoolStats {
        let entries: Vec<Arc<PoolEntry>> =
            self.inner.entries.lock().values().cloned().collect();
        let now = Instant::now();

        let mut stats = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.lock().await;
            let backend = match &*state {
                EntryState::Ready(server) => Some(server.backend()),
                _ => None,
            };
            stats.push(EntryStats {
                key: entry.key.to_string(),
                backend,
                state: state.name(),
                refs: entry.refs(),
                idle_for: entry.idle_since().map(|since| now.duration_since(since)),
            });
        }
        PoolStats { entries: stats }
    }

    /// Stop every server and refuse further leases.
    ///
    /// Outstanding leases observe [`Error::PoolShutdown`] on their next use.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down server pool");

        let entries: Vec<Arc<PoolEntry>> = {
            let mut map = self.inner.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            let mut state = entry.state.lock().await;
            let previous = std::mem::replace(&mut *state, EntryState::Stopped);
            drop(state);
            entry.notify.notify_waiters();

            if let EntryState::Ready(server) = previous {
                server.mark_crashed(Error::PoolShutdown);
                if let Err(e) = server.stop().await {
                    warn!(key = %entry.key, error = %e, "failed to stop server during shutdown");
                }
            }
        }
    }
}

impl PoolInner {
    fn get_or_insert_entry(&self, key: &PoolKey) -> Arc<PoolEntry> {
        let mut entries = self.entries.lock();
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PoolEntry::new(key.clone())))
            .clone()
    }

    /// Remove an entry, but only the exact instance we decided to retire;
    /// a successor under the same key stays untouched.
    fn remove_entry(&self, entry: &Arc<PoolEntry>) {
        let mut entries = self.entries.lock();
        if let Some(current) = entries.get(&entry.key) {
            if Arc::ptr_eq(current, entry) {
                entries.remove(&entry.key);
            }
        }
    }

    /// Retire a ready server: fail its leases, drop it from the map, stop it.
    ///
    /// Caller must NOT hold the entry's state lock.
    async fn retire(
        self: &Arc<Self>,
        entry: &Arc<PoolEntry>,
        server: &Arc<RunningServer>,
        error: Error,
    ) {
        let mut state = entry.state.lock().await;
        let EntryState::Ready(current) = &*state else {
            return;
        };
        if !Arc::ptr_eq(current, server) {
            return;
        }
        server.mark_crashed(error);
        *state = EntryState::Stopped;
        drop(state);

        self.remove_entry(entry);
        entry.notify.notify_waiters();

        if let Err(e) = server.stop().await {
            warn!(key = %entry.key, error = %e, "failed to stop retired server");
        }
    }

    async fn sweep(self: &Arc<Self>) {
        let entries: Vec<Arc<PoolEntry>> = self.entries.lock().values().cloned().collect();
        let now = Instant::now();

        for entry in entries {
            let server = {
                let mut state = entry.state.lock().await;
                let EntryState::Ready(server) = &*state else {
                    continue;
                };
                let server = server.clone();

                // Backstop for a crash the exit watcher has not seen yet.
                if !server.is_alive() {
                    drop(state);
                    let error = Error::ProcessCrashed {
                        key: entry.key.to_string(),
                        reason: "process found dead by maintenance sweep".to_string(),
                    };
                    self.retire(&entry, &server, error).await;
                    continue;
                }

                // Idle eviction. The zero-reference check happens under the
                // state lock, so it cannot race a lease being granted.
                if entry.refs() == 0 {
                    if let Some(idle_since) = entry.idle_since() {
                        if now.duration_since(idle_since) >= self.settings.pool.idle_timeout() {
                            info!(key = %entry.key, "evicting idle server");
                            *state = EntryState::Stopped;
                            drop(state);
                            self.remove_entry(&entry);
                            entry.notify.notify_waiters();
                            if let Err(e) = server.stop().await {
                                warn!(key = %entry.key, error = %e, "failed to stop idle server");
                            }
                            continue;
                        }
                    }
                }

                server
            };

            // Health probing happens outside the state lock; probes can be
            // slow and must not block lease traffic.
            if entry.health_due(now, self.settings.pool.health_interval()) {
                if server.probe_health().await {
                    entry.reset_health_failures();
                } else {
                    let failures = entry.record_health_failure();
                    warn!(key = %entry.key, failures, "health probe failed");
                    if failures >= self.settings.pool.health_retry_budget {
                        let error = Error::ProcessCrashed {
                            key: entry.key.to_string(),
                            reason: format!("failed {failures} consecutive health probes"),
                        };
                        self.retire(&entry, &server, error).await;
                    }
                }
            }
        }
    }
}

/// Spawn the detached creation task for one attempt.
fn spawn_creation(
    inner: Weak<PoolInner>,
    entry: Arc<PoolEntry>,
    config: ServerConfig,
    candidates: Vec<Backend>,
    attempt: u64,
) {
    tokio::spawn(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let result = create_with_fallback(&inner, &entry.key, &config, &candidates).await;

        let mut state = entry.state.lock().await;
        let shutting_down = *inner.shutdown.borrow();
        let superseded = !matches!(&*state, EntryState::Creating { attempt: a } if *a == attempt);

        match result {
            Ok(running) if shutting_down || superseded => {
                // The pool moved on while we were provisioning; do not leak
                // the process we just started.
                *state = EntryState::Stopped;
                drop(state);
                inner.remove_entry(&entry);
                if let Err(e) = running.stop().await {
                    warn!(key = %entry.key, error = %e, "failed to stop orphaned server");
                }
                entry.notify.notify_waiters();
            }
            Ok(running) => {
                let running = Arc::new(running);
                if entry.refs() == 0 {
                    // Every requester may have cancelled; start the idle
                    // clock so the eviction sweep can reclaim the server.
                    entry.mark_idle();
                }
                *state = EntryState::Ready(running.clone());
                drop(state);
                spawn_exit_watcher(Arc::downgrade(&inner), entry.clone(), running);
                entry.notify.notify_waiters();
            }
            Err(error) => {
                warn!(key = %entry.key, attempt, error = %error, "server creation failed");
                if shutting_down || superseded {
                    // Waiters re-check the pool and observe the shutdown.
                    *state = EntryState::Stopped;
                    drop(state);
                    inner.remove_entry(&entry);
                } else {
                    *state = EntryState::Failed { error, attempt };
                    drop(state);
                }
                entry.notify.notify_waiters();
            }
        }
    });
}

/// Try each candidate backend in order, collecting failure reasons.
///
/// Provisioning-class failures move to the next candidate; a startup
/// timeout is surfaced directly (the process was already killed, and the
/// caller decides whether to lease again). Exhausting the chain yields one
/// aggregate error carrying every `(backend, reason)` pair.
async fn create_with_fallback(
    inner: &Arc<PoolInner>,
    key: &PoolKey,
    config: &ServerConfig,
    candidates: &[Backend],
) -> Result<RunningServer> {
    let mut attempts: Vec<BackendAttempt> = Vec::new();

    for backend in candidates {
        info!(key = %key, backend = %backend, "launching server");
        match inner.launcher.launch(config, *backend).await {
            Ok(server) => {
                return Ok(RunningServer::new(
                    server,
                    *backend,
                    config.shutdown_timeout(),
                ));
            }
            Err(error @ Error::StartupTimeout { .. }) => {
                return Err(error);
            }
            Err(error) => {
                warn!(key = %key, backend = %backend, error = %error, "backend failed, trying next");
                attempts.push(BackendAttempt {
                    backend: *backend,
                    reason: error.to_string(),
                });
            }
        }
    }

    Err(Error::BackendsExhausted {
        key: key.to_string(),
        attempts,
    })
}

/// Watch a ready server's exit channel and retire it the moment it dies.
fn spawn_exit_watcher(
    inner: Weak<PoolInner>,
    entry: Arc<PoolEntry>,
    running: Arc<RunningServer>,
) {
    tokio::spawn(async move {
        let mut exit = running.watch_exit();
        while exit.borrow().is_none() {
            if exit.changed().await.is_err() {
                return; // server object torn down elsewhere
            }
        }
        let code = (*exit.borrow()).unwrap_or(-1);

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let error = Error::ProcessCrashed {
            key: entry.key.to_string(),
            reason: format!("process exited with status {code}"),
        };
        warn!(key = %entry.key, code, "server process crashed");
        inner.retire(&entry, &running, error).await;
    });
}

/// Periodic eviction + health sweep; exits when the pool is dropped or
/// shut down.
async fn run_maintenance(inner: Weak<PoolInner>, sweep_interval: Duration) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if *inner.shutdown.borrow() {
            return;
        }
        inner.sweep().await;
    }
}
