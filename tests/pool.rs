//! Pool coordination tests against a mock launcher
//!
//! These exercise the leasing protocol without real binaries, networks, or
//! GPUs: single-flight creation, reference counting, idle eviction, backend
//! fallback, crash propagation, and shutdown. Time-driven behavior runs
//! under the paused tokio clock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use inferpool::backend::Backend;
use inferpool::config::{PoolSettings, ServerConfig, ServerMode, Settings};
use inferpool::error::Error;
use inferpool::hardware::{CpuArch, HardwareProfile, OsFamily};
use inferpool::server::{ManagedServer, ServerLauncher};
use inferpool::ServerPool;

/// Handle for steering one mock server from a test.
struct MockHandle {
    backend: Backend,
    exit: watch::Sender<Option<i32>>,
    healthy: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MockHandle {
    fn crash(&self, code: i32) {
        let _ = self.exit.send(Some(code));
    }

    fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct MockServer {
    base_url: String,
    exit: watch::Sender<Option<i32>>,
    healthy: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl ManagedServer for MockServer {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn watch_exit(&self) -> watch::Receiver<Option<i32>> {
        self.exit.subscribe()
    }

    async fn probe_health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn stop(&self, _timeout: Duration) -> inferpool::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.exit.send(Some(0));
        Ok(())
    }
}

/// Launcher that fabricates servers, with per-backend failure injection.
#[derive(Default)]
struct MockLauncher {
    launches: AtomicUsize,
    launch_delay: Option<Duration>,
    failing: Mutex<HashSet<Backend>>,
    spawned: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockLauncher {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            launch_delay: Some(delay),
            ..Self::default()
        })
    }

    fn fail_backend(&self, backend: Backend) {
        self.failing.lock().insert(backend);
    }

    fn allow_backend(&self, backend: Backend) {
        self.failing.lock().remove(&backend);
    }

    fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn handle(&self, index: usize) -> Arc<MockHandle> {
        self.spawned.lock()[index].clone()
    }
}

#[async_trait]
impl ServerLauncher for MockLauncher {
    async fn launch(
        &self,
        _config: &ServerConfig,
        backend: Backend,
    ) -> inferpool::Result<Box<dyn ManagedServer>> {
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&backend) {
            return Err(Error::Provision {
                backend,
                reason: "injected failure".to_string(),
            });
        }

        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        let (exit, _) = watch::channel(None);
        let healthy = Arc::new(AtomicBool::new(true));
        let stopped = Arc::new(AtomicBool::new(false));

        self.spawned.lock().push(Arc::new(MockHandle {
            backend,
            exit: exit.clone(),
            healthy: healthy.clone(),
            stopped: stopped.clone(),
        }));

        Ok(Box::new(MockServer {
            base_url: format!("http://127.0.0.1:{}", 40000 + index),
            exit,
            healthy,
            stopped,
        }))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cpu_profile() -> HardwareProfile {
    HardwareProfile::cpu_only(OsFamily::Linux, CpuArch::X64)
}

fn fast_settings() -> Settings {
    Settings {
        pool: PoolSettings {
            idle_timeout_secs: 2,
            sweep_interval_secs: 1,
            health_interval_secs: 3600,
            health_retry_budget: 3,
        },
        ..Settings::default()
    }
}

fn embedding_config() -> ServerConfig {
    ServerConfig::new("/models/m.gguf").mode(ServerMode::Embedding)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leases_share_one_process() {
    init_tracing();
    let launcher = MockLauncher::with_delay(Duration::from_millis(20));
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());
    let config = embedding_config();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let config = config.clone();
        tasks.push(tokio::spawn(async move { pool.lease(&config).await }));
    }

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().expect("lease should succeed"));
    }

    assert_eq!(launcher.launch_count(), 1, "exactly one process must start");
    for lease in &leases {
        assert_eq!(lease.backend(), Backend::Cpu);
        assert_eq!(lease.key().to_string(), "/models/m.gguf|cpu|4096|embedding");
    }

    let stats = pool.stats().await;
    assert_eq!(stats.entries.len(), 1);
    assert_eq!(stats.entries[0].refs, 8);
}

#[tokio::test]
async fn release_is_idempotent() {
    let launcher = MockLauncher::new();
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());

    let first = pool.lease(&embedding_config()).await.unwrap();
    let second = pool.lease(&embedding_config()).await.unwrap();

    first.release();
    first.release();
    first.release();

    let stats = pool.stats().await;
    assert_eq!(stats.entries[0].refs, 1, "double release must not double count");

    drop(first); // Drop after explicit release is also a no-op
    drop(second);
    let stats = pool.stats().await;
    assert_eq!(stats.entries[0].refs, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_server_is_evicted_after_window() {
    let launcher = MockLauncher::new();
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());

    let lease = pool.lease(&embedding_config()).await.unwrap();
    lease.release();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let stats = pool.stats().await;
    assert!(stats.entries.is_empty(), "idle server must be evicted");
    assert!(launcher.handle(0).was_stopped(), "evicted server must be stopped");
}

#[tokio::test(start_paused = true)]
async fn reuse_resets_idle_clock() {
    let launcher = MockLauncher::new();
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());

    let lease = pool.lease(&embedding_config()).await.unwrap();
    lease.release();

    // Re-lease within the idle window, hold across it
    tokio::time::sleep(Duration::from_secs(1)).await;
    let lease = pool.lease(&embedding_config()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let stats = pool.stats().await;
    assert_eq!(stats.entries.len(), 1, "held server must survive the sweep");
    assert_eq!(launcher.launch_count(), 1, "no replacement process");
    drop(lease);
}

#[tokio::test]
async fn provision_failure_falls_back_to_cpu() {
    let launcher = MockLauncher::new();
    launcher.fail_backend(Backend::Cuda12);

    // NVIDIA host: candidates are [cuda12, vulkan, cpu], vulkan also failing
    launcher.fail_backend(Backend::Vulkan);
    let mut profile = cpu_profile();
    profile.gpu = inferpool::hardware::GpuVendor::Nvidia;
    profile.cuda_major = Some(12);
    profile.vulkan = true;

    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), profile);
    let lease = pool.lease(&embedding_config()).await.unwrap();

    assert_eq!(lease.backend(), Backend::Cpu, "must fall back to CPU");
    assert_eq!(launcher.handle(0).backend, Backend::Cpu);
    // key still reflects the resolved primary candidate
    assert!(lease.key().to_string().contains("|cuda12|"));
}

#[tokio::test]
async fn exhausted_chain_yields_aggregate_error() {
    let launcher = MockLauncher::new();
    launcher.fail_backend(Backend::Cpu);

    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());
    let err = pool.lease(&embedding_config()).await.unwrap_err();

    match err {
        Error::BackendsExhausted { attempts, .. } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].backend, Backend::Cpu);
            assert!(attempts[0].reason.contains("injected failure"));
        }
        other => panic!("expected BackendsExhausted, got {other:?}"),
    }

    // A later lease re-provisions once the backend works again
    launcher.allow_backend(Backend::Cpu);
    let lease = pool.lease(&embedding_config()).await.unwrap();
    assert_eq!(lease.backend(), Backend::Cpu);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_fails_outstanding_leases_then_release_reprovisions() {
    init_tracing();
    let launcher = MockLauncher::new();
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());
    let config = embedding_config();

    let leases = [
        pool.lease(&config).await.unwrap(),
        pool.lease(&config).await.unwrap(),
        pool.lease(&config).await.unwrap(),
    ];
    assert_eq!(launcher.launch_count(), 1);

    launcher.handle(0).crash(137);
    // let the exit watcher run
    tokio::time::sleep(Duration::from_millis(50)).await;

    for lease in &leases {
        let err = lease.client().unwrap_err();
        assert!(
            matches!(err, Error::ProcessCrashed { .. }),
            "lease must observe the crash, got {err:?}"
        );
        assert!(err.retryable());
    }

    let lease = pool.lease(&config).await.unwrap();
    assert_eq!(launcher.launch_count(), 2, "new lease must re-provision");
    assert!(lease.client().is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_does_not_abort_shared_creation() {
    let launcher = MockLauncher::with_delay(Duration::from_millis(500));
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());
    let config = embedding_config();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(100), pool.lease(&config)).await;
    assert!(cancelled.is_err(), "waiter should have been cancelled");

    // Creation keeps running; the next caller picks up its result.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let lease = pool.lease(&config).await.unwrap();
    assert_eq!(
        launcher.launch_count(),
        1,
        "cancelled waiter must not abort or duplicate the creation"
    );
    assert!(lease.client().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_creation_reaches_every_waiter() {
    let launcher = MockLauncher::with_delay(Duration::from_millis(20));
    launcher.fail_backend(Backend::Cpu);
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());
    let config = embedding_config();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let config = config.clone();
        tasks.push(tokio::spawn(async move { pool.lease(&config).await }));
    }

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(
            matches!(err, Error::BackendsExhausted { .. }),
            "every waiter observes the shared failure, got {err:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn health_probe_budget_replaces_dead_server() {
    let launcher = MockLauncher::new();
    let settings = Settings {
        pool: PoolSettings {
            idle_timeout_secs: 3600,
            sweep_interval_secs: 1,
            health_interval_secs: 1,
            health_retry_budget: 3,
        },
        ..Settings::default()
    };
    let pool = ServerPool::with_launcher(launcher.clone(), settings, cpu_profile());

    let lease = pool.lease(&embedding_config()).await.unwrap();
    launcher.handle(0).healthy.store(false, Ordering::SeqCst);

    // three failing probes, one per sweep
    tokio::time::sleep(Duration::from_secs(5)).await;

    let err = lease.client().unwrap_err();
    assert!(matches!(err, Error::ProcessCrashed { .. }), "got {err:?}");
    assert!(launcher.handle(0).was_stopped(), "dead server must be force-stopped");

    let stats = pool.stats().await;
    assert!(stats.entries.is_empty(), "entry must be cleared for re-provisioning");
}

#[tokio::test]
async fn shutdown_stops_servers_and_refuses_leases() {
    let launcher = MockLauncher::new();
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());

    let lease = pool.lease(&embedding_config()).await.unwrap();
    pool.shutdown().await;

    assert!(launcher.handle(0).was_stopped());
    let err = lease.client().unwrap_err();
    assert!(matches!(err, Error::PoolShutdown), "got {err:?}");

    let err = pool.lease(&embedding_config()).await.unwrap_err();
    assert!(matches!(err, Error::PoolShutdown), "got {err:?}");
}

#[tokio::test]
async fn distinct_keys_get_distinct_processes() {
    let launcher = MockLauncher::new();
    let pool = ServerPool::with_launcher(launcher.clone(), fast_settings(), cpu_profile());

    let generation = pool
        .lease(&ServerConfig::new("/models/m.gguf"))
        .await
        .unwrap();
    let embedding = pool.lease(&embedding_config()).await.unwrap();
    let bigger_ctx = pool
        .lease(&ServerConfig::new("/models/m.gguf").context_size(8192))
        .await
        .unwrap();

    assert_eq!(launcher.launch_count(), 3, "each key needs its own process");
    assert_ne!(generation.key(), embedding.key());
    assert_ne!(generation.key(), bigger_ctx.key());
}
