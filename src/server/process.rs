//! Server process lifecycle
//!
//! One [`ServerProcess`] owns one operating-system process:
//! spawn, health probing until ready, graceful stop with a hard kill bound.
//! State machine: `Starting → HealthChecking → Ready → Stopping → Stopped`,
//! with `Failed` terminal from the first two states. The child handle lives
//! inside a monitor task; the rest of the code addresses the process by pid
//! and observes its exit through a watch channel, so stopping never contends
//! with waiting.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::{ServerConfig, ServerMode};
use crate::constants::process as defaults;
use crate::error::{Error, Result};

/// Lifecycle state of a server process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    HealthChecking,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// A spawned inference server process
pub struct ServerProcess {
    pid: u32,
    port: u16,
    backend: Backend,
    base_url: String,
    state: watch::Sender<ProcessState>,
    exit: watch::Receiver<Option<i32>>,
    monitor: tokio::task::JoinHandle<()>,
    http: reqwest::Client,
}

impl ServerProcess {
    /// Launch the server binary with arguments derived from `config`.
    ///
    /// The listening port is allocated from the OS ephemeral range before
    /// spawning and passed explicitly, so no output parsing is needed to
    /// discover the address.
    pub async fn start(binary: &Path, config: &ServerConfig, backend: Backend) -> Result<Self> {
        let port = allocate_port()?;
        let args = build_args(config, port);

        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Release archives bundle the ggml shared libraries next to the binary
        if let Some(dir) = binary.parent() {
            cmd.env("LD_LIBRARY_PATH", dir);
        }

        let mut child = cmd.spawn().map_err(|e| Error::Provision {
            backend,
            reason: format!("failed to spawn {}: {e}", binary.display()),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Internal("spawned server but no PID available".to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait on server process");
                    -1
                }
            };
            debug!(pid, code, "server process exited");
            let _ = exit_tx.send(Some(code));
        });

        let (state, _) = watch::channel(ProcessState::Starting);
        let http = reqwest::Client::builder()
            .timeout(defaults::HEALTH_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        info!(
            pid,
            port,
            backend = %backend,
            model = %config.model_path.display(),
            mode = %config.mode,
            "server process spawned"
        );

        Ok(Self {
            pid,
            port,
            backend,
            base_url: format!("http://{}:{}", defaults::BIND_HOST, port),
            state,
            exit: exit_rx,
            monitor,
            http,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Observe process exit; the value becomes `Some(code)` exactly once.
    pub fn watch_exit(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Poll the liveness endpoint until the server is ready.
    ///
    /// Exceeding `timeout` kills the process (confirmed, not fire-and-forget)
    /// and returns [`Error::StartupTimeout`]. A process that exits while
    /// being probed fails as a provisioning error so the pool can fall back
    /// to the next backend.
    pub async fn wait_healthy(&self, timeout: Duration) -> Result<()> {
        self.state.send_replace(ProcessState::HealthChecking);
        let url = format!("{}{}", self.base_url, defaults::HEALTH_PATH);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut exit = self.exit.clone();

        loop {
            if let Some(code) = *exit.borrow() {
                self.state.send_replace(ProcessState::Failed);
                return Err(Error::Provision {
                    backend: self.backend,
                    reason: format!("server exited during startup with status {code}"),
                });
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(pid = self.pid, timeout_secs = timeout.as_secs(), "startup timed out");
                self.signal(Signal::SIGKILL);
                self.await_exit(Duration::from_secs(5)).await;
                self.state.send_replace(ProcessState::Failed);
                return Err(Error::StartupTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }

            if let Ok(response) = self.http.get(&url).send().await {
                if response.status().is_success() {
                    self.state.send_replace(ProcessState::Ready);
                    info!(pid = self.pid, port = self.port, "server is healthy");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(defaults::HEALTH_POLL_INTERVAL) => {}
                _ = exit.changed() => {}
            }
        }
    }

    /// Single liveness probe against a running server.
    pub async fn probe_health(&self) -> bool {
        let url = format!("{}{}", self.base_url, defaults::HEALTH_PATH);
        matches!(self.http.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    /// Request graceful shutdown, force-killing after `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if self.exit.borrow().is_some() {
            self.state.send_replace(ProcessState::Stopped);
            return Ok(());
        }

        self.state.send_replace(ProcessState::Stopping);
        debug!(pid = self.pid, "sending SIGTERM");
        self.signal(Signal::SIGTERM);

        if !self.await_exit(timeout).await {
            warn!(pid = self.pid, "graceful shutdown timed out, sending SIGKILL");
            self.signal(Signal::SIGKILL);
            self.await_exit(Duration::from_secs(5)).await;
        }

        self.state.send_replace(ProcessState::Stopped);
        info!(pid = self.pid, "server process stopped");
        Ok(())
    }

    /// Wait up to `timeout` for the exit watch to fire.
    async fn await_exit(&self, timeout: Duration) -> bool {
        let mut exit = self.exit.clone();
        tokio::time::timeout(timeout, async {
            while exit.borrow().is_none() {
                if exit.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    fn signal(&self, signal: Signal) {
        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = kill(pid, signal) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid = self.pid, signal = %signal, error = %e, "failed to signal process");
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        // Aborting the monitor drops the child handle, whose kill_on_drop
        // guarantees the process cannot outlive its owner.
        if self.is_alive() {
            warn!(pid = self.pid, "server process dropped while alive, killing");
            self.monitor.abort();
        }
    }
}

/// Forward child output lines to the tracing subscriber.
async fn forward_output(
    stream: impl tokio::io::AsyncRead + Unpin,
    pid: u32,
    channel: &'static str,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "inferpool::server", pid, channel, "{line}");
    }
}

/// Reserve an ephemeral port by binding and immediately releasing it.
pub(crate) fn allocate_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((defaults::BIND_HOST, 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Build the server argument vector from a configuration.
pub(crate) fn build_args(config: &ServerConfig, port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--model".into(),
        config.model_path.display().to_string(),
        "--host".into(),
        defaults::BIND_HOST.into(),
        "--port".into(),
        port.to_string(),
        "--ctx-size".into(),
        config.context_size.to_string(),
        "--batch-size".into(),
        config.batch_size.to_string(),
        "--ubatch-size".into(),
        config.ubatch_size.to_string(),
        "--parallel".into(),
        config.parallel.to_string(),
        "--n-gpu-layers".into(),
        config.gpu_layers.as_raw().to_string(),
        "--threads".into(),
        num_cpus::get_physical().to_string(),
    ];

    match config.mode {
        ServerMode::Generation => {}
        ServerMode::Embedding => args.push("--embedding".into()),
        ServerMode::Reranking => args.push("--reranking".into()),
    }
    if let Some(pooling) = config.pooling {
        args.push("--pooling".into());
        args.push(pooling.to_string());
    }

    if config.kv_cache_type != crate::config::KvCacheType::F16 {
        let flag = config.kv_cache_type.as_flag().to_string();
        args.push("--cache-type-k".into());
        args.push(flag.clone());
        args.push("--cache-type-v".into());
        args.push(flag);
    }

    if config.flash_attention {
        args.push("--flash-attn".into());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GpuLayers, KvCacheType, PoolingStrategy};

    #[test]
    fn test_build_args_generation_defaults() {
        let config = ServerConfig::new("/models/m.gguf");
        let args = build_args(&config, 8080);

        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"/models/m.gguf".to_string()));
        assert!(args.contains(&"8080".to_string()));
        assert!(args.contains(&"-1".to_string())); // all GPU layers
        assert!(!args.contains(&"--embedding".to_string()));
        assert!(!args.contains(&"--cache-type-k".to_string()));
        assert!(!args.contains(&"--flash-attn".to_string()));
    }

    #[test]
    fn test_build_args_embedding_mode() {
        let mut config = ServerConfig::new("/models/e.gguf").mode(ServerMode::Embedding);
        config.pooling = Some(PoolingStrategy::Mean);
        config.gpu_layers = GpuLayers::None;
        let args = build_args(&config, 9000);

        assert!(args.contains(&"--embedding".to_string()));
        let idx = args.iter().position(|a| a == "--pooling").unwrap();
        assert_eq!(args[idx + 1], "mean");
        let idx = args.iter().position(|a| a == "--n-gpu-layers").unwrap();
        assert_eq!(args[idx + 1], "0");
    }

    #[test]
    fn test_build_args_kv_quant_and_flash() {
        let mut config = ServerConfig::new("/models/m.gguf");
        config.kv_cache_type = KvCacheType::Q8_0;
        config.flash_attention = true;
        let args = build_args(&config, 9000);

        let idx = args.iter().position(|a| a == "--cache-type-k").unwrap();
        assert_eq!(args[idx + 1], "q8_0");
        assert!(args.contains(&"--cache-type-v".to_string()));
        assert!(args.contains(&"--flash-attn".to_string()));
    }

    #[test]
    fn test_allocate_port_is_bindable() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        // the port is free again after allocation
        std::net::TcpListener::bind((defaults::BIND_HOST, port)).unwrap();
    }

    #[cfg(unix)]
    fn stub_binary(dir: &Path, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("llama-server");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_stop_confirms_exit() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "#!/bin/sh\nexec sleep 30\n");
        let config = ServerConfig::new("/models/m.gguf");

        let process = ServerProcess::start(&binary, &config, Backend::Cpu)
            .await
            .unwrap();
        assert!(process.is_alive());
        assert_eq!(process.state(), ProcessState::Starting);

        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_surfaces_during_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let binary = stub_binary(dir.path(), "#!/bin/sh\nexit 7\n");
        let config = ServerConfig::new("/models/m.gguf");

        let process = ServerProcess::start(&binary, &config, Backend::Cpu)
            .await
            .unwrap();
        let err = process
            .wait_healthy(Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provision { .. }), "got {err:?}");
        assert_eq!(process.state(), ProcessState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        // never opens the health endpoint
        let binary = stub_binary(dir.path(), "#!/bin/sh\nexec sleep 30\n");
        let config = ServerConfig::new("/models/m.gguf");

        let process = ServerProcess::start(&binary, &config, Backend::Cpu)
            .await
            .unwrap();
        let err = process
            .wait_healthy(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartupTimeout { .. }), "got {err:?}");
        assert!(!process.is_alive(), "process must be confirmed killed");
        assert_eq!(process.state(), ProcessState::Failed);
    }
}
