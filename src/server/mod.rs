//! Server process management
//!
//! [`ServerProcess`] owns one OS process. [`ServerLauncher`] is the seam the
//! pool drives: the production [`LlamaLauncher`] provisions a binary and
//! starts a real process, while tests substitute a mock. Keeping the trait at
//! this boundary means the pool's coordination logic never needs a real
//! binary, network, or GPU to be exercised.

mod process;

pub use process::{ProcessState, ServerProcess};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::hardware::HardwareProfile;
use crate::provision::Provisioner;

/// A running, health-checked server the pool can hand out.
///
/// Object-safe so the pool can hold mocks in tests.
#[async_trait]
pub trait ManagedServer: Send + Sync {
    /// Base URL of the server's HTTP surface.
    fn base_url(&self) -> &str;

    /// Whether the OS process is still running.
    fn is_alive(&self) -> bool;

    /// Exit observation channel; becomes `Some(code)` exactly once.
    fn watch_exit(&self) -> watch::Receiver<Option<i32>>;

    /// One liveness probe.
    async fn probe_health(&self) -> bool;

    /// Graceful stop with a hard kill after `timeout`.
    async fn stop(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
impl ManagedServer for ServerProcess {
    fn base_url(&self) -> &str {
        ServerProcess::base_url(self)
    }

    fn is_alive(&self) -> bool {
        ServerProcess::is_alive(self)
    }

    fn watch_exit(&self) -> watch::Receiver<Option<i32>> {
        ServerProcess::watch_exit(self)
    }

    async fn probe_health(&self) -> bool {
        ServerProcess::probe_health(self).await
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        ServerProcess::stop(self, timeout).await
    }
}

/// Creates ready-to-serve server instances for the pool.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Provision, start, and health-check a server for `backend`.
    ///
    /// Returns only once the server is `Ready`; any failure before that
    /// point must leave no process behind.
    async fn launch(
        &self,
        config: &ServerConfig,
        backend: Backend,
    ) -> Result<Box<dyn ManagedServer>>;
}

/// Production launcher: acquires the llama.cpp server binary and runs it.
pub struct LlamaLauncher {
    provisioner: Arc<Provisioner>,
    profile: HardwareProfile,
}

impl LlamaLauncher {
    pub fn new(provisioner: Arc<Provisioner>, profile: HardwareProfile) -> Self {
        Self {
            provisioner,
            profile,
        }
    }
}

#[async_trait]
impl ServerLauncher for LlamaLauncher {
    async fn launch(
        &self,
        config: &ServerConfig,
        backend: Backend,
    ) -> Result<Box<dyn ManagedServer>> {
        backend.validate(&self.profile)?;
        let binary = self
            .provisioner
            .acquire(backend, &self.profile.platform())
            .await?;
        let process = ServerProcess::start(&binary, config, backend).await?;
        process.wait_healthy(config.startup_timeout()).await?;
        Ok(Box::new(process))
    }
}
