//! Configuration types for inferpool
//!
//! Two layers of configuration exist:
//!
//! - [`ServerConfig`] describes one server process and is supplied per lease
//!   request. It is immutable once a process has been started from it.
//! - [`Settings`] holds the pool-wide tunables (sweep intervals, retry
//!   budgets, binary cache location). It loads from defaults, then an
//!   optional TOML file, then `INFERPOOL_`-prefixed environment variables,
//!   in order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::constants;
use crate::error::Result;

/// What a server process is launched to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    /// Free-text generation over the completion endpoint
    Generation,
    /// Embedding vectors over the embeddings endpoint
    Embedding,
    /// Query/document relevance scoring over the rerank endpoint
    Reranking,
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Embedding => write!(f, "embedding"),
            Self::Reranking => write!(f, "reranking"),
        }
    }
}

/// Pooling strategy for embedding and reranking servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolingStrategy {
    Mean,
    Cls,
    Last,
    Rank,
}

impl std::fmt::Display for PoolingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Cls => write!(f, "cls"),
            Self::Last => write!(f, "last"),
            Self::Rank => write!(f, "rank"),
        }
    }
}

/// KV-cache quantization tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KvCacheType {
    F16,
    Q8_0,
    Q4_0,
}

impl KvCacheType {
    /// Flag value understood by the server's `--cache-type-k/v` options.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::Q8_0 => "q8_0",
            Self::Q4_0 => "q4_0",
        }
    }
}

/// How many model layers to offload to the GPU.
///
/// External form is a single integer: `-1` = all layers, `0` = CPU only,
/// `N` = exactly N layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuLayers {
    All,
    None,
    Count(u32),
}

impl GpuLayers {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            r if r < 0 => Self::All,
            0 => Self::None,
            n => Self::Count(n as u32),
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            Self::All => -1,
            Self::None => 0,
            Self::Count(n) => *n as i64,
        }
    }
}

impl Serialize for GpuLayers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_raw())
    }
}

impl<'de> Deserialize<'de> for GpuLayers {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_raw(i64::deserialize(deserializer)?))
    }
}

/// Configuration for one server process
///
/// Only `(model_path, backend, context_size, mode)` participate in pool
/// keying; two configs differing in other fields share a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path to the local GGUF model file
    pub model_path: PathBuf,

    /// Server mode (generation, embedding, reranking)
    pub mode: ServerMode,

    /// Explicit backend pin; `None` resolves from the hardware profile
    pub backend: Option<Backend>,

    /// Context size in tokens
    pub context_size: u32,

    /// Logical batch size in tokens
    pub batch_size: u32,

    /// Physical micro-batch size in tokens
    pub ubatch_size: u32,

    /// Number of parallel server slots
    pub parallel: u32,

    /// GPU layer offload count
    pub gpu_layers: GpuLayers,

    /// Pooling strategy for embedding/reranking; server default when unset
    pub pooling: Option<PoolingStrategy>,

    /// KV-cache quantization tier
    pub kv_cache_type: KvCacheType,

    /// Enable flash attention
    pub flash_attention: bool,

    /// Budget for the process to become healthy
    pub startup_timeout_secs: u64,

    /// Budget for graceful shutdown before force-kill
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            mode: ServerMode::Generation,
            backend: None,
            context_size: constants::server::DEFAULT_CONTEXT_SIZE,
            batch_size: constants::server::DEFAULT_BATCH_SIZE,
            ubatch_size: constants::server::DEFAULT_UBATCH_SIZE,
            parallel: constants::server::DEFAULT_PARALLEL,
            gpu_layers: GpuLayers::All,
            pooling: None,
            kv_cache_type: KvCacheType::F16,
            flash_attention: false,
            startup_timeout_secs: constants::process::DEFAULT_STARTUP_TIMEOUT.as_secs(),
            shutdown_timeout_secs: constants::process::DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration for a model file with all defaults.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Set the server mode.
    pub fn mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Pin an explicit backend, bypassing hardware resolution.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the context size in tokens.
    pub fn context_size(mut self, tokens: u32) -> Self {
        self.context_size = tokens;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Pool maintenance tunables
///
/// Sweep intervals and retry budgets are deployment-dependent, so they are
/// configuration rather than constants; the defaults suit an interactive
/// workstation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Seconds a zero-reference server survives before eviction
    pub idle_timeout_secs: u64,

    /// Seconds between maintenance sweeps
    pub sweep_interval_secs: u64,

    /// Seconds between health probes of a ready server
    pub health_interval_secs: u64,

    /// Consecutive probe failures tolerated before the server is replaced
    pub health_retry_budget: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: constants::pool::DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: constants::pool::DEFAULT_SWEEP_INTERVAL_SECS,
            health_interval_secs: constants::pool::DEFAULT_HEALTH_INTERVAL_SECS,
            health_retry_budget: constants::pool::DEFAULT_HEALTH_RETRY_BUDGET,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Binary provisioning tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Root of the versioned binary cache
    pub cache_root: PathBuf,

    /// Pin a specific release tag instead of resolving the latest
    pub release_tag: Option<String>,

    /// Repository publishing the release archives
    pub repo: String,

    /// Base URL for release asset downloads
    pub download_base_url: String,

    /// Base URL for the release metadata API
    pub api_base_url: String,

    /// Per-request timeout for metadata requests
    pub request_timeout_secs: u64,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            release_tag: None,
            repo: constants::release::REPO.to_string(),
            download_base_url: constants::release::DOWNLOAD_BASE_URL.to_string(),
            api_base_url: constants::release::API_BASE_URL.to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Default binary cache root, e.g. `~/.cache/inferpool/bin` on Linux.
fn default_cache_root() -> PathBuf {
    directories::ProjectDirs::from("", "", "inferpool")
        .map(|dirs| dirs.cache_dir().join("bin"))
        .unwrap_or_else(|| PathBuf::from(".inferpool/bin"))
}

/// Top-level settings loaded from file and environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolSettings,
    pub provision: ProvisionSettings,
}

impl Settings {
    /// Load settings from all sources.
    ///
    /// Precedence, lowest first: built-in defaults, the optional TOML file,
    /// `INFERPOOL_`-prefixed environment variables (`__` separates nesting,
    /// e.g. `INFERPOOL_POOL__IDLE_TIMEOUT_SECS=60`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Settings::default())?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("INFERPOOL").separator("__"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new("/models/m.gguf");
        assert_eq!(config.mode, ServerMode::Generation);
        assert_eq!(config.context_size, 4096);
        assert_eq!(config.gpu_layers, GpuLayers::All);
        assert_eq!(config.kv_cache_type, KvCacheType::F16);
        assert!(config.backend.is_none());
        assert_eq!(config.startup_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_gpu_layers_raw_form() {
        assert_eq!(GpuLayers::from_raw(-1), GpuLayers::All);
        assert_eq!(GpuLayers::from_raw(0), GpuLayers::None);
        assert_eq!(GpuLayers::from_raw(32), GpuLayers::Count(32));
        assert_eq!(GpuLayers::All.as_raw(), -1);
        assert_eq!(GpuLayers::Count(16).as_raw(), 16);

        let json = serde_json::to_string(&GpuLayers::All).unwrap();
        assert_eq!(json, "-1");
        let back: GpuLayers = serde_json::from_str("32").unwrap();
        assert_eq!(back, GpuLayers::Count(32));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.pool.idle_timeout_secs, 300);
        assert_eq!(settings.pool.health_retry_budget, 3);
        assert!(settings.provision.release_tag.is_none());
        assert!(settings.provision.cache_root.ends_with("bin"));
    }

    #[test]
    fn test_settings_file_roundtrip() {
        let toml = r#"
            [pool]
            idle_timeout_secs = 60

            [provision]
            release_tag = "b4500"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inferpool.toml");
        std::fs::write(&path, toml).unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.pool.idle_timeout_secs, 60);
        // untouched fields keep their defaults
        assert_eq!(settings.pool.health_retry_budget, 3);
        assert_eq!(settings.provision.release_tag.as_deref(), Some("b4500"));
    }
}
