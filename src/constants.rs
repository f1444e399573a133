//! Shared constants for inferpool
//!
//! Centralizes default tunables and wire-level constants to maintain
//! consistency across the codebase. Most of these are the fallback values
//! behind the corresponding [`crate::config`] settings fields.

use std::time::Duration;

/// Release source for the server binary
pub mod release {
    /// GitHub repository that publishes llama.cpp server release archives
    pub const REPO: &str = "ggml-org/llama.cpp";

    /// Base URL for release asset downloads
    pub const DOWNLOAD_BASE_URL: &str = "https://github.com";

    /// Base URL for the release metadata API
    pub const API_BASE_URL: &str = "https://api.github.com";

    /// User agent sent on all outbound HTTP requests
    pub const USER_AGENT: &str = concat!("inferpool/", env!("CARGO_PKG_VERSION"));

    /// Name of the server binary inside a release archive
    #[cfg(not(windows))]
    pub const SERVER_BINARY: &str = "llama-server";

    /// Name of the server binary inside a release archive
    #[cfg(windows)]
    pub const SERVER_BINARY: &str = "llama-server.exe";

    /// Marker file recording the installed release tag in a cache entry
    pub const VERSION_MARKER: &str = "version.json";
}

/// Server process defaults
pub mod process {
    use super::Duration;

    /// Liveness endpoint polled during startup and by the health sweep
    pub const HEALTH_PATH: &str = "/health";

    /// Address the server binds; only loopback is ever exposed
    pub const BIND_HOST: &str = "127.0.0.1";

    /// Budget for a spawned server to become healthy
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

    /// Budget for graceful shutdown before the process is force-killed
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Interval between liveness polls while waiting for startup
    pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Per-request timeout for liveness probes
    pub const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Pool maintenance defaults
pub mod pool {
    /// Seconds a zero-reference server survives before eviction
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

    /// Seconds between maintenance sweeps (eviction + health)
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

    /// Seconds between health probes of a ready server
    pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

    /// Consecutive probe failures tolerated before a server is declared dead
    pub const DEFAULT_HEALTH_RETRY_BUDGET: u32 = 3;
}

/// Server launch defaults
pub mod server {
    /// Default context size in tokens
    pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;

    /// Default logical batch size in tokens
    pub const DEFAULT_BATCH_SIZE: u32 = 2048;

    /// Default physical micro-batch size in tokens
    pub const DEFAULT_UBATCH_SIZE: u32 = 512;

    /// Default number of parallel server slots
    pub const DEFAULT_PARALLEL: u32 = 1;
}
