//! Error types for inferpool

use thiserror::Error;

use crate::backend::Backend;

/// One failed attempt in a backend fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    /// Backend that was tried
    pub backend: Backend,
    /// Why it failed
    pub reason: String,
}

impl std::fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

fn format_attempts(attempts: &[BackendAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Main error type for pool operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────
    // Backend / Provisioning Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("backend {backend} is not usable on this host: {reason}")]
    UnsupportedBackend { backend: Backend, reason: String },

    #[error("failed to provision {backend}: {reason}")]
    Provision { backend: Backend, reason: String },

    #[error("all backends failed for {key}: {}", format_attempts(.attempts))]
    BackendsExhausted {
        key: String,
        attempts: Vec<BackendAttempt>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Process Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("server did not become healthy within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    #[error("server process for {key} exited unexpectedly: {reason}")]
    ProcessCrashed { key: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation not valid for this server mode: {0}")]
    InvalidMode(String),

    // ─────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("pool is shut down")]
    PoolShutdown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a fresh lease request is a reasonable response to this error.
    ///
    /// Crash and startup failures clear the affected pool entry, so leasing
    /// again re-provisions from scratch; transport errors are scoped to one
    /// request against a server that may well still be healthy.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::ProcessCrashed { .. }
                | Error::StartupTimeout { .. }
                | Error::Transport(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{err:#}"))
    }
}

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Provision {
            backend: Backend::Cuda12,
            reason: "asset not found".to_string(),
        };
        assert_eq!(err.to_string(), "failed to provision cuda12: asset not found");

        let err = Error::BackendsExhausted {
            key: "m.gguf|cpu|4096|embedding".to_string(),
            attempts: vec![
                BackendAttempt {
                    backend: Backend::Cuda12,
                    reason: "download failed".to_string(),
                },
                BackendAttempt {
                    backend: Backend::Cpu,
                    reason: "no cached binary".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("cuda12: download failed"));
        assert!(text.contains("cpu: no cached binary"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::ProcessCrashed {
            key: "k".to_string(),
            reason: "exit 137".to_string(),
        }
        .retryable());
        assert!(Error::StartupTimeout { timeout_secs: 5 }.retryable());
        assert!(!Error::PoolShutdown.retryable());
        assert!(!Error::UnsupportedBackend {
            backend: Backend::Metal,
            reason: "not macOS".to_string(),
        }
        .retryable());
    }
}
