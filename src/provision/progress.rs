//! Advisory download progress reporting
//!
//! Observers are purely informational; provisioning never depends on one
//! being registered or on its callbacks completing.

/// Phase of a provisioning transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Downloading,
    Extracting,
    Complete,
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Downloading => write!(f, "downloading"),
            Self::Extracting => write!(f, "extracting"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Callback interface for provisioning progress
///
/// `bytes` is the running count for the current phase; `total` is known only
/// when the source reports a content length.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, file: &str, bytes: u64, total: Option<u64>, phase: ProgressPhase);
}

/// Observer that forwards progress to the tracing subscriber at debug level.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_progress(&self, file: &str, bytes: u64, total: Option<u64>, phase: ProgressPhase) {
        tracing::debug!(file = %file, bytes, total = ?total, phase = %phase, "provision progress");
    }
}
