//! Lease handles
//!
//! A [`Lease`] is a caller's temporary, reference-counted right to use one
//! running server. Release is idempotent: explicit [`Lease::release`] and
//! scope-exit `Drop` may both run, the reference count moves exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::client::LlamaClient;
use crate::error::{Error, Result};
use crate::pool::entry::{PoolEntry, RunningServer};
use crate::pool::PoolKey;

/// A caller's handle on a pooled server process
pub struct Lease {
    id: uuid::Uuid,
    entry: Arc<PoolEntry>,
    server: Arc<RunningServer>,
    client: LlamaClient,
    released: AtomicBool,
}

impl Lease {
    pub(crate) fn new(
        entry: Arc<PoolEntry>,
        server: Arc<RunningServer>,
        client: LlamaClient,
    ) -> Self {
        let id = uuid::Uuid::new_v4();
        debug!(lease = %id, key = %entry.key, refs = entry.refs(), "lease granted");
        Self {
            id,
            entry,
            server,
            client,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.entry.key
    }

    /// Backend the server actually started on; may be a fallback rather
    /// than the key's primary candidate.
    pub fn backend(&self) -> Backend {
        self.server.backend()
    }

    pub fn base_url(&self) -> &str {
        self.server.base_url()
    }

    /// The protocol client bound to this lease's server.
    ///
    /// Fails with the crash error once the underlying process has died;
    /// the caller may request a fresh lease, which re-provisions.
    pub fn client(&self) -> Result<&LlamaClient> {
        match self.server.crash_error() {
            Some(error) => Err(error),
            None => Ok(&self.client),
        }
    }

    /// The crash error for this lease's server, if it has died.
    pub fn crash_error(&self) -> Option<Error> {
        self.server.crash_error()
    }

    /// Return the reference; safe to call any number of times.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.entry.release();
            debug!(lease = %self.id, key = %self.entry.key, refs = self.entry.refs(), "lease released");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("key", &self.entry.key.to_string())
            .field("backend", &self.server.backend())
            .finish()
    }
}
