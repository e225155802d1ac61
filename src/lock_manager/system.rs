//! Process-wide coordination root

use log::info;
use std::sync::Arc;
use std::time::Duration;

use super::backend::{CoordinationBackend, open_backend};
use super::lock_object::{LockPool, LockTiming};
use super::manager::LockManager;
use crate::cancel::CancelToken;
use crate::config::CoordinationConfig;
use crate::error::CoordinationResult;

/// Shared state behind every [`LockManager`] session of one process
///
/// Holds the backend, the process-local lock and critical-section pools and
/// the configuration. Create one per process and hand out sessions to the
/// threads that need them; sessions are cheap.
#[derive(Debug)]
pub struct LockSystem {
    backend: Arc<dyn CoordinationBackend>,
    pub(crate) locks: LockPool,
    pub(crate) sections: LockPool,
    pub(crate) timing: LockTiming,
    config: CoordinationConfig,
}

impl LockSystem {
    /// Open the configured backend and build a lock system on it
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    pub fn open(config: &CoordinationConfig) -> CoordinationResult<Arc<Self>> {
        let backend = open_backend(config)?;
        Ok(Self::with_backend(backend, config))
    }

    /// Build a lock system over an already-open backend
    #[must_use]
    pub fn with_backend(
        backend: Arc<dyn CoordinationBackend>,
        config: &CoordinationConfig,
    ) -> Arc<Self> {
        info!(
            "Coordination started as holder {} ({:?} backend)",
            backend.holder_id(),
            config.backend()
        );
        Arc::new(Self {
            locks: LockPool::new(Some(Arc::clone(&backend))),
            sections: LockPool::new(None),
            timing: LockTiming {
                retry_interval: config.lock_retry_interval(),
                check_interval: config.cancel_check_interval(),
            },
            backend,
            config: config.clone(),
        })
    }

    /// A new session with its own cancellation token
    #[must_use]
    pub fn session(self: &Arc<Self>) -> LockManager {
        self.session_with_cancel(CancelToken::new())
    }

    /// A new session observing `cancel`
    #[must_use]
    pub fn session_with_cancel(self: &Arc<Self>, cancel: CancelToken) -> LockManager {
        LockManager::new(Arc::clone(self), cancel)
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CoordinationBackend> {
        &self.backend
    }

    #[must_use]
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    #[must_use]
    pub fn holder_id(&self) -> &str {
        self.backend.holder_id()
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        self.timing.check_interval
    }

    /// Extend this process's leases on the backend
    ///
    /// # Errors
    ///
    /// Returns the backend's error if renewal fails.
    pub fn renew_leases(&self) -> CoordinationResult<usize> {
        self.backend.renew_leases()
    }

    /// Number of lock keys currently held or waited on in this process
    #[must_use]
    pub fn live_lock_count(&self) -> usize {
        self.locks.live_objects()
    }
}
