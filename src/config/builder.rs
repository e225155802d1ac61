//! Type-safe builder for `CoordinationConfig` using the typestate pattern
//!
//! The backend must be chosen before `build()` becomes available; all other
//! settings have defaults and can be set in any state.

use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::PathBuf;

use super::types::{BackendConfig, CoordinationConfig};
use crate::utils::{
    DEFAULT_CANCEL_CHECK_INTERVAL_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEASE_DURATION_MS,
    DEFAULT_LOCK_RETRY_INTERVAL_MS, DEFAULT_THROTTLE_POLL_INTERVAL_MS,
};

// Type states for the builder
pub struct WithBackend;

pub struct CoordinationConfigBuilder<State = ()> {
    pub(crate) backend: Option<BackendConfig>,
    pub(crate) lock_retry_interval_ms: u64,
    pub(crate) cancel_check_interval_ms: u64,
    pub(crate) lease_duration_ms: u64,
    pub(crate) heartbeat_interval_ms: u64,
    pub(crate) cache_class_limits: BTreeMap<String, usize>,
    pub(crate) throttle_poll_interval_ms: u64,
    pub(crate) _phantom: PhantomData<State>,
}

impl Default for CoordinationConfigBuilder<()> {
    fn default() -> Self {
        Self {
            backend: None,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            cancel_check_interval_ms: DEFAULT_CANCEL_CHECK_INTERVAL_MS,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            cache_class_limits: BTreeMap::new(),
            throttle_poll_interval_ms: DEFAULT_THROTTLE_POLL_INTERVAL_MS,
            _phantom: PhantomData,
        }
    }
}

impl CoordinationConfig {
    /// Create a builder for configuring a `CoordinationConfig` with a fluent interface
    #[must_use]
    pub fn builder() -> CoordinationConfigBuilder<()> {
        CoordinationConfigBuilder::default()
    }
}

impl CoordinationConfigBuilder<()> {
    pub fn backend(self, backend: BackendConfig) -> CoordinationConfigBuilder<WithBackend> {
        CoordinationConfigBuilder {
            backend: Some(backend),
            lock_retry_interval_ms: self.lock_retry_interval_ms,
            cancel_check_interval_ms: self.cancel_check_interval_ms,
            lease_duration_ms: self.lease_duration_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            cache_class_limits: self.cache_class_limits,
            throttle_poll_interval_ms: self.throttle_poll_interval_ms,
            _phantom: PhantomData,
        }
    }

    /// Shorthand for `backend(BackendConfig::InProcess)`
    pub fn in_process(self) -> CoordinationConfigBuilder<WithBackend> {
        self.backend(BackendConfig::InProcess)
    }

    /// Shorthand for a file backend rooted at `dir`
    pub fn synch_directory(self, dir: impl Into<PathBuf>) -> CoordinationConfigBuilder<WithBackend> {
        self.backend(BackendConfig::File {
            synch_directory: dir.into(),
        })
    }
}

impl CoordinationConfigBuilder<WithBackend> {
    /// Validate and produce the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an interval is zero, if the heartbeat is not
    /// shorter than the lease, or if an LRU class has a zero budget.
    pub fn build(self) -> Result<CoordinationConfig> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow!("backend must be configured"))?;

        if let BackendConfig::File { synch_directory } = &backend
            && synch_directory.as_os_str().is_empty()
        {
            return Err(anyhow!("synch directory must not be empty"));
        }

        for (name, value) in [
            ("lock_retry_interval_ms", self.lock_retry_interval_ms),
            ("cancel_check_interval_ms", self.cancel_check_interval_ms),
            ("lease_duration_ms", self.lease_duration_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("throttle_poll_interval_ms", self.throttle_poll_interval_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be greater than zero"));
            }
        }

        if self.heartbeat_interval_ms >= self.lease_duration_ms {
            return Err(anyhow!(
                "heartbeat interval ({}ms) must be shorter than the lease ({}ms)",
                self.heartbeat_interval_ms,
                self.lease_duration_ms
            ));
        }

        if let Some((class, _)) = self.cache_class_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(anyhow!("LRU class '{class}' must allow at least one entry"));
        }

        Ok(CoordinationConfig {
            backend,
            lock_retry_interval_ms: self.lock_retry_interval_ms,
            cancel_check_interval_ms: self.cancel_check_interval_ms,
            lease_duration_ms: self.lease_duration_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            cache_class_limits: self.cache_class_limits,
            throttle_poll_interval_ms: self.throttle_poll_interval_ms,
        })
    }
}

// Builder methods available at any state
impl<State> CoordinationConfigBuilder<State> {
    /// Set the back-off between cross-process acquisition attempts
    ///
    /// # Arguments
    /// * `ms` - Milliseconds to sleep after finding a key held by another process
    #[must_use]
    pub fn lock_retry_interval_ms(mut self, ms: u64) -> Self {
        self.lock_retry_interval_ms = ms;
        self
    }

    /// Set how often blocked callers re-check cancellation
    #[must_use]
    pub fn cancel_check_interval_ms(mut self, ms: u64) -> Self {
        self.cancel_check_interval_ms = ms;
        self
    }

    /// Set the lease on cross-process holds
    ///
    /// # Example
    /// ```rust
    /// # use crawl_coord::config::CoordinationConfig;
    /// # fn main() -> anyhow::Result<()> {
    /// let config = CoordinationConfig::builder()
    ///     .synch_directory("/var/lib/crawler/synch")
    ///     .lease_duration_ms(30_000)
    ///     .heartbeat_interval_ms(5_000)
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn lease_duration_ms(mut self, ms: u64) -> Self {
        self.lease_duration_ms = ms;
        self
    }

    #[must_use]
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Cap the number of live cache entries in an LRU class
    ///
    /// # Arguments
    /// * `class` - LRU class name as reported by cache descriptions
    /// * `max_entries` - Budget for the class (must be at least 1)
    #[must_use]
    pub fn cache_class_limit(mut self, class: impl Into<String>, max_entries: usize) -> Self {
        self.cache_class_limits.insert(class.into(), max_entries);
        self
    }

    #[must_use]
    pub fn throttle_poll_interval_ms(mut self, ms: u64) -> Self {
        self.throttle_poll_interval_ms = ms;
        self
    }
}
