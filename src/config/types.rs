//! Core configuration types for coordination
//!
//! This module contains the `CoordinationConfig` struct and the backend
//! selection enum resolved once at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::utils::{
    DEFAULT_CANCEL_CHECK_INTERVAL_MS, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEASE_DURATION_MS,
    DEFAULT_LOCK_RETRY_INTERVAL_MS, DEFAULT_THROTTLE_POLL_INTERVAL_MS,
};

/// Which coordination backend carries cross-process state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Single process: locks, flags and data live in memory
    InProcess,
    /// Single host, many processes: state lives under a shared directory
    File {
        /// Directory shared by every cooperating process
        synch_directory: PathBuf,
    },
}

/// Main configuration struct for a coordination system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    pub(crate) backend: BackendConfig,

    /// Back-off between cross-process acquisition attempts
    ///
    /// Default: 10ms
    pub(crate) lock_retry_interval_ms: u64,

    /// Longest uninterrupted sleep of a blocked caller before it re-checks
    /// its cancellation token
    ///
    /// Default: 100ms
    pub(crate) cancel_check_interval_ms: u64,

    /// Lifetime of a cross-process hold that is not renewed
    ///
    /// Default: 60 seconds
    pub(crate) lease_duration_ms: u64,

    /// How often the housekeeper renews this process's leases
    ///
    /// Default: 15 seconds
    pub(crate) heartbeat_interval_ms: u64,

    /// Entry budgets per cache LRU class, overriding the budget carried by
    /// the cache descriptions
    pub(crate) cache_class_limits: BTreeMap<String, usize>,

    /// How often the housekeeper re-apportions throttle limits
    ///
    /// Default: 5 seconds
    pub(crate) throttle_poll_interval_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::InProcess,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            cancel_check_interval_ms: DEFAULT_CANCEL_CHECK_INTERVAL_MS,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            cache_class_limits: BTreeMap::new(),
            throttle_poll_interval_ms: DEFAULT_THROTTLE_POLL_INTERVAL_MS,
        }
    }
}
