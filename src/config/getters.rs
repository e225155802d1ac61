//! Getter methods for `CoordinationConfig`

use std::collections::BTreeMap;
use std::time::Duration;

use super::types::{BackendConfig, CoordinationConfig};

impl CoordinationConfig {
    #[must_use]
    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    #[must_use]
    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    #[must_use]
    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn cache_class_limits(&self) -> &BTreeMap<String, usize> {
        &self.cache_class_limits
    }

    /// Budget configured for one LRU class, if any
    #[must_use]
    pub fn cache_class_limit(&self, class: &str) -> Option<usize> {
        self.cache_class_limits.get(class).copied()
    }

    #[must_use]
    pub fn throttle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_poll_interval_ms)
    }
}
