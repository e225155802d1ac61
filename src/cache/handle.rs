//! Handles returned by the cache manager's entry operations

use std::fmt;
use std::sync::Arc;

use super::StringSet;
use super::description::CacheDescription;

/// A cache read section: the descriptions looked up and the locks taken
///
/// Obtained from [`CacheManager::enter_cache`](super::CacheManager::enter_cache)
/// and consumed by [`CacheManager::leave_cache`](super::CacheManager::leave_cache).
pub struct CacheHandle {
    pub(crate) descriptions: Vec<Arc<dyn CacheDescription>>,
    pub(crate) invalidation_keys: StringSet,
    pub(crate) transaction_id: Option<String>,
    /// Keys read-locked by this handle itself; empty inside a transaction,
    /// which retains its locks
    pub(crate) read_keys: Vec<String>,
    pub(crate) write_keys: Vec<String>,
}

impl CacheHandle {
    #[must_use]
    pub fn descriptions(&self) -> &[Arc<dyn CacheDescription>] {
        &self.descriptions
    }

    #[must_use]
    pub fn invalidation_keys(&self) -> &StringSet {
        &self.invalidation_keys
    }

    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field(
                "descriptions",
                &self
                    .descriptions
                    .iter()
                    .map(|d| d.object_id())
                    .collect::<Vec<_>>(),
            )
            .field("invalidation_keys", &self.invalidation_keys)
            .field("transaction_id", &self.transaction_id)
            .field("read_keys", &self.read_keys)
            .field("write_keys", &self.write_keys)
            .finish()
    }
}

/// Held build sections for the descriptions of one [`CacheHandle`]
#[derive(Debug)]
pub struct CacheCreateHandle {
    pub(crate) sections: Vec<String>,
}
