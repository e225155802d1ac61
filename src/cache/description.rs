//! What a cacheable object is and how it may be cached

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use super::StringSet;

/// A cached value; callers downcast to their concrete type
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// Named LRU class and its default entry budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheClass {
    pub name: String,
    /// Used unless the configuration overrides the class budget
    pub max_lru_count: usize,
}

/// Describes one cacheable object
///
/// Descriptions are built per lookup and never persisted. Two descriptions
/// with the same [`object_id`](Self::object_id) refer to the same entry.
pub trait CacheDescription: Send + Sync {
    /// Identity of the object within the cache
    fn object_id(&self) -> &str;

    /// Invalidation keys of the object; `None` means never cache it
    fn object_keys(&self) -> Option<&StringSet>;

    /// Critical section serialising construction of this object
    fn critical_section_name(&self) -> &str;

    /// LRU class, if the object competes for a bounded budget
    fn cache_class(&self) -> Option<CacheClass> {
        None
    }

    /// Absolute expiry in epoch milliseconds, recomputed on every hit;
    /// `None` never expires
    fn expiration_time(&self, _now_ms: i64) -> Option<i64> {
        None
    }
}

/// Ready-made description for the common cases
#[derive(Debug, Clone)]
pub struct BasicCacheDescription {
    object_id: String,
    keys: Option<StringSet>,
    section: String,
    class: Option<CacheClass>,
    time_to_live: Option<Duration>,
}

impl BasicCacheDescription {
    /// A cacheable description with the given invalidation keys
    #[must_use]
    pub fn new(object_id: impl Into<String>, keys: StringSet) -> Self {
        let object_id = object_id.into();
        Self {
            section: format!("cache-build-{object_id}"),
            object_id,
            keys: Some(keys),
            class: None,
            time_to_live: None,
        }
    }

    /// A description whose objects are always rebuilt
    #[must_use]
    pub fn uncacheable(object_id: impl Into<String>) -> Self {
        let mut description = Self::new(object_id, StringSet::new());
        description.keys = None;
        description
    }

    #[must_use]
    pub fn with_class(mut self, name: impl Into<String>, max_lru_count: usize) -> Self {
        self.class = Some(CacheClass {
            name: name.into(),
            max_lru_count,
        });
        self
    }

    #[must_use]
    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = Some(time_to_live);
        self
    }

    #[must_use]
    pub fn with_critical_section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }
}

impl CacheDescription for BasicCacheDescription {
    fn object_id(&self) -> &str {
        &self.object_id
    }

    fn object_keys(&self) -> Option<&StringSet> {
        self.keys.as_ref()
    }

    fn critical_section_name(&self) -> &str {
        &self.section
    }

    fn cache_class(&self) -> Option<CacheClass> {
        self.class.clone()
    }

    fn expiration_time(&self, now_ms: i64) -> Option<i64> {
        self.time_to_live
            .map(|ttl| now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
    }
}
