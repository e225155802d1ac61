//! Process-wide object store behind every cache manager session

use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

use super::description::{CacheDescription, CachedObject};
use super::lru_classes::LruClasses;
use super::manager::CacheManager;
use super::StringSet;
use crate::error::CoordinationResult;
use crate::lock_manager::{CoordinationBackend, LockManager, LockSystem};
use crate::utils::CACHE_STAMP_PREFIX;

#[derive(Debug)]
struct CacheEntry {
    object: CachedObject,
    keys: StringSet,
    class: Option<String>,
    expires_at_ms: Option<i64>,
    /// Hash of the shared invalidation stamps of `keys` when the entry was saved
    stamp_fingerprint: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// cache key -> ids of entries carrying it
    key_index: HashMap<String, HashSet<String>>,
    lru: LruClasses,
    /// cache key -> number of live read holds on it
    pinned_keys: HashMap<String, usize>,
}

impl CacheState {
    fn remove(&mut self, object_id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(object_id)?;
        for key in &entry.keys {
            if let Some(ids) = self.key_index.get_mut(key) {
                ids.remove(object_id);
                if ids.is_empty() {
                    self.key_index.remove(key);
                }
            }
        }
        if let Some(class) = &entry.class {
            self.lru.remove(class, object_id);
        }
        Some(entry)
    }

    fn insert(&mut self, object_id: &str, entry: CacheEntry) {
        self.remove(object_id);
        for key in &entry.keys {
            self.key_index
                .entry(key.clone())
                .or_default()
                .insert(object_id.to_string());
        }
        if let Some(class) = &entry.class {
            self.lru.touch(class, object_id);
        }
        self.entries.insert(object_id.to_string(), entry);
    }

    fn is_pinned(&self, object_id: &str) -> bool {
        self.entries.get(object_id).is_some_and(|entry| {
            entry
                .keys
                .iter()
                .any(|key| self.pinned_keys.get(key).is_some_and(|count| *count > 0))
        })
    }
}

/// Shared cache of built objects
///
/// Entries are keyed by description object id and indexed by invalidation
/// key. Invalidation also bumps a per-key stamp in the coordination backend
/// so other processes drop their copies on next lookup.
#[derive(Debug)]
pub struct Cache {
    backend: Arc<dyn CoordinationBackend>,
    class_limits: BTreeMap<String, usize>,
    state: Mutex<CacheState>,
}

impl Cache {
    #[must_use]
    pub fn new(system: &Arc<LockSystem>) -> Arc<Self> {
        Arc::new(Self {
            backend: Arc::clone(system.backend()),
            class_limits: system.config().cache_class_limits().clone(),
            state: Mutex::new(CacheState::default()),
        })
    }

    /// A per-thread manager session using `locks` for its cache locks
    #[must_use]
    pub fn manager(self: &Arc<Self>, locks: LockManager) -> CacheManager {
        CacheManager::new(Arc::clone(self), locks)
    }

    /// Number of live entries
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Drop every entry whose expiry is at or before `now_ms`
    ///
    /// Returns how many entries were dropped.
    pub fn expire_objects(&self, now_ms: i64) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at_ms.is_some_and(|at| at <= now_ms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.remove(id);
        }
        if !expired.is_empty() {
            debug!("Expired {} cache entries", expired.len());
        }
        expired.len()
    }

    fn stamp_name(key: &str) -> String {
        format!("{CACHE_STAMP_PREFIX}{key}")
    }

    fn read_stamp(&self, key: &str) -> CoordinationResult<Option<i64>> {
        Ok(self
            .backend
            .read_data(&Self::stamp_name(key))?
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(i64::from_le_bytes))
    }

    fn fingerprint(&self, keys: &StringSet) -> CoordinationResult<u64> {
        let mut hasher = Xxh3::new();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(&self.read_stamp(key)?.unwrap_or(i64::MIN).to_le_bytes());
        }
        Ok(hasher.digest())
    }

    pub(crate) fn lookup(
        &self,
        description: &dyn CacheDescription,
        now_ms: i64,
    ) -> CoordinationResult<Option<CachedObject>> {
        let object_id = description.object_id();
        let (keys, fingerprint) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get(object_id) else {
                return Ok(None);
            };
            if entry.expires_at_ms.is_some_and(|at| at <= now_ms) {
                trace!("Cache entry '{object_id}' expired");
                state.remove(object_id);
                return Ok(None);
            }
            (entry.keys.clone(), entry.stamp_fingerprint)
        };

        let current = self.fingerprint(&keys)?;
        let mut state = self.state.lock();
        if current != fingerprint {
            trace!("Cache entry '{object_id}' invalidated by another process");
            if state
                .entries
                .get(object_id)
                .is_some_and(|entry| entry.stamp_fingerprint == fingerprint)
            {
                state.remove(object_id);
            }
            return Ok(None);
        }

        let Some(entry) = state.entries.get_mut(object_id) else {
            return Ok(None);
        };
        entry.expires_at_ms = description.expiration_time(now_ms);
        let object = Arc::clone(&entry.object);
        if let Some(class) = entry.class.clone() {
            state.lru.touch(&class, object_id);
        }
        Ok(Some(object))
    }

    pub(crate) fn save(
        &self,
        description: &dyn CacheDescription,
        object: CachedObject,
        now_ms: i64,
    ) -> CoordinationResult<()> {
        let Some(keys) = description.object_keys() else {
            return Ok(());
        };
        let stamp_fingerprint = self.fingerprint(keys)?;
        let class = description.cache_class();
        let object_id = description.object_id();

        let mut state = self.state.lock();
        state.insert(
            object_id,
            CacheEntry {
                object,
                keys: keys.clone(),
                class: class.as_ref().map(|c| c.name.clone()),
                expires_at_ms: description.expiration_time(now_ms),
                stamp_fingerprint,
            },
        );

        if let Some(class) = class {
            let budget = self
                .class_limits
                .get(&class.name)
                .copied()
                .unwrap_or(class.max_lru_count)
                .max(1);
            let pinned: HashSet<String> = state
                .entries
                .keys()
                .filter(|id| state.is_pinned(id))
                .cloned()
                .collect();
            let victims = state
                .lru
                .evict_over_budget(&class.name, budget, |id| pinned.contains(id));
            for id in victims {
                trace!("Evicting '{id}' from LRU class '{}'", class.name);
                state.remove(&id);
            }
        }
        Ok(())
    }

    /// Drop every entry carrying one of `keys` and bump the keys' shared stamps
    ///
    /// Callers hold the write locks on `keys`.
    pub(crate) fn invalidate(&self, keys: &StringSet, now_ms: i64) -> CoordinationResult<()> {
        for key in keys {
            let stamp = match self.read_stamp(key)? {
                Some(previous) if previous >= now_ms => previous + 1,
                _ => now_ms,
            };
            self.backend
                .write_data(&Self::stamp_name(key), Some(&stamp.to_le_bytes()))?;
        }

        let mut state = self.state.lock();
        let doomed: HashSet<String> = keys
            .iter()
            .filter_map(|key| state.key_index.get(key))
            .flatten()
            .cloned()
            .collect();
        for id in &doomed {
            state.remove(id);
        }
        debug!("Invalidated {keys}: dropped {} cache entries", doomed.len());
        Ok(())
    }

    pub(crate) fn pin_keys<'a>(&self, keys: impl IntoIterator<Item = &'a String>) {
        let mut state = self.state.lock();
        for key in keys {
            *state.pinned_keys.entry(key.clone()).or_default() += 1;
        }
    }

    pub(crate) fn unpin_keys<'a>(&self, keys: impl IntoIterator<Item = &'a String>) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(count) = state.pinned_keys.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.pinned_keys.remove(key);
                }
            }
        }
    }
}
