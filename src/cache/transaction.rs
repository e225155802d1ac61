//! Cache transactions: locks, invalidations and objects held until commit

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::StringSet;
use super::description::{CacheDescription, CachedObject};

pub(crate) struct LocalObject {
    pub(crate) object: CachedObject,
    pub(crate) description: Arc<dyn CacheDescription>,
}

impl LocalObject {
    fn keys(&self) -> Option<&StringSet> {
        self.description.object_keys()
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObject")
            .field("object_id", &self.description.object_id())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheTransaction {
    pub(crate) parent: Option<String>,
    pub(crate) read_keys: HashSet<String>,
    pub(crate) write_keys: HashSet<String>,
    pub(crate) invalidated: StringSet,
    pub(crate) local_objects: HashMap<String, LocalObject>,
}

impl CacheTransaction {
    pub(crate) fn new(parent: Option<String>) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    /// Defer an invalidation to commit, dropping local objects it affects
    pub(crate) fn record_invalidation(&mut self, keys: &StringSet) {
        self.local_objects
            .retain(|_, local| !local.keys().is_some_and(|k| k.intersects(keys)));
        self.invalidated = self.invalidated.union(keys);
    }

    /// Merge a committed child into this transaction
    pub(crate) fn absorb(&mut self, child: CacheTransaction) {
        self.record_invalidation(&child.invalidated);
        self.read_keys.extend(child.read_keys);
        self.write_keys.extend(child.write_keys);
        self.local_objects.extend(child.local_objects);
    }
}
