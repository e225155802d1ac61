//! Per-class recency tracking for bounded cache classes

use lru::LruCache;
use std::collections::HashMap;

/// Recency order of the entries of every LRU class
#[derive(Debug, Default)]
pub(crate) struct LruClasses {
    classes: HashMap<String, LruCache<String, ()>>,
}

impl LruClasses {
    /// Record a use of `object_id`, adding it to `class` if new
    pub(crate) fn touch(&mut self, class: &str, object_id: &str) {
        let order = self
            .classes
            .entry(class.to_string())
            .or_insert_with(LruCache::unbounded);
        if order.get(object_id).is_none() {
            order.put(object_id.to_string(), ());
        }
    }

    pub(crate) fn remove(&mut self, class: &str, object_id: &str) {
        if let Some(order) = self.classes.get_mut(class) {
            order.pop(object_id);
            if order.is_empty() {
                self.classes.remove(class);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self, class: &str) -> usize {
        self.classes.get(class).map_or(0, LruCache::len)
    }

    /// Pick entries to drop so `class` fits in `budget`
    ///
    /// Least recently used entries go first, skipping those `is_pinned`
    /// reports as in use; if only pinned entries remain, the oldest of those
    /// go. The returned ids are already removed from the class.
    pub(crate) fn evict_over_budget(
        &mut self,
        class: &str,
        budget: usize,
        is_pinned: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let Some(order) = self.classes.get_mut(class) else {
            return Vec::new();
        };
        let excess = order.len().saturating_sub(budget);
        if excess == 0 {
            return Vec::new();
        }

        let mut victims: Vec<String> = order
            .iter()
            .rev()
            .filter(|(id, _)| !is_pinned(id.as_str()))
            .take(excess)
            .map(|(id, _)| id.clone())
            .collect();
        if victims.len() < excess {
            let remaining = excess - victims.len();
            let oldest_pinned: Vec<String> = order
                .iter()
                .rev()
                .filter(|(id, _)| !victims.contains(id))
                .take(remaining)
                .map(|(id, _)| id.clone())
                .collect();
            victims.extend(oldest_pinned);
        }

        for id in &victims {
            order.pop(id.as_str());
        }
        victims
    }
}
