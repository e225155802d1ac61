//! Per-thread cache sessions

use log::{debug, warn};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use super::description::{CacheDescription, CachedObject};
use super::executor::CacheExecutor;
use super::handle::{CacheCreateHandle, CacheHandle};
use super::store::Cache;
use super::transaction::{CacheTransaction, LocalObject};
use super::StringSet;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockManager;
use crate::utils::{CACHE_LOCK_PREFIX, now_ms};

fn lock_names(keys: &[String]) -> Vec<String> {
    keys.iter()
        .map(|key| format!("{CACHE_LOCK_PREFIX}{key}"))
        .collect()
}

/// One thread's view of a shared [`Cache`]
///
/// Lookups run inside a cache section: [`enter_cache`](Self::enter_cache)
/// read-locks the keys of the descriptions (and write-locks any keys the
/// caller is about to invalidate), so no writer can invalidate an object
/// while it is being looked up or built. Misses are built inside the
/// descriptions' write critical sections, so one thread per process builds a
/// given object and the rest reuse it.
#[derive(Debug)]
pub struct CacheManager {
    cache: Arc<Cache>,
    locks: LockManager,
    transactions: HashMap<String, CacheTransaction>,
}

impl CacheManager {
    pub(crate) fn new(cache: Arc<Cache>, locks: LockManager) -> Self {
        Self {
            cache,
            locks,
            transactions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// The lock session used for cache locks, shared with the caller's own
    /// locking so reentrancy works across both
    pub fn lock_manager(&mut self) -> &mut LockManager {
        &mut self.locks
    }

    fn chain(&self, transaction_id: Option<&str>) -> CoordinationResult<Vec<&CacheTransaction>> {
        let mut chain = Vec::new();
        let mut next = transaction_id.map(str::to_string);
        while let Some(id) = next {
            let txn = self
                .transactions
                .get(&id)
                .ok_or_else(|| CoordinationError::Setup(format!("Unknown cache transaction '{id}'")))?;
            next = txn.parent.clone();
            chain.push(txn);
        }
        Ok(chain)
    }

    /// Lock the keys of `descriptions` for read and `invalidation_keys` for
    /// write, returning the section's handle
    ///
    /// Inside a transaction only keys the transaction chain does not hold yet
    /// are locked, and the transaction keeps them until it ends.
    ///
    /// # Errors
    ///
    /// `IllegalSequence` if an invalidation key is already read-locked by the
    /// transaction, `Setup` for an unknown transaction.
    pub fn enter_cache(
        &mut self,
        descriptions: &[Arc<dyn CacheDescription>],
        invalidation_keys: Option<&StringSet>,
        transaction_id: Option<&str>,
    ) -> CoordinationResult<CacheHandle> {
        let invalidation_keys = invalidation_keys.cloned().unwrap_or_default();
        let object_keys = descriptions
            .iter()
            .filter_map(|d| d.object_keys())
            .fold(StringSet::new(), |acc, keys| acc.union(keys));
        let wanted_reads = object_keys.difference(&invalidation_keys);

        let (read_keys, write_keys) = {
            let chain = self.chain(transaction_id)?;
            let mut write_keys = Vec::new();
            for key in invalidation_keys.iter() {
                if chain.iter().any(|t| t.write_keys.contains(key)) {
                    continue;
                }
                if chain.iter().any(|t| t.read_keys.contains(key)) {
                    return Err(CoordinationError::illegal(
                        key,
                        "can't invalidate a cache key the transaction holds for read",
                    ));
                }
                write_keys.push(key.to_string());
            }
            let read_keys: Vec<String> = wanted_reads
                .iter()
                .filter(|key| {
                    !chain
                        .iter()
                        .any(|t| t.read_keys.contains(*key) || t.write_keys.contains(*key))
                })
                .map(str::to_string)
                .collect();
            (read_keys, write_keys)
        };

        let none: [&str; 0] = [];
        self.locks
            .enter_locks(lock_names(&read_keys), none, lock_names(&write_keys))?;
        self.cache.pin_keys(&read_keys);

        let mut handle = CacheHandle {
            descriptions: descriptions.to_vec(),
            invalidation_keys,
            transaction_id: transaction_id.map(str::to_string),
            read_keys: Vec::new(),
            write_keys: Vec::new(),
        };
        match transaction_id.and_then(|id| self.transactions.get_mut(id)) {
            Some(txn) => {
                txn.read_keys.extend(read_keys);
                txn.write_keys.extend(write_keys);
            }
            None => {
                handle.read_keys = read_keys;
                handle.write_keys = write_keys;
            }
        }
        Ok(handle)
    }

    /// Enter the build critical sections of the handle's cacheable descriptions
    pub fn enter_create_section(&mut self, handle: &CacheHandle) -> CoordinationResult<CacheCreateHandle> {
        let sections: Vec<String> = handle
            .descriptions
            .iter()
            .filter(|d| d.object_keys().is_some())
            .map(|d| d.critical_section_name().to_string())
            .collect();
        let none: [&str; 0] = [];
        self.locks.enter_critical_sections(none, none, &sections)?;
        Ok(CacheCreateHandle { sections })
    }

    pub fn leave_create_section(&mut self, create: CacheCreateHandle) -> CoordinationResult<()> {
        let none: [&str; 0] = [];
        self.locks
            .leave_critical_sections(none, none, &create.sections)
    }

    /// Find the cached object for `description`
    ///
    /// Inside a transaction, objects built by the transaction chain win, and
    /// shared objects touched by the chain's pending invalidations are hidden.
    pub fn lookup_object(
        &self,
        handle: &CacheHandle,
        description: &Arc<dyn CacheDescription>,
    ) -> CoordinationResult<Option<CachedObject>> {
        let Some(keys) = description.object_keys() else {
            return Ok(None);
        };
        let now = now_ms();
        for txn in self.chain(handle.transaction_id())? {
            if let Some(local) = txn.local_objects.get(description.object_id()) {
                return Ok(Some(Arc::clone(&local.object)));
            }
            if txn.invalidated.intersects(keys) {
                return Ok(None);
            }
        }
        self.cache.lookup(description.as_ref(), now)
    }

    /// Store a freshly built object; uncacheable descriptions are ignored
    pub fn save_object(
        &mut self,
        handle: &CacheHandle,
        description: &Arc<dyn CacheDescription>,
        object: CachedObject,
    ) -> CoordinationResult<()> {
        if description.object_keys().is_none() {
            return Ok(());
        }
        match handle
            .transaction_id()
            .and_then(|id| self.transactions.get_mut(id))
        {
            Some(txn) => {
                txn.local_objects.insert(
                    description.object_id().to_string(),
                    LocalObject {
                        object,
                        description: Arc::clone(description),
                    },
                );
                Ok(())
            }
            None => self.cache.save(description.as_ref(), object, now_ms()),
        }
    }

    /// Invalidate the handle's invalidation keys, or defer them to commit
    /// inside a transaction
    pub fn invalidate_keys(&mut self, handle: &CacheHandle) -> CoordinationResult<()> {
        if handle.invalidation_keys.is_empty() {
            return Ok(());
        }
        match handle
            .transaction_id()
            .and_then(|id| self.transactions.get_mut(id))
        {
            Some(txn) => {
                txn.record_invalidation(&handle.invalidation_keys);
                Ok(())
            }
            None => self.cache.invalidate(&handle.invalidation_keys, now_ms()),
        }
    }

    /// Release the locks the handle took outside a transaction
    pub fn leave_cache(&mut self, handle: CacheHandle) -> CoordinationResult<()> {
        self.cache.unpin_keys(&handle.read_keys);
        let none: [&str; 0] = [];
        self.locks.leave_locks(
            lock_names(&handle.read_keys),
            none,
            lock_names(&handle.write_keys),
        )
    }

    /// Resolve every description through `executor`, building misses, then
    /// run it and invalidate `invalidation_keys`
    pub fn find_objects_and_execute(
        &mut self,
        descriptions: &[Arc<dyn CacheDescription>],
        invalidation_keys: Option<&StringSet>,
        executor: &mut dyn CacheExecutor,
        transaction_id: Option<&str>,
    ) -> CoordinationResult<()> {
        let handle = self.enter_cache(descriptions, invalidation_keys, transaction_id)?;
        let outcome = self.execute_in_section(&handle, executor);
        let left = self.leave_cache(handle);
        outcome?;
        left
    }

    fn execute_in_section(
        &mut self,
        handle: &CacheHandle,
        executor: &mut dyn CacheExecutor,
    ) -> CoordinationResult<()> {
        let mut missing = Vec::new();
        for description in &handle.descriptions {
            match self.lookup_object(handle, description)? {
                Some(object) => executor.exists(description.as_ref(), &object)?,
                None => missing.push(Arc::clone(description)),
            }
        }

        if !missing.is_empty() {
            let create = self.enter_create_section(handle)?;
            let built = self.build_missing(handle, &missing, executor);
            let left = self.leave_create_section(create);
            built?;
            left?;
        }

        executor.execute()?;
        self.invalidate_keys(handle)
    }

    fn build_missing(
        &mut self,
        handle: &CacheHandle,
        missing: &[Arc<dyn CacheDescription>],
        executor: &mut dyn CacheExecutor,
    ) -> CoordinationResult<()> {
        let mut to_create = Vec::new();
        for description in missing {
            match self.lookup_object(handle, description)? {
                Some(object) => executor.exists(description.as_ref(), &object)?,
                None => to_create.push(Arc::clone(description)),
            }
        }
        if to_create.is_empty() {
            return Ok(());
        }

        let requested: Vec<&dyn CacheDescription> = to_create
            .iter()
            .map(|d| &**d as &dyn CacheDescription)
            .collect();
        let objects = executor.create(&requested)?;
        if objects.len() != to_create.len() {
            return Err(CoordinationError::Setup(format!(
                "Cache executor built {} objects for {} descriptions",
                objects.len(),
                to_create.len()
            )));
        }
        for (description, object) in to_create.iter().zip(objects) {
            self.save_object(handle, description, Arc::clone(&object))?;
            executor.exists(description.as_ref(), &object)?;
        }
        Ok(())
    }

    /// Return the cached object for `description`, building it with `build`
    /// on a miss
    ///
    /// # Errors
    ///
    /// Propagates the builder's error (nothing is cached then), and returns
    /// `Corrupt` if the cached object is not a `T`.
    pub fn lookup_or_build<T, F>(&mut self, description: Arc<dyn CacheDescription>, build: F) -> CoordinationResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> CoordinationResult<T>,
    {
        let handle = self.enter_cache(std::slice::from_ref(&description), None, None)?;
        let outcome = self.lookup_or_build_in_section(&handle, &description, build);
        let left = self.leave_cache(handle);
        let object = outcome?;
        left?;
        Arc::downcast::<T>(object).map_err(|_| {
            CoordinationError::corrupt(description.object_id(), "cached object has an unexpected type")
        })
    }

    fn lookup_or_build_in_section<T, F>(
        &mut self,
        handle: &CacheHandle,
        description: &Arc<dyn CacheDescription>,
        build: F,
    ) -> CoordinationResult<CachedObject>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> CoordinationResult<T>,
    {
        if let Some(object) = self.lookup_object(handle, description)? {
            return Ok(object);
        }
        let create = self.enter_create_section(handle)?;
        let built = match self.lookup_object(handle, description) {
            Ok(Some(object)) => Ok(object),
            Ok(None) => build().and_then(|value| {
                let object: CachedObject = Arc::new(value);
                self.save_object(handle, description, Arc::clone(&object))?;
                Ok(object)
            }),
            Err(e) => Err(e),
        };
        let left = self.leave_create_section(create);
        let object = built?;
        left?;
        Ok(object)
    }

    // ----- transactions --------------------------------------------------

    /// Begin a transaction, nested in `parent` if given
    pub fn start_transaction(&mut self, transaction_id: &str, parent: Option<&str>) -> CoordinationResult<()> {
        if self.transactions.contains_key(transaction_id) {
            return Err(CoordinationError::Setup(format!(
                "Cache transaction '{transaction_id}' already exists"
            )));
        }
        if let Some(parent) = parent
            && !self.transactions.contains_key(parent)
        {
            return Err(CoordinationError::Setup(format!(
                "Parent cache transaction '{parent}' does not exist"
            )));
        }
        debug!("Starting cache transaction '{transaction_id}'");
        self.transactions.insert(
            transaction_id.to_string(),
            CacheTransaction::new(parent.map(str::to_string)),
        );
        Ok(())
    }

    /// Commit a transaction
    ///
    /// A nested transaction folds into its parent. A top-level one performs
    /// its invalidations, publishes the objects it built and releases its
    /// locks.
    pub fn commit_transaction(&mut self, transaction_id: &str) -> CoordinationResult<()> {
        let txn = self.take_transaction(transaction_id)?;
        if let Some(parent_id) = txn.parent.clone() {
            let parent = self.transactions.get_mut(&parent_id).ok_or_else(|| {
                CoordinationError::Setup(format!("Parent cache transaction '{parent_id}' does not exist"))
            })?;
            parent.absorb(txn);
            return Ok(());
        }

        let now = now_ms();
        let mut outcome = if txn.invalidated.is_empty() {
            Ok(())
        } else {
            self.cache.invalidate(&txn.invalidated, now)
        };
        if outcome.is_ok() {
            for local in txn.local_objects.values() {
                if let Err(e) = self.cache.save(local.description.as_ref(), Arc::clone(&local.object), now) {
                    outcome = Err(e);
                    break;
                }
            }
        }
        let released = self.release_transaction_locks(&txn);
        outcome?;
        released
    }

    /// Abandon a transaction: discard its objects and pending invalidations
    /// and release its locks
    pub fn rollback_transaction(&mut self, transaction_id: &str) -> CoordinationResult<()> {
        let txn = self.take_transaction(transaction_id)?;
        debug!("Rolling back cache transaction '{transaction_id}'");
        self.release_transaction_locks(&txn)
    }

    fn take_transaction(&mut self, transaction_id: &str) -> CoordinationResult<CacheTransaction> {
        if self
            .transactions
            .values()
            .any(|t| t.parent.as_deref() == Some(transaction_id))
        {
            return Err(CoordinationError::Setup(format!(
                "Cache transaction '{transaction_id}' still has open children"
            )));
        }
        self.transactions.remove(transaction_id).ok_or_else(|| {
            CoordinationError::Setup(format!("Unknown cache transaction '{transaction_id}'"))
        })
    }

    fn release_transaction_locks(&mut self, txn: &CacheTransaction) -> CoordinationResult<()> {
        let read_keys: Vec<String> = txn.read_keys.iter().cloned().collect();
        let write_keys: Vec<String> = txn.write_keys.iter().cloned().collect();
        self.cache.unpin_keys(&read_keys);
        let none: [&str; 0] = [];
        self.locks
            .leave_locks(lock_names(&read_keys), none, lock_names(&write_keys))
    }

    /// Drop expired entries from the shared cache
    pub fn expire_objects(&self, now_ms: i64) -> usize {
        self.cache.expire_objects(now_ms)
    }

    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache.cache_size()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let open: Vec<CacheTransaction> = self.transactions.drain().map(|(_, txn)| txn).collect();
        for txn in &open {
            if let Err(e) = self.release_transaction_locks(txn) {
                warn!("Failed to release locks of abandoned cache transaction: {e}");
            }
        }
    }
}
