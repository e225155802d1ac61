//! Process-wide lock objects
//!
//! One [`LockObject`] exists per key while anyone in the process holds or
//! waits for it. It counts holders of each kind across all sessions and takes
//! the backend's global hold on the first local holder of a kind. Objects are
//! dropped from their [`LockPool`] the moment they become free; a thread that
//! fetched an object just before that finds it retired and fetches again.
//!
//! Lock order: object state, then pool map. `LockPool::get` never touches an
//! object's state, so the two cannot deadlock.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::LockKind;
use super::backend::CoordinationBackend;
use crate::cancel::CancelToken;
use crate::error::{CoordinationError, CoordinationResult};

/// Waiting parameters shared by every acquisition in a lock system
#[derive(Debug, Clone, Copy)]
pub(crate) struct LockTiming {
    /// Back-off after a conflicting cross-process hold
    pub retry_interval: Duration,
    /// Slice between cancellation checks
    pub check_interval: Duration,
}

#[derive(Debug, Default)]
struct LockState {
    read: u32,
    non_ex_write: u32,
    write: bool,
    retired: bool,
}

impl LockState {
    fn admits(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Read => !self.write && self.non_ex_write == 0,
            LockKind::NonExWrite => !self.write && self.read == 0,
            LockKind::Write => self.is_free(),
        }
    }

    fn count(&self, kind: LockKind) -> u32 {
        match kind {
            LockKind::Read => self.read,
            LockKind::NonExWrite => self.non_ex_write,
            LockKind::Write => u32::from(self.write),
        }
    }

    fn increment(&mut self, kind: LockKind) {
        match kind {
            LockKind::Read => self.read += 1,
            LockKind::NonExWrite => self.non_ex_write += 1,
            LockKind::Write => self.write = true,
        }
    }

    fn decrement(&mut self, kind: LockKind) {
        match kind {
            LockKind::Read => self.read -= 1,
            LockKind::NonExWrite => self.non_ex_write -= 1,
            LockKind::Write => self.write = false,
        }
    }

    fn is_free(&self) -> bool {
        !self.write && self.read == 0 && self.non_ex_write == 0
    }
}

#[derive(Debug)]
pub(crate) struct LockObject {
    key: String,
    state: Mutex<LockState>,
    changed: Condvar,
}

impl LockObject {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
        }
    }

    /// Returns `Ok(false)` if the object was retired and must be re-fetched
    fn enter(
        &self,
        pool: &LockPool,
        kind: LockKind,
        no_wait: bool,
        cancel: &CancelToken,
        timing: LockTiming,
    ) -> CoordinationResult<bool> {
        let mut state = self.state.lock();
        loop {
            if state.retired {
                return Ok(false);
            }

            if state.admits(kind) {
                if state.count(kind) == 0
                    && let Some(backend) = pool.backend.as_deref()
                {
                    match backend.try_acquire(&self.key, kind) {
                        Ok(true) => {}
                        Ok(false) if no_wait => {
                            self.retire_if_free(&mut state, pool);
                            return Err(CoordinationError::LockUnavailable(self.key.clone()));
                        }
                        Ok(false) => {
                            let waited = cancel.wait_on(
                                &self.changed,
                                &mut state,
                                Some(timing.retry_interval),
                                timing.check_interval,
                            );
                            if let Err(e) = waited {
                                self.retire_if_free(&mut state, pool);
                                return Err(e);
                            }
                            continue;
                        }
                        Err(e) => {
                            warn!("Backend failed to grant {kind} lock '{}': {e}", self.key);
                            self.retire_if_free(&mut state, pool);
                            return Err(e);
                        }
                    }
                }
                state.increment(kind);
                return Ok(true);
            }

            if no_wait {
                return Err(CoordinationError::LockUnavailable(self.key.clone()));
            }
            if let Err(e) = cancel.wait_on(&self.changed, &mut state, None, timing.check_interval) {
                self.retire_if_free(&mut state, pool);
                return Err(e);
            }
        }
    }

    fn leave(&self, pool: &LockPool, kind: LockKind) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        if state.count(kind) == 0 {
            return Err(CoordinationError::illegal(
                &self.key,
                format!("{kind} lock released but not held"),
            ));
        }
        state.decrement(kind);

        let mut result = Ok(());
        if state.count(kind) == 0
            && let Some(backend) = pool.backend.as_deref()
            && let Err(e) = backend.release(&self.key, kind)
        {
            warn!("Backend failed to release {kind} lock '{}': {e}", self.key);
            result = Err(e);
        }

        self.retire_if_free(&mut state, pool);
        self.changed.notify_all();
        result
    }

    fn retire_if_free(&self, state: &mut MutexGuard<'_, LockState>, pool: &LockPool) {
        if state.is_free() && !state.retired {
            state.retired = true;
            pool.remove(&self.key, self);
            self.changed.notify_all();
        }
    }
}

/// Keyed pool of live lock objects
///
/// The lock pool carries a backend and so grants cross-process locks; the
/// critical-section pool has none and only excludes threads of this process.
#[derive(Debug)]
pub(crate) struct LockPool {
    objects: Mutex<HashMap<String, Arc<LockObject>>>,
    backend: Option<Arc<dyn CoordinationBackend>>,
}

impl LockPool {
    pub(crate) fn new(backend: Option<Arc<dyn CoordinationBackend>>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            backend,
        }
    }

    fn get(&self, key: &str) -> Arc<LockObject> {
        self.objects
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockObject::new(key)))
            .clone()
    }

    fn remove(&self, key: &str, object: &LockObject) {
        let mut objects = self.objects.lock();
        if objects
            .get(key)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), object))
        {
            objects.remove(key);
        }
    }

    /// Block (or fail, if `no_wait`) until `kind` is granted on `key`
    pub(crate) fn enter(
        &self,
        key: &str,
        kind: LockKind,
        no_wait: bool,
        cancel: &CancelToken,
        timing: LockTiming,
    ) -> CoordinationResult<()> {
        loop {
            let object = self.get(key);
            if object.enter(self, kind, no_wait, cancel, timing)? {
                return Ok(());
            }
            debug!("Lock object for '{key}' retired while waiting; refetching");
        }
    }

    pub(crate) fn leave(&self, key: &str, kind: LockKind) -> CoordinationResult<()> {
        let object = self.objects.lock().get(key).cloned();
        match object {
            Some(object) => object.leave(self, kind),
            None => Err(CoordinationError::illegal(
                key,
                format!("{kind} lock released but not held"),
            )),
        }
    }

    /// Number of keys currently held or waited on
    pub(crate) fn live_objects(&self) -> usize {
        self.objects.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> LockTiming {
        LockTiming {
            retry_interval: Duration::from_millis(5),
            check_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_objects_are_retired_when_free() {
        let pool = LockPool::new(None);
        let cancel = CancelToken::new();
        pool.enter("a", LockKind::Read, false, &cancel, timing()).expect("read");
        pool.enter("a", LockKind::Read, false, &cancel, timing()).expect("read");
        assert_eq!(pool.live_objects(), 1);
        pool.leave("a", LockKind::Read).expect("leave");
        assert_eq!(pool.live_objects(), 1);
        pool.leave("a", LockKind::Read).expect("leave");
        assert_eq!(pool.live_objects(), 0);
    }

    #[test]
    fn test_no_wait_conflicts() {
        let pool = LockPool::new(None);
        let cancel = CancelToken::new();
        pool.enter("a", LockKind::NonExWrite, false, &cancel, timing()).expect("nonex");
        pool.enter("a", LockKind::NonExWrite, true, &cancel, timing()).expect("nonex shares");
        assert!(matches!(
            pool.enter("a", LockKind::Read, true, &cancel, timing()),
            Err(CoordinationError::LockUnavailable(_))
        ));
        assert!(matches!(
            pool.enter("a", LockKind::Write, true, &cancel, timing()),
            Err(CoordinationError::LockUnavailable(_))
        ));
    }

    #[test]
    fn test_release_unheld_is_illegal() {
        let pool = LockPool::new(None);
        assert!(matches!(
            pool.leave("missing", LockKind::Write),
            Err(CoordinationError::IllegalSequence { .. })
        ));
    }

    #[test]
    fn test_cancelled_waiter_leaves_no_residue() {
        let pool = Arc::new(LockPool::new(None));
        let cancel = CancelToken::new();
        pool.enter("a", LockKind::Write, false, &cancel, timing()).expect("write");

        let waiter_cancel = CancelToken::new();
        let remote = waiter_cancel.clone();
        let waiter_pool = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            waiter_pool.enter("a", LockKind::Read, false, &remote, timing())
        });
        std::thread::sleep(Duration::from_millis(50));
        waiter_cancel.cancel();
        let result = waiter.join().expect("waiter panicked");
        assert!(matches!(result, Err(CoordinationError::Interrupted)));

        pool.leave("a", LockKind::Write).expect("leave");
        assert_eq!(pool.live_objects(), 0);
    }
}
