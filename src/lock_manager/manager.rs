//! Per-thread lock manager sessions

use log::{trace, warn};
use std::sync::Arc;
use std::time::Duration;

use super::backend::FlagLifetime;
use super::local_locks::{LocalLocks, Reentry};
use super::lock_kind::{LockKind, LockRequest, sorted_unique_requests};
use super::lock_object::LockPool;
use super::system::LockSystem;
use crate::cancel::CancelToken;
use crate::error::CoordinationResult;

#[derive(Debug, Clone, Copy)]
enum Namespace {
    Lock,
    Section,
}

impl Namespace {
    fn label(self) -> &'static str {
        match self {
            Namespace::Lock => "lock",
            Namespace::Section => "critical section",
        }
    }
}

/// A session against a [`LockSystem`]
///
/// Sessions are owned by one thread at a time and track reentrant holds:
/// entering a key the session already holds in a compatible mode only bumps
/// a counter. Every enter must be matched by a leave of the same kind; the
/// underlying hold is released when the last one is left. Dropping a session
/// releases whatever it still holds.
#[derive(Debug)]
pub struct LockManager {
    system: Arc<LockSystem>,
    cancel: CancelToken,
    local_locks: LocalLocks,
    local_sections: LocalLocks,
}

impl LockManager {
    pub(crate) fn new(system: Arc<LockSystem>, cancel: CancelToken) -> Self {
        Self {
            system,
            cancel,
            local_locks: LocalLocks::default(),
            local_sections: LocalLocks::default(),
        }
    }

    #[must_use]
    pub fn system(&self) -> &Arc<LockSystem> {
        &self.system
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Number of distinct lock keys this session holds
    #[must_use]
    pub fn held_lock_count(&self) -> usize {
        self.local_locks.len()
    }

    /// Kind of this session's hold on `key`, if any
    #[must_use]
    pub fn held_lock_kind(&self, key: &str) -> Option<LockKind> {
        self.local_locks.held_kind(key)
    }

    fn parts(&mut self, namespace: Namespace) -> (&mut LocalLocks, &LockPool) {
        match namespace {
            Namespace::Lock => (&mut self.local_locks, &self.system.locks),
            Namespace::Section => (&mut self.local_sections, &self.system.sections),
        }
    }

    fn enter(
        &mut self,
        namespace: Namespace,
        key: &str,
        kind: LockKind,
        no_wait: bool,
    ) -> CoordinationResult<()> {
        let timing = self.system.timing;
        let cancel = self.cancel.clone();
        let (local, pool) = self.parts(namespace);
        if local.plan_enter(key, kind)? == Reentry::Fresh {
            trace!("Entering {kind} {} '{key}'", namespace.label());
            pool.enter(key, kind, no_wait, &cancel, timing)?;
        }
        local.record_enter(key, kind);
        Ok(())
    }

    fn leave(&mut self, namespace: Namespace, key: &str, kind: LockKind) -> CoordinationResult<()> {
        let (local, pool) = self.parts(namespace);
        if let Some(held) = local.record_leave(key, kind)? {
            trace!("Leaving {held} {} '{key}'", namespace.label());
            pool.leave(key, held)?;
        }
        Ok(())
    }

    fn enter_batch(
        &mut self,
        namespace: Namespace,
        requests: Vec<LockRequest>,
        no_wait: bool,
    ) -> CoordinationResult<()> {
        let mut entered: Vec<LockRequest> = Vec::with_capacity(requests.len());
        for request in requests {
            match self.enter(namespace, &request.key, request.kind, no_wait) {
                Ok(()) => entered.push(request),
                Err(e) => {
                    for done in entered.iter().rev() {
                        if let Err(undo) = self.leave(namespace, &done.key, done.kind) {
                            warn!(
                                "Failed to back out {} {} '{}': {undo}",
                                done.kind,
                                namespace.label(),
                                done.key
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn leave_batch(
        &mut self,
        namespace: Namespace,
        requests: Vec<LockRequest>,
    ) -> CoordinationResult<()> {
        let mut outcome = Ok(());
        for request in requests.iter().rev() {
            if let Err(e) = self.leave(namespace, &request.key, request.kind) {
                warn!("Failed to leave {} '{}': {e}", namespace.label(), request.key);
                outcome = Err(e);
            }
        }
        outcome
    }

    // ----- locks ---------------------------------------------------------

    /// Block until a write lock on `key` is held
    ///
    /// # Errors
    ///
    /// `IllegalSequence` if the session holds `key` only for read or
    /// non-ex-write, `Interrupted` if cancelled while waiting.
    pub fn enter_write_lock(&mut self, key: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Lock, key, LockKind::Write, false)
    }

    /// Like [`enter_write_lock`](Self::enter_write_lock) but fails with
    /// `LockUnavailable` instead of waiting
    pub fn enter_write_lock_no_wait(&mut self, key: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Lock, key, LockKind::Write, true)
    }

    pub fn leave_write_lock(&mut self, key: &str) -> CoordinationResult<()> {
        self.leave(Namespace::Lock, key, LockKind::Write)
    }

    pub fn enter_non_ex_write_lock(&mut self, key: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Lock, key, LockKind::NonExWrite, false)
    }

    pub fn enter_non_ex_write_lock_no_wait(&mut self, key: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Lock, key, LockKind::NonExWrite, true)
    }

    pub fn leave_non_ex_write_lock(&mut self, key: &str) -> CoordinationResult<()> {
        self.leave(Namespace::Lock, key, LockKind::NonExWrite)
    }

    pub fn enter_read_lock(&mut self, key: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Lock, key, LockKind::Read, false)
    }

    pub fn enter_read_lock_no_wait(&mut self, key: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Lock, key, LockKind::Read, true)
    }

    pub fn leave_read_lock(&mut self, key: &str) -> CoordinationResult<()> {
        self.leave(Namespace::Lock, key, LockKind::Read)
    }

    /// Acquire a batch of locks in one deadlock-free step
    ///
    /// Keys named in several lists are taken once, in the most restrictive
    /// kind. Keys are acquired in sorted order; on failure everything taken
    /// so far is released again before the error is returned.
    pub fn enter_locks<R, N, W>(&mut self, read: R, non_ex_write: N, write: W) -> CoordinationResult<()>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let requests = sorted_unique_requests(read, non_ex_write, write);
        self.enter_batch(Namespace::Lock, requests, false)
    }

    pub fn enter_locks_no_wait<R, N, W>(
        &mut self,
        read: R,
        non_ex_write: N,
        write: W,
    ) -> CoordinationResult<()>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let requests = sorted_unique_requests(read, non_ex_write, write);
        self.enter_batch(Namespace::Lock, requests, true)
    }

    /// Release a batch taken with [`enter_locks`](Self::enter_locks), called
    /// with the same lists
    ///
    /// Every key is attempted; the last failure is reported.
    pub fn leave_locks<R, N, W>(&mut self, read: R, non_ex_write: N, write: W) -> CoordinationResult<()>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let requests = sorted_unique_requests(read, non_ex_write, write);
        self.leave_batch(Namespace::Lock, requests)
    }

    /// Release every lock this session holds, regardless of nesting depth
    pub fn clear_locks(&mut self) -> CoordinationResult<()> {
        let mut outcome = Ok(());
        for (key, held) in self.local_locks.drain() {
            if let Err(e) = self.system.locks.leave(&key, held) {
                warn!("Failed to clear {held} lock '{key}': {e}");
                outcome = Err(e);
            }
        }
        outcome
    }

    // ----- critical sections ---------------------------------------------

    pub fn enter_read_critical_section(&mut self, name: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Section, name, LockKind::Read, false)
    }

    pub fn leave_read_critical_section(&mut self, name: &str) -> CoordinationResult<()> {
        self.leave(Namespace::Section, name, LockKind::Read)
    }

    pub fn enter_non_ex_write_critical_section(&mut self, name: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Section, name, LockKind::NonExWrite, false)
    }

    pub fn leave_non_ex_write_critical_section(&mut self, name: &str) -> CoordinationResult<()> {
        self.leave(Namespace::Section, name, LockKind::NonExWrite)
    }

    pub fn enter_write_critical_section(&mut self, name: &str) -> CoordinationResult<()> {
        self.enter(Namespace::Section, name, LockKind::Write, false)
    }

    pub fn leave_write_critical_section(&mut self, name: &str) -> CoordinationResult<()> {
        self.leave(Namespace::Section, name, LockKind::Write)
    }

    /// Batch form of the critical-section entries, ordered like
    /// [`enter_locks`](Self::enter_locks)
    pub fn enter_critical_sections<R, N, W>(
        &mut self,
        read: R,
        non_ex_write: N,
        write: W,
    ) -> CoordinationResult<()>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let requests = sorted_unique_requests(read, non_ex_write, write);
        self.enter_batch(Namespace::Section, requests, false)
    }

    pub fn leave_critical_sections<R, N, W>(
        &mut self,
        read: R,
        non_ex_write: N,
        write: W,
    ) -> CoordinationResult<()>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        N: IntoIterator,
        N::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let requests = sorted_unique_requests(read, non_ex_write, write);
        self.leave_batch(Namespace::Section, requests)
    }

    // ----- flags and shared data -----------------------------------------

    /// Set a flag that persists until cleared
    pub fn set_global_flag(&self, name: &str) -> CoordinationResult<()> {
        self.system.backend().set_flag(name, FlagLifetime::Permanent)
    }

    /// Set a flag that lapses if this process stops renewing its lease
    pub fn set_session_flag(&self, name: &str) -> CoordinationResult<()> {
        self.system.backend().set_flag(name, FlagLifetime::Session)
    }

    pub fn clear_global_flag(&self, name: &str) -> CoordinationResult<()> {
        self.system.backend().clear_flag(name)
    }

    pub fn check_global_flag(&self, name: &str) -> CoordinationResult<bool> {
        self.system.backend().check_flag(name)
    }

    /// Read a shared blob; `None` if it was never written or was deleted
    pub fn read_data(&self, name: &str) -> CoordinationResult<Option<Vec<u8>>> {
        self.system.backend().read_data(name)
    }

    /// Replace a shared blob, or delete it with `None`
    pub fn write_data(&self, name: &str, data: Option<&[u8]>) -> CoordinationResult<()> {
        self.system.backend().write_data(name, data)
    }

    /// Sleep for `duration`, waking early only to fail on cancellation
    pub fn timed_wait(&self, duration: Duration) -> CoordinationResult<()> {
        self.cancel.sleep(duration, self.system.timing.check_interval)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if !self.local_locks.is_empty() {
            warn!(
                "Session dropped holding {} lock(s); releasing",
                self.local_locks.len()
            );
            if let Err(e) = self.clear_locks() {
                warn!("Failed to release locks of dropped session: {e}");
            }
        }
        for (name, held) in self.local_sections.drain() {
            if let Err(e) = self.system.sections.leave(&name, held) {
                warn!("Failed to release critical section '{name}' of dropped session: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::error::CoordinationError;

    fn system() -> Arc<LockSystem> {
        LockSystem::open(&CoordinationConfig::default()).expect("in-process system")
    }

    #[test]
    fn test_reentrant_write_then_release() {
        let system = system();
        let mut session = system.session();
        session.enter_write_lock("k").expect("write");
        session.enter_read_lock("k").expect("nested read");
        assert_eq!(session.held_lock_kind("k"), Some(LockKind::Write));

        let mut other = system.session();
        assert!(matches!(
            other.enter_read_lock_no_wait("k"),
            Err(CoordinationError::LockUnavailable(_))
        ));

        session.leave_read_lock("k").expect("leave read");
        session.leave_write_lock("k").expect("leave write");
        other.enter_read_lock_no_wait("k").expect("free now");
        other.leave_read_lock("k").expect("leave");
        assert_eq!(system.live_lock_count(), 0);
    }

    #[test]
    fn test_batch_rolls_back_on_conflict() {
        let system = system();
        let mut holder = system.session();
        holder.enter_write_lock("b").expect("write b");

        let mut session = system.session();
        let none: [&str; 0] = [];
        let result = session.enter_locks_no_wait(["a"], none, ["b", "c"]);
        assert!(matches!(result, Err(CoordinationError::LockUnavailable(_))));
        assert_eq!(session.held_lock_count(), 0);
        assert_eq!(system.live_lock_count(), 1);
    }

    #[test]
    fn test_drop_releases_everything() {
        let system = system();
        {
            let mut session = system.session();
            session.enter_write_lock("x").expect("write");
            session.enter_write_critical_section("s").expect("section");
        }
        let mut other = system.session();
        other.enter_write_lock_no_wait("x").expect("released by drop");
        other.enter_write_critical_section("s").expect("section released");
    }

    #[test]
    fn test_sections_and_locks_are_separate_namespaces() {
        let system = system();
        let mut a = system.session();
        let mut b = system.session();
        a.enter_write_lock("same").expect("lock");
        b.enter_write_critical_section("same").expect("section");
    }
}
