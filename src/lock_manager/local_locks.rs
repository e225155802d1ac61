//! Per-session reentrancy bookkeeping

use std::collections::HashMap;

use super::LockKind;
use crate::error::{CoordinationError, CoordinationResult};

/// Counts for one key held by one session
#[derive(Debug, Clone, Copy)]
struct LocalLock {
    read: u32,
    non_ex_write: u32,
    write: u32,
    /// Kind of the underlying shared hold
    held: LockKind,
}

impl LocalLock {
    fn count_mut(&mut self, kind: LockKind) -> &mut u32 {
        match kind {
            LockKind::Read => &mut self.read,
            LockKind::NonExWrite => &mut self.non_ex_write,
            LockKind::Write => &mut self.write,
        }
    }

    fn total(&self) -> u32 {
        self.read + self.non_ex_write + self.write
    }
}

/// What entering a key means for the shared lock objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reentry {
    /// Already covered by a hold this session owns
    Nested,
    /// First hold of this key by the session
    Fresh,
}

/// Reentrant holds of one session, for either locks or critical sections
#[derive(Debug, Default)]
pub(crate) struct LocalLocks {
    locks: HashMap<String, LocalLock>,
}

impl LocalLocks {
    /// Decide whether `kind` on `key` nests inside an existing hold.
    ///
    /// A session holding write may nest anything; non-ex-write may nest
    /// non-ex-write and read; read only nests read. Escalation is illegal.
    pub(crate) fn plan_enter(&self, key: &str, kind: LockKind) -> CoordinationResult<Reentry> {
        let Some(local) = self.locks.get(key) else {
            return Ok(Reentry::Fresh);
        };
        match kind {
            LockKind::Write if local.write == 0 => Err(CoordinationError::illegal(
                key,
                "can't enter write lock when a read or non-ex-write lock is already held",
            )),
            LockKind::NonExWrite if local.write == 0 && local.non_ex_write == 0 => {
                Err(CoordinationError::illegal(
                    key,
                    "can't enter non-ex-write lock when a read lock is already held",
                ))
            }
            _ => Ok(Reentry::Nested),
        }
    }

    pub(crate) fn record_enter(&mut self, key: &str, kind: LockKind) {
        let local = self.locks.entry(key.to_string()).or_insert(LocalLock {
            read: 0,
            non_ex_write: 0,
            write: 0,
            held: kind,
        });
        *local.count_mut(kind) += 1;
    }

    /// Record a release. Returns the shared hold to drop once the session's
    /// last count on `key` is gone.
    pub(crate) fn record_leave(
        &mut self,
        key: &str,
        kind: LockKind,
    ) -> CoordinationResult<Option<LockKind>> {
        let Some(local) = self.locks.get_mut(key) else {
            return Err(CoordinationError::illegal(
                key,
                format!("can't leave {kind} lock that is not held"),
            ));
        };
        let count = local.count_mut(kind);
        if *count == 0 {
            return Err(CoordinationError::illegal(
                key,
                format!("can't leave {kind} lock that is not held"),
            ));
        }
        *count -= 1;
        if local.total() > 0 {
            return Ok(None);
        }
        let held = local.held;
        self.locks.remove(key);
        Ok(Some(held))
    }

    /// Forget every hold, returning the shared holds to drop
    pub(crate) fn drain(&mut self) -> Vec<(String, LockKind)> {
        let mut held: Vec<(String, LockKind)> = self
            .locks
            .drain()
            .map(|(key, local)| (key, local.held))
            .collect();
        held.sort_by(|a, b| b.0.cmp(&a.0));
        held
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    /// Kind of the shared hold on `key`, if the session holds it
    pub(crate) fn held_kind(&self, key: &str) -> Option<LockKind> {
        self.locks.get(key).map(|local| local.held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_nests_everything() {
        let mut locks = LocalLocks::default();
        locks.record_enter("k", LockKind::Write);
        for kind in [LockKind::Read, LockKind::NonExWrite, LockKind::Write] {
            assert_eq!(locks.plan_enter("k", kind).expect("nest"), Reentry::Nested);
            locks.record_enter("k", kind);
        }
        assert_eq!(locks.record_leave("k", LockKind::Read).expect("leave"), None);
        assert_eq!(locks.record_leave("k", LockKind::NonExWrite).expect("leave"), None);
        assert_eq!(locks.record_leave("k", LockKind::Write).expect("leave"), None);
        assert_eq!(
            locks.record_leave("k", LockKind::Write).expect("leave"),
            Some(LockKind::Write)
        );
        assert!(locks.is_empty());
    }

    #[test]
    fn test_escalation_is_illegal() {
        let mut locks = LocalLocks::default();
        locks.record_enter("r", LockKind::Read);
        assert!(locks.plan_enter("r", LockKind::Write).is_err());
        assert!(locks.plan_enter("r", LockKind::NonExWrite).is_err());
        assert_eq!(locks.plan_enter("r", LockKind::Read).expect("nest"), Reentry::Nested);

        locks.record_enter("n", LockKind::NonExWrite);
        assert!(locks.plan_enter("n", LockKind::Write).is_err());
        assert_eq!(locks.plan_enter("n", LockKind::Read).expect("nest"), Reentry::Nested);
    }

    #[test]
    fn test_leave_without_enter_is_illegal() {
        let mut locks = LocalLocks::default();
        assert!(locks.record_leave("k", LockKind::Read).is_err());
        locks.record_enter("k", LockKind::Write);
        assert!(locks.record_leave("k", LockKind::Read).is_err());
        assert_eq!(locks.held_kind("k"), Some(LockKind::Write));
    }
}
