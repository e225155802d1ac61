//! Cooperative cancellation for blocking operations
//!
//! Every blocking call in the crate (lock entry, connection and fetch waits,
//! byte-rate waits) sleeps in slices no longer than the configured check
//! interval and consults a [`CancelToken`] between slices. A cancelled token
//! turns the wait into [`CoordinationError::Interrupted`].

use crate::error::{CoordinationError, CoordinationResult};
use parking_lot::{Condvar, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared cancellation flag; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation observing this token
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Interrupted` if cancellation was requested
    pub fn check(&self) -> CoordinationResult<()> {
        if self.is_cancelled() {
            Err(CoordinationError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Wait on `condvar` for at most `wanted` (forever if `None`), in slices of
    /// `check_interval`, returning early when notified or cancelled.
    ///
    /// The caller re-evaluates its condition after every return.
    pub(crate) fn wait_on<T>(
        &self,
        condvar: &Condvar,
        guard: &mut MutexGuard<'_, T>,
        wanted: Option<Duration>,
        check_interval: Duration,
    ) -> CoordinationResult<()> {
        self.check()?;
        let slice = match wanted {
            Some(wanted) => wanted.min(check_interval),
            None => check_interval,
        };
        if !slice.is_zero() {
            condvar.wait_for(guard, slice);
        }
        self.check()
    }

    /// Cancellable sleep used for caller-side backoff
    pub fn sleep(&self, duration: Duration, check_interval: Duration) -> CoordinationResult<()> {
        let deadline = std::time::Instant::now() + duration;
        loop {
            self.check()?;
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(check_interval));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(CoordinationError::Interrupted)));
    }

    #[test]
    fn test_sleep_interrupted() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let start = Instant::now();
        let result = token.sleep(Duration::from_secs(10), Duration::from_millis(10));
        handle.join().expect("cancel thread panicked");
        assert!(matches!(result, Err(CoordinationError::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_on_respects_wanted() {
        let token = CancelToken::new();
        let mutex = Mutex::new(());
        let condvar = Condvar::new();
        let mut guard = mutex.lock();
        let start = Instant::now();
        token
            .wait_on(
                &condvar,
                &mut guard,
                Some(Duration::from_millis(20)),
                Duration::from_secs(1),
            )
            .expect("wait should not be interrupted");
        assert!(start.elapsed() < Duration::from_millis(900));
    }
}
