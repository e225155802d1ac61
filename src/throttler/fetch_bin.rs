//! Minimum spacing of fetch starts for one bin

use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

use super::service_data::{BinRegistration, pack_fetch, unpack_fetch};
use crate::cancel::CancelToken;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockManager;
use crate::utils::{FETCH_BIN_PREFIX, FETCH_BIN_TARGET_PREFIX, now_ms};

#[derive(Debug)]
struct FetchState {
    alive: bool,
    /// Global spacing from the throttle spec; 0 is unlimited
    min_ms_per_fetch: u64,
    /// This process's spacing; `None` blocks fetches until a poll grants a share
    local_min: Option<u64>,
    last_fetch_ms: i64,
    /// One caller at a time waits for the next fetch slot
    reserved: bool,
}

#[derive(Debug)]
pub(crate) struct FetchBin {
    bin_name: String,
    registration: BinRegistration,
    state: Mutex<FetchState>,
    changed: Condvar,
}

impl FetchBin {
    pub(crate) fn new(lm: &mut LockManager, group_name: &str, bin_name: &str) -> CoordinationResult<Self> {
        let registration =
            BinRegistration::register(lm, FETCH_BIN_PREFIX, FETCH_BIN_TARGET_PREFIX, group_name, bin_name)?;
        Ok(Self {
            bin_name: bin_name.to_string(),
            registration,
            state: Mutex::new(FetchState {
                alive: true,
                min_ms_per_fetch: 0,
                local_min: None,
                last_fetch_ms: 0,
                reserved: false,
            }),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn update_min_ms_per_fetch(&self, min_ms_per_fetch: u64) {
        self.state.lock().min_ms_per_fetch = min_ms_per_fetch;
    }

    fn shut_down_error(&self) -> CoordinationError {
        CoordinationError::Setup(format!("Throttle group removed while waiting on bin '{}'", self.bin_name))
    }

    /// Claim the right to wait for the next fetch slot
    pub(crate) fn reserve(&self, cancel: &CancelToken, check_interval: Duration) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        loop {
            if !state.alive {
                return Err(self.shut_down_error());
            }
            if !state.reserved {
                state.reserved = true;
                return Ok(());
            }
            cancel.wait_on(&self.changed, &mut state, None, check_interval)?;
        }
    }

    pub(crate) fn clear_reservation(&self) {
        let mut state = self.state.lock();
        state.reserved = false;
        self.changed.notify_all();
    }

    /// Wait until the spacing since the last fetch has elapsed, then record
    /// a fetch start and give up the reservation
    pub(crate) fn wait_next_fetch(&self, cancel: &CancelToken, check_interval: Duration) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        loop {
            if !state.alive {
                return Err(self.shut_down_error());
            }
            let Some(local_min) = state.local_min else {
                cancel.wait_on(&self.changed, &mut state, None, check_interval)?;
                continue;
            };
            let now = now_ms();
            let next = state
                .last_fetch_ms
                .saturating_add(i64::try_from(local_min).unwrap_or(i64::MAX));
            let wait = next.saturating_sub(now);
            if wait <= 0 {
                if now > state.last_fetch_ms {
                    state.last_fetch_ms = now;
                }
                state.reserved = false;
                self.changed.notify_all();
                return Ok(());
            }
            trace!(bin = %self.bin_name, wait_ms = wait, "waiting for fetch slot");
            cancel.wait_on(
                &self.changed,
                &mut state,
                Some(Duration::from_millis(wait.unsigned_abs())),
                check_interval,
            )?;
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        !self.state.lock().reserved
    }

    pub(crate) fn poll(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        let (min_ms_per_fetch, last_fetch_ms) = {
            let state = self.state.lock();
            (state.min_ms_per_fetch, state.last_fetch_ms)
        };

        let target = self.registration.with_target_lock(lm, |lm| {
            let peers = self.registration.scan_peers(lm)?;
            if peers.services == 0 {
                return Ok(None);
            }
            let inverse_target = if min_ms_per_fetch == 0 {
                f64::INFINITY
            } else {
                let global = 1.0 / min_ms_per_fetch as f64;
                let others: f64 = peers
                    .others
                    .iter()
                    .map(|data| unpack_fetch(Some(data)).0)
                    .sum();
                let maximum = (global - others).max(0.0);
                maximum.min(global / peers.services as f64)
            };
            let published = if min_ms_per_fetch == 0 { 0.0 } else { inverse_target };
            self.registration
                .publish(lm, &pack_fetch(published, last_fetch_ms))?;
            let target = if inverse_target == 0.0 {
                u64::MAX
            } else {
                (1.0 / inverse_target).round() as u64
            };
            Ok(Some(target))
        })?;

        if let Some(target) = target {
            let mut state = self.state.lock();
            if state.local_min != Some(target) {
                trace!(bin = %self.bin_name, ms = target, "fetch spacing changed");
                state.local_min = Some(target);
                self.changed.notify_all();
            }
        }
        Ok(())
    }

    pub(crate) fn shut_down(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        {
            let mut state = self.state.lock();
            state.alive = false;
            self.changed.notify_all();
        }
        debug!(bin = %self.bin_name, "fetch bin shut down");
        self.registration.unregister(lm)
    }
}
