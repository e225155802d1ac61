//! Byte-rate estimator for one bin
//!
//! A series starts when the first fetch against an idle bin begins and ends
//! when the last active fetch ends. The first read of a series goes through
//! unthrottled and calibrates how long reads take per byte. Later reads in
//! the series are delayed so that the bytes handed out since the series
//! started never run ahead of the allowed rate, less the time the read
//! itself is expected to take.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

use super::service_data::{BinRegistration, pack_rate, unpack_rate};
use crate::cancel::CancelToken;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockManager;
use crate::utils::{THROTTLE_BIN_PREFIX, THROTTLE_BIN_TARGET_PREFIX, now_ms};

#[derive(Debug)]
struct RateState {
    alive: bool,
    /// Global limit from the throttle spec; 0 is unlimited
    min_ms_per_byte: f64,
    /// This process's share; `f64::MAX` blocks reads until the next poll
    local_min_ms_per_byte: f64,
    ref_count: u32,
    series_start_ms: i64,
    /// Bytes handed out in this series, including reads still in flight
    total_bytes: i64,
    /// Calibrated ms per byte of the first read
    rate_estimate: f64,
    estimate_valid: bool,
    estimate_in_progress: bool,
}

#[derive(Debug)]
pub(crate) struct ThrottleBin {
    bin_name: String,
    registration: BinRegistration,
    state: Mutex<RateState>,
    changed: Condvar,
}

impl ThrottleBin {
    pub(crate) fn new(lm: &mut LockManager, group_name: &str, bin_name: &str) -> CoordinationResult<Self> {
        let registration = BinRegistration::register(
            lm,
            THROTTLE_BIN_PREFIX,
            THROTTLE_BIN_TARGET_PREFIX,
            group_name,
            bin_name,
        )?;
        Ok(Self {
            bin_name: bin_name.to_string(),
            registration,
            state: Mutex::new(RateState {
                alive: true,
                min_ms_per_byte: 0.0,
                local_min_ms_per_byte: 0.0,
                ref_count: 0,
                series_start_ms: 0,
                total_bytes: 0,
                rate_estimate: 0.0,
                estimate_valid: false,
                estimate_in_progress: false,
            }),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn update_min_ms_per_byte(&self, min_ms_per_byte: f64) {
        self.state.lock().min_ms_per_byte = min_ms_per_byte;
    }

    fn shut_down_error(&self) -> CoordinationError {
        CoordinationError::Setup(format!("Throttle group removed while waiting on bin '{}'", self.bin_name))
    }

    /// A fetch against this bin starts; the first one of a series resets it
    pub(crate) fn begin_fetch(&self) {
        let mut state = self.state.lock();
        if state.ref_count == 0 {
            state.estimate_valid = false;
            state.estimate_in_progress = false;
            state.rate_estimate = 0.0;
            state.total_bytes = 0;
            state.series_start_ms = -1;
        }
        state.ref_count += 1;
    }

    /// Delay as needed before reading `count` bytes
    pub(crate) fn begin_read(&self, count: usize, cancel: &CancelToken, check_interval: Duration) -> CoordinationResult<()> {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut state = self.state.lock();

        let mut logged = false;
        loop {
            if !state.alive {
                return Err(self.shut_down_error());
            }
            if state.estimate_in_progress {
                cancel.wait_on(&self.changed, &mut state, None, check_interval)?;
                continue;
            }
            let now = now_ms();
            if !state.estimate_valid {
                state.series_start_ms = now;
                state.estimate_in_progress = true;
                state.total_bytes += count;
                return Ok(());
            }
            if state.local_min_ms_per_byte == f64::MAX {
                cancel.wait_on(&self.changed, &mut state, None, check_interval)?;
                continue;
            }

            // Bytes join the series only once the read is allowed to start
            let estimated = (state.rate_estimate * count as f64) as i64;
            let desired_end = state.series_start_ms
                + (state.total_bytes.saturating_add(count) as f64 * state.local_min_ms_per_byte) as i64;
            let remaining = desired_end - estimated - now;
            if remaining <= 0 {
                state.total_bytes += count;
                return Ok(());
            }
            if !logged {
                trace!(bin = %self.bin_name, wait_ms = remaining, "byte-rate wait");
                logged = true;
            }
            cancel.wait_on(
                &self.changed,
                &mut state,
                Some(Duration::from_millis(remaining.unsigned_abs())),
                check_interval,
            )?;
        }
    }

    /// A read asked for `original` bytes and got `actual`
    pub(crate) fn end_read(&self, original: usize, actual: usize) {
        let original = i64::try_from(original).unwrap_or(i64::MAX);
        let actual = i64::try_from(actual).unwrap_or(i64::MAX);
        let now = now_ms();
        let mut state = self.state.lock();
        state.total_bytes += actual - original;
        if state.estimate_in_progress {
            state.rate_estimate = if actual == 0 {
                0.0
            } else {
                (now - state.series_start_ms) as f64 / actual as f64
            };
            state.estimate_valid = true;
            state.estimate_in_progress = false;
            trace!(bin = %self.bin_name, ms_per_byte = state.rate_estimate, "byte rate calibrated");
            self.changed.notify_all();
        }
    }

    /// A read failed; an interrupted calibration is retried by the next read
    pub(crate) fn abort_read(&self) {
        let mut state = self.state.lock();
        if state.estimate_in_progress {
            state.estimate_in_progress = false;
            self.changed.notify_all();
        }
    }

    /// A fetch ended; returns true when the bin went idle
    pub(crate) fn end_fetch(&self) -> bool {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        state.ref_count == 0
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state.lock().ref_count == 0
    }

    pub(crate) fn poll(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        let min_ms_per_byte = self.state.lock().min_ms_per_byte;

        let target = self.registration.with_target_lock(lm, |lm| {
            let peers = self.registration.scan_peers(lm)?;
            if peers.services == 0 {
                return Ok(None);
            }
            if min_ms_per_byte == 0.0 {
                self.registration.publish(lm, &pack_rate(0.0))?;
                return Ok(Some(0.0));
            }
            let global = 1.0 / min_ms_per_byte;
            let others: f64 = peers
                .others
                .iter()
                .map(|data| unpack_rate(Some(data)))
                .sum();
            let maximum = (global - others).max(0.0);
            let inverse_target = maximum.min(global / peers.services as f64);
            self.registration.publish(lm, &pack_rate(inverse_target))?;
            Ok(Some(if inverse_target == 0.0 {
                f64::MAX
            } else {
                1.0 / inverse_target
            }))
        })?;

        if let Some(target) = target {
            let mut state = self.state.lock();
            if state.local_min_ms_per_byte != target {
                trace!(bin = %self.bin_name, ms_per_byte = target, "byte-rate share changed");
                state.local_min_ms_per_byte = target;
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
        debug!(bin = %self.bin_name, "throttle bin shut down");
        self.registration.unregister(lm)
    }
}
