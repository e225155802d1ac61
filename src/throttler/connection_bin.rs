//! Concurrent-connection accounting for one bin

use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

use super::service_data::{BinRegistration, pack_connection, unpack_connection};
use crate::cancel::CancelToken;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockManager;
use crate::utils::{CONNECTION_BIN_PREFIX, CONNECTION_BIN_TARGET_PREFIX};

#[derive(Debug)]
struct ConnectionState {
    alive: bool,
    /// Global limit from the throttle spec; `None` is unlimited
    max_active: Option<u32>,
    /// This process's share of `max_active`
    local_max: u32,
    reserved: u32,
    in_use: u32,
}

#[derive(Debug)]
pub(crate) struct ConnectionBin {
    bin_name: String,
    registration: BinRegistration,
    state: Mutex<ConnectionState>,
    changed: Condvar,
}

impl ConnectionBin {
    pub(crate) fn new(lm: &mut LockManager, group_name: &str, bin_name: &str) -> CoordinationResult<Self> {
        let registration = BinRegistration::register(
            lm,
            CONNECTION_BIN_PREFIX,
            CONNECTION_BIN_TARGET_PREFIX,
            group_name,
            bin_name,
        )?;
        Ok(Self {
            bin_name: bin_name.to_string(),
            registration,
            state: Mutex::new(ConnectionState {
                alive: true,
                max_active: Some(0),
                local_max: 0,
                reserved: 0,
                in_use: 0,
            }),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub(crate) fn update_max_active_connections(&self, max_active: Option<u32>) {
        self.state.lock().max_active = max_active;
    }

    /// Block until a connection slot can be reserved
    pub(crate) fn reserve(&self, cancel: &CancelToken, check_interval: Duration) -> CoordinationResult<()> {
        let mut state = self.state.lock();
        loop {
            if !state.alive {
                return Err(CoordinationError::Setup(format!(
                    "Throttle group removed while waiting on bin '{}'",
                    self.bin_name
                )));
            }
            if state.in_use + state.reserved < state.local_max {
                state.reserved += 1;
                return Ok(());
            }
            cancel.wait_on(&self.changed, &mut state, None, check_interval)?;
        }
    }

    pub(crate) fn undo_reservation(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Turn a reservation into an open connection
    pub(crate) fn note_connection_creation(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        state.in_use += 1;
    }

    pub(crate) fn note_connection_destroyed(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        self.changed.notify_all();
    }

    /// More connections are open than this process's share allows
    pub(crate) fn is_over_quota(&self) -> bool {
        let state = self.state.lock();
        state.in_use > state.local_max
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.in_use == 0 && state.reserved == 0
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.state.lock().in_use
    }

    /// Recompute this process's share from what the peers published
    pub(crate) fn poll(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        let (max_active, local_in_use) = {
            let state = self.state.lock();
            (state.max_active, state.in_use)
        };

        let target = self.registration.with_target_lock(lm, |lm| {
            let peers = self.registration.scan_peers(lm)?;
            if peers.services == 0 {
                return Ok(None);
            }
            let target = match max_active {
                None => u32::MAX,
                Some(max) => {
                    let max = u64::from(max);
                    let (others_target, others_in_use) = peers
                        .others
                        .iter()
                        .map(|data| unpack_connection(Some(data)))
                        .fold((0u64, 0u64), |(t, u), (pt, pu)| {
                            (t + u64::from(pt), u + u64::from(pu))
                        });
                    let maximum = max
                        .saturating_sub(others_target)
                        .min(max.saturating_sub(others_in_use));
                    let services = peers.services as u64;
                    let mut fair = max / services;
                    if rand::random_range(0..services) < max % services {
                        fair += 1;
                    }
                    u32::try_from(maximum.min(fair)).unwrap_or(u32::MAX)
                }
            };
            let published = if max_active.is_some() { target } else { 0 };
            self.registration
                .publish(lm, &pack_connection(published, local_in_use))?;
            Ok(Some(target))
        })?;

        if let Some(target) = target {
            let mut state = self.state.lock();
            if state.local_max != target {
                trace!(bin = %self.bin_name, from = state.local_max, to = target, "connection share changed");
                state.local_max = target;
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
        debug!(bin = %self.bin_name, "connection bin shut down");
        self.registration.unregister(lm)
    }
}
