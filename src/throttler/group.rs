//! One throttle group: its spec and the bins tracked under it

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection_bin::ConnectionBin;
use super::fetch_bin::FetchBin;
use super::spec::ThrottleSpec;
use super::throttle_bin::ThrottleBin;
use crate::cancel::CancelToken;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::{LockManager, LockSystem};
use crate::utils::THROTTLE_POOL_PREFIX;

/// The three bins that share one bin name
#[derive(Debug, Clone)]
pub(crate) struct BinSet {
    pub connection: Arc<ConnectionBin>,
    pub fetch: Arc<FetchBin>,
    pub throttle: Arc<ThrottleBin>,
}

impl BinSet {
    fn is_unused(&self) -> bool {
        Arc::strong_count(&self.connection) == 1
            && self.connection.is_idle()
            && self.fetch.is_idle()
            && self.throttle.is_idle()
    }

    fn apply_limits(&self, spec: &dyn ThrottleSpec) {
        let name = self.connection.bin_name();
        self.connection
            .update_max_active_connections(spec.max_open_connections(name));
        self.fetch.update_min_ms_per_fetch(spec.min_ms_per_fetch(name));
        self.throttle.update_min_ms_per_byte(spec.min_ms_per_byte(name));
    }

    fn poll(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        self.connection.poll(lm)?;
        self.fetch.poll(lm)?;
        self.throttle.poll(lm)
    }

    fn shut_down(&self, lm: &mut LockManager) -> CoordinationResult<()> {
        let connection = self.connection.shut_down(lm);
        let fetch = self.fetch.shut_down(lm);
        let throttle = self.throttle.shut_down(lm);
        connection.and(fetch).and(throttle)
    }
}

#[derive(Debug)]
pub(crate) struct ThrottlingGroup {
    group_type: String,
    group_name: String,
    /// Scope used to name this group's bin services and target locks
    scope: String,
    pool_service_type: String,
    pool_service_name: String,
    spec: RwLock<Arc<dyn ThrottleSpec>>,
    /// Coordination session for bin registration and polling
    session: Mutex<LockManager>,
    bins: Mutex<HashMap<String, BinSet>>,
    check_interval: Duration,
}

impl ThrottlingGroup {
    pub(crate) fn new(
        system: &Arc<LockSystem>,
        group_type: &str,
        group_name: &str,
        spec: Arc<dyn ThrottleSpec>,
    ) -> CoordinationResult<Self> {
        let scope = format!("{group_type}_{group_name}");
        let pool_service_type = format!("{THROTTLE_POOL_PREFIX}{scope}");
        let mut session = system.session();
        let pool_service_name =
            session.register_service_begin_service_activity(&pool_service_type, None, None, None)?;
        info!(group_type, group_name, "throttle group created");
        Ok(Self {
            group_type: group_type.to_string(),
            group_name: group_name.to_string(),
            scope,
            pool_service_type,
            pool_service_name,
            spec: RwLock::new(spec),
            session: Mutex::new(session),
            bins: Mutex::new(HashMap::new()),
            check_interval: system.check_interval(),
        })
    }

    pub(crate) fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub(crate) fn spec(&self) -> Arc<dyn ThrottleSpec> {
        Arc::clone(&self.spec.read())
    }

    /// Replace the limits and re-apportion them right away
    pub(crate) fn update_spec(&self, spec: Arc<dyn ThrottleSpec>) -> CoordinationResult<()> {
        *self.spec.write() = spec;
        self.poll()
    }

    /// Find or create the bins for `bin_names`, in sorted order
    pub(crate) fn ensure_bins(&self, bin_names: &[&str]) -> CoordinationResult<Vec<BinSet>> {
        let mut names: Vec<&str> = bin_names.to_vec();
        names.sort_unstable();
        names.dedup();

        let spec = self.spec();
        let mut bins = self.bins.lock();
        let mut result = Vec::with_capacity(names.len());
        for name in names {
            if let Some(existing) = bins.get(name) {
                result.push(existing.clone());
                continue;
            }
            let mut session = self.session.lock();
            let set = BinSet {
                connection: Arc::new(ConnectionBin::new(&mut session, &self.scope, name)?),
                fetch: Arc::new(FetchBin::new(&mut session, &self.scope, name)?),
                throttle: Arc::new(ThrottleBin::new(&mut session, &self.scope, name)?),
            };
            set.apply_limits(spec.as_ref());
            set.poll(&mut session)?;
            debug!(group = %self.group_name, bin = name, "bin created");
            bins.insert(name.to_string(), set.clone());
            result.push(set);
        }
        Ok(result)
    }

    /// Block until every bin grants a connection and a fetch slot
    ///
    /// Reservations taken before a failure are rolled back.
    pub(crate) fn obtain_connection(&self, bins: &[BinSet], cancel: &CancelToken) -> CoordinationResult<()> {
        let spec = self.spec();
        for set in bins {
            if spec.max_open_connections(set.connection.bin_name()) == Some(0) {
                return Err(CoordinationError::ResourceExhausted(format!(
                    "Bin '{}' of throttle group '{}' allows no connections",
                    set.connection.bin_name(),
                    self.group_name
                )));
            }
        }

        for (index, set) in bins.iter().enumerate() {
            if let Err(e) = set.connection.reserve(cancel, self.check_interval) {
                for taken in &bins[..index] {
                    taken.connection.undo_reservation();
                }
                return Err(e);
            }
        }
        for set in bins {
            set.connection.note_connection_creation();
        }

        if let Err(e) = self.obtain_fetch(bins, cancel) {
            for set in bins {
                set.connection.note_connection_destroyed();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Block until every bin's fetch spacing allows another fetch
    pub(crate) fn obtain_fetch(&self, bins: &[BinSet], cancel: &CancelToken) -> CoordinationResult<()> {
        for (index, set) in bins.iter().enumerate() {
            if let Err(e) = set.fetch.reserve(cancel, self.check_interval) {
                for taken in &bins[..index] {
                    taken.fetch.clear_reservation();
                }
                return Err(e);
            }
        }
        for (index, set) in bins.iter().enumerate() {
            if let Err(e) = set.fetch.wait_next_fetch(cancel, self.check_interval) {
                for pending in &bins[index..] {
                    pending.fetch.clear_reservation();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn release_connection(&self, bins: &[BinSet]) {
        for set in bins {
            set.connection.note_connection_destroyed();
        }
    }

    /// How many of `bin_names` hold more connections than their share
    pub(crate) fn over_quota_count(&self, bin_names: &[&str]) -> usize {
        let bins = self.bins.lock();
        bin_names
            .iter()
            .filter_map(|name| bins.get(*name))
            .filter(|set| set.connection.is_over_quota())
            .count()
    }

    /// Re-read limits from the throttle spec and re-apportion them with the peers
    pub(crate) fn poll(&self) -> CoordinationResult<()> {
        let spec = self.spec();
        let snapshot: Vec<BinSet> = self.bins.lock().values().cloned().collect();
        let mut session = self.session.lock();
        let mut last_error = None;
        for set in snapshot {
            set.apply_limits(spec.as_ref());
            if let Err(e) = set.poll(&mut session) {
                warn!(group = %self.group_name, bin = set.connection.bin_name(), error = %e, "bin poll failed");
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Shut down bins nobody holds; returns how many were dropped
    pub(crate) fn free_unused_resources(&self) -> CoordinationResult<usize> {
        let mut bins = self.bins.lock();
        let unused: Vec<String> = bins
            .iter()
            .filter(|(_, set)| set.is_unused())
            .map(|(name, _)| name.clone())
            .collect();
        let mut session = self.session.lock();
        for name in &unused {
            if let Some(set) = bins.remove(name) {
                set.shut_down(&mut session)?;
            }
        }
        Ok(unused.len())
    }

    pub(crate) fn bin_count(&self) -> usize {
        self.bins.lock().len()
    }

    /// Shut down every bin, waking their waiters, and leave the pool
    pub(crate) fn destroy(&self) -> CoordinationResult<()> {
        let drained: Vec<BinSet> = self.bins.lock().drain().map(|(_, set)| set).collect();
        let mut session = self.session.lock();
        let mut result = Ok(());
        for set in drained {
            if let Err(e) = set.shut_down(&mut session) {
                result = Err(e);
            }
        }
        session.end_service_activity(&self.pool_service_type, &self.pool_service_name)?;
        info!(group_type = %self.group_type, group_name = %self.group_name, "throttle group removed");
        result
    }
}
