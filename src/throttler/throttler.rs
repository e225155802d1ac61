//! Throttle groups by type and the permission API over them

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::fetch::FetchThrottler;
use super::group::ThrottlingGroup;
use super::spec::ThrottleSpec;
use crate::cancel::CancelToken;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockSystem;

type GroupMap = HashMap<String, Arc<ThrottlingGroup>>;

/// Connection, fetch-rate and byte-rate throttling for every throttle group
/// of one process
///
/// Groups are keyed by `(group_type, group_name)`. Limits are shared with
/// the other processes using the same coordination backend: each process
/// takes a share of every bin's limits, recomputed by [`poll`](Self::poll).
#[derive(Debug)]
pub struct Throttler {
    system: Arc<LockSystem>,
    groups: Mutex<BTreeMap<String, GroupMap>>,
}

impl Throttler {
    #[must_use]
    pub fn new(system: &Arc<LockSystem>) -> Self {
        Self {
            system: Arc::clone(system),
            groups: Mutex::new(BTreeMap::new()),
        }
    }

    fn group(&self, group_type: &str, group_name: &str) -> CoordinationResult<Arc<ThrottlingGroup>> {
        self.groups
            .lock()
            .get(group_type)
            .and_then(|groups| groups.get(group_name))
            .cloned()
            .ok_or_else(|| {
                CoordinationError::Setup(format!(
                    "Unknown throttle group '{group_name}' of type '{group_type}'"
                ))
            })
    }

    /// Group types that currently have at least one group
    #[must_use]
    pub fn group_types(&self) -> Vec<String> {
        self.groups.lock().keys().cloned().collect()
    }

    /// Names of the groups of `group_type`, sorted
    #[must_use]
    pub fn get_throttle_groups(&self, group_type: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .lock()
            .get(group_type)
            .map(|groups| groups.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// The limits a group currently applies
    pub fn throttle_specification(
        &self,
        group_type: &str,
        group_name: &str,
    ) -> CoordinationResult<Arc<dyn ThrottleSpec>> {
        Ok(self.group(group_type, group_name)?.spec())
    }

    /// Create a group or replace its limits
    ///
    /// # Errors
    ///
    /// Returns an error if the group's registration or re-apportioning fails.
    pub fn update_throttle_specification(
        &self,
        group_type: &str,
        group_name: &str,
        spec: Arc<dyn ThrottleSpec>,
    ) -> CoordinationResult<()> {
        let mut groups = self.groups.lock();
        let by_name = groups.entry(group_type.to_string()).or_default();
        if let Some(group) = by_name.get(group_name) {
            let group = Arc::clone(group);
            drop(groups);
            debug!(group_type, group_name, "throttle spec updated");
            return group.update_spec(spec);
        }
        let group = ThrottlingGroup::new(&self.system, group_type, group_name, spec)?;
        by_name.insert(group_name.to_string(), Arc::new(group));
        Ok(())
    }

    /// Tear a group down; callers blocked on it fail with `Setup`
    ///
    /// Removing a group that does not exist is not an error.
    pub fn remove_throttle_group(&self, group_type: &str, group_name: &str) -> CoordinationResult<()> {
        let removed = {
            let mut groups = self.groups.lock();
            let removed = groups
                .get_mut(group_type)
                .and_then(|by_name| by_name.remove(group_name));
            if groups.get(group_type).is_some_and(HashMap::is_empty) {
                groups.remove(group_type);
            }
            removed
        };
        match removed {
            Some(group) => group.destroy(),
            None => Ok(()),
        }
    }

    /// Block until a connection may be opened against every one of
    /// `bin_names` and the first fetch on it may start
    ///
    /// # Errors
    ///
    /// - `Setup` for an unknown group, or if the group is removed meanwhile
    /// - `ResourceExhausted` if a bin allows no connections at all
    /// - `Interrupted` if `cancel` fires
    pub fn obtain_connection_permission(
        &self,
        group_type: &str,
        group_name: &str,
        bin_names: &[&str],
        cancel: &CancelToken,
    ) -> CoordinationResult<FetchThrottler> {
        let group = self.group(group_type, group_name)?;
        let bins = group.ensure_bins(bin_names)?;
        group.obtain_connection(&bins, cancel)?;
        debug!(group_type, group_name, bins = ?bin_names, "connection permission granted");
        Ok(FetchThrottler::new(group, bins, cancel.clone()))
    }

    /// Give a connection back and wake callers waiting for one
    pub fn release_connection_permission(&self, fetch: FetchThrottler) {
        fetch.release();
    }

    /// How many of `bin_names` have more open connections than this
    /// process's share allows
    ///
    /// Advisory: a caller holding idle pooled connections can use it to pick
    /// which ones to close.
    pub fn over_connection_quota_count(
        &self,
        group_type: &str,
        group_name: &str,
        bin_names: &[&str],
    ) -> CoordinationResult<usize> {
        Ok(self.group(group_type, group_name)?.over_quota_count(bin_names))
    }

    /// Re-apportion the limits of every group of `group_type`
    pub fn poll(&self, group_type: &str) -> CoordinationResult<()> {
        let groups: Vec<Arc<ThrottlingGroup>> = self
            .groups
            .lock()
            .get(group_type)
            .map(|by_name| by_name.values().cloned().collect())
            .unwrap_or_default();
        let mut result = Ok(());
        for group in groups {
            if let Err(e) = group.poll() {
                result = Err(e);
            }
        }
        result
    }

    pub fn poll_all(&self) -> CoordinationResult<()> {
        let mut result = Ok(());
        for group_type in self.group_types() {
            if let Err(e) = self.poll(&group_type) {
                warn!(group_type = %group_type, error = %e, "throttle poll failed");
                result = Err(e);
            }
        }
        result
    }

    /// Drop bins with no connections or fetches in progress
    ///
    /// Returns how many bins were dropped.
    pub fn free_unused_resources(&self) -> CoordinationResult<usize> {
        let groups: Vec<Arc<ThrottlingGroup>> = self
            .groups
            .lock()
            .values()
            .flat_map(|by_name| by_name.values().cloned())
            .collect();
        let mut freed = 0;
        for group in groups {
            freed += group.free_unused_resources()?;
        }
        if freed > 0 {
            debug!(freed, "unused throttle bins dropped");
        }
        Ok(freed)
    }

    /// Bins currently tracked across all groups
    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.groups
            .lock()
            .values()
            .flat_map(HashMap::values)
            .map(|group| group.bin_count())
            .sum()
    }

    /// Remove every group
    pub fn destroy(&self) -> CoordinationResult<()> {
        let drained: Vec<Arc<ThrottlingGroup>> = std::mem::take(&mut *self.groups.lock())
            .into_values()
            .flat_map(HashMap::into_values)
            .collect();
        let mut result = Ok(());
        for group in drained {
            if let Err(e) = group.destroy() {
                result = Err(e);
            }
        }
        result
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(error = %e, "throttler shutdown failed");
        }
    }
}
