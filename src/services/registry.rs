//! Service registration and liveness on top of the lock manager
//!
//! Per service type the registry keeps, in backend flags and data:
//!
//! - an indexed list `_SERVICELIST_<type>_<i>` of registered names, ending at
//!   the first missing index
//! - a permanent `_SERVICE_<type>_<name>` flag per registered name
//! - a session-lifetime `_ACTIVE_<type>_<name>` flag while the service runs
//! - an optional `_SERVICEDATA_<type>_<name>` blob
//!
//! Mutations hold the `_SERVICELOCK_<type>` write lock; inspection holds it
//! for read.

use log::{debug, info};

use super::cleanup::ServiceCleanup;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockManager;
use crate::utils::{
    ACTIVE_PREFIX, ANONYMOUS_SERVICE_PREFIX, SERVICE_COUNTER_PREFIX, SERVICE_DATA_PREFIX,
    SERVICE_LIST_PREFIX, SERVICE_LOCK_PREFIX, SERVICE_PREFIX,
};

fn service_lock_name(service_type: &str) -> String {
    format!("{SERVICE_LOCK_PREFIX}{service_type}")
}

fn service_list_entry(service_type: &str, index: usize) -> String {
    format!("{SERVICE_LIST_PREFIX}{service_type}_{index}")
}

fn registered_flag_name(service_type: &str, service_name: &str) -> String {
    format!("{SERVICE_PREFIX}{service_type}_{service_name}")
}

fn active_flag_name(service_type: &str, service_name: &str) -> String {
    format!("{ACTIVE_PREFIX}{service_type}_{service_name}")
}

fn service_data_name(service_type: &str, service_name: &str) -> String {
    format!("{SERVICE_DATA_PREFIX}{service_type}_{service_name}")
}

fn service_counter_name(service_type: &str) -> String {
    format!("{SERVICE_COUNTER_PREFIX}{service_type}")
}

impl LockManager {
    fn with_service_lock<T>(
        &mut self,
        service_type: &str,
        write: bool,
        body: impl FnOnce(&mut Self) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        let lock_name = service_lock_name(service_type);
        if write {
            self.enter_write_lock(&lock_name)?;
        } else {
            self.enter_read_lock(&lock_name)?;
        }
        let result = body(self);
        let released = if write {
            self.leave_write_lock(&lock_name)
        } else {
            self.leave_read_lock(&lock_name)
        };
        let value = result?;
        released?;
        Ok(value)
    }

    fn read_service_name(&self, entry: &str) -> CoordinationResult<Option<String>> {
        match self.read_data(entry)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| CoordinationError::corrupt(entry, e.to_string())),
        }
    }

    fn write_service_name(&self, entry: &str, name: Option<&str>) -> CoordinationResult<()> {
        self.write_data(entry, name.map(str::as_bytes))
    }

    /// Registered names of a type, in list order
    fn registered_services(&self, service_type: &str) -> CoordinationResult<Vec<String>> {
        let mut names = Vec::new();
        while let Some(name) = self.read_service_name(&service_list_entry(service_type, names.len()))? {
            names.push(name);
        }
        Ok(names)
    }

    fn is_active(&self, service_type: &str, service_name: &str) -> CoordinationResult<bool> {
        self.check_global_flag(&active_flag_name(service_type, service_name))
    }

    fn construct_unique_service_name(&self, service_type: &str) -> CoordinationResult<String> {
        let counter_name = service_counter_name(service_type);
        let current = match self.read_data(&counter_name)? {
            Some(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
                Ok(raw) => u32::from_le_bytes(raw),
                Err(_) => 0,
            },
            None => 0,
        };
        self.write_data(&counter_name, Some(&current.wrapping_add(1).to_le_bytes()))?;
        Ok(format!("{ANONYMOUS_SERVICE_PREFIX}{current}"))
    }

    /// Register a service (if not yet registered) and mark it active
    ///
    /// With `service_name` of `None` a unique anonymous name is generated.
    /// When `cleanup` is given, state left behind by earlier runs is reclaimed
    /// first: if no other service of the type is active, every service is
    /// cleaned up and the cluster re-initialised; if only this service had
    /// been registered before while others are running, only its own state
    /// is cleaned up.
    ///
    /// Returns the service name actually used.
    ///
    /// # Errors
    ///
    /// `Setup` if the service is already active.
    pub fn register_service_begin_service_activity(
        &mut self,
        service_type: &str,
        service_name: Option<&str>,
        initial_data: Option<&[u8]>,
        cleanup: Option<&dyn ServiceCleanup>,
    ) -> CoordinationResult<String> {
        self.with_service_lock(service_type, true, |lm| {
            let service_name = match service_name {
                Some(name) => name.to_string(),
                None => lm.construct_unique_service_name(service_type)?,
            };

            let active_flag = active_flag_name(service_type, &service_name);
            if lm.check_global_flag(&active_flag)? {
                return Err(CoordinationError::Setup(format!(
                    "Service '{service_name}' of type '{service_type}' is already active"
                )));
            }

            let registered = lm.registered_services(service_type)?;
            let mut found_service = false;
            let mut found_active_service = false;
            for name in &registered {
                if *name == service_name {
                    found_service = true;
                } else if lm.is_active(service_type, name)? {
                    found_active_service = true;
                }
            }

            let mut unregister_all = false;
            if let Some(cleanup) = cleanup {
                if registered.is_empty() {
                    cleanup.clean_up_all_services()?;
                    cleanup.cluster_init()?;
                } else if found_service && found_active_service {
                    cleanup.clean_up_service(&service_name)?;
                } else if !found_active_service {
                    info!("No active '{service_type}' services; cleaning up all registrations");
                    cleanup.clean_up_all_services()?;
                    cleanup.cluster_init()?;
                    unregister_all = true;
                }
            }

            let mut list_len = registered.len();
            if unregister_all {
                for (index, name) in registered.iter().enumerate().rev() {
                    lm.clear_global_flag(&registered_flag_name(service_type, name))?;
                    lm.write_service_name(&service_list_entry(service_type, index), None)?;
                }
                found_service = false;
                list_len = 0;
            }

            if !found_service {
                let entry = service_list_entry(service_type, list_len);
                lm.write_service_name(&entry, Some(&service_name))?;
                if let Err(e) = lm.set_global_flag(&registered_flag_name(service_type, &service_name)) {
                    lm.write_service_name(&entry, None)?;
                    return Err(e);
                }
            }

            lm.set_session_flag(&active_flag)?;
            lm.write_data(&service_data_name(service_type, &service_name), initial_data)?;
            info!("Service '{service_name}' of type '{service_type}' is active");
            Ok(service_name)
        })
    }

    /// Replace the data blob of an active service
    ///
    /// # Errors
    ///
    /// `Setup` if the service is not active.
    pub fn update_service_data(
        &mut self,
        service_type: &str,
        service_name: &str,
        data: Option<&[u8]>,
    ) -> CoordinationResult<()> {
        self.with_service_lock(service_type, true, |lm| {
            if !lm.is_active(service_type, service_name)? {
                return Err(CoordinationError::Setup(format!(
                    "Service '{service_name}' of type '{service_type}' is not active"
                )));
            }
            lm.write_data(&service_data_name(service_type, service_name), data)
        })
    }

    /// Data of an active service; `None` when the service is not active and
    /// an empty blob when it never published any
    pub fn retrieve_service_data(
        &mut self,
        service_type: &str,
        service_name: &str,
    ) -> CoordinationResult<Option<Vec<u8>>> {
        self.with_service_lock(service_type, false, |lm| {
            if !lm.is_active(service_type, service_name)? {
                return Ok(None);
            }
            Ok(Some(
                lm.read_data(&service_data_name(service_type, service_name))?
                    .unwrap_or_default(),
            ))
        })
    }

    /// Visit each active service of a type with its data
    ///
    /// The acceptor returns `true` to stop the scan early.
    pub fn scan_service_data<F>(&mut self, service_type: &str, mut acceptor: F) -> CoordinationResult<()>
    where
        F: FnMut(&str, Option<&[u8]>) -> CoordinationResult<bool>,
    {
        self.with_service_lock(service_type, false, |lm| {
            for name in lm.registered_services(service_type)? {
                if lm.is_active(service_type, &name)? {
                    let data = lm.read_data(&service_data_name(service_type, &name))?;
                    if acceptor(&name, data.as_deref())? {
                        break;
                    }
                }
            }
            Ok(())
        })
    }

    pub fn count_active_services(&mut self, service_type: &str) -> CoordinationResult<usize> {
        self.with_service_lock(service_type, false, |lm| {
            let mut count = 0;
            for name in lm.registered_services(service_type)? {
                if lm.is_active(service_type, &name)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Reclaim one registered but inactive service
    ///
    /// Holds the type's write lock throughout, so the service cannot start up
    /// again while `cleanup` runs; on success it is unregistered. Callers loop
    /// until `true` is returned.
    ///
    /// Returns `true` if no inactive service was found.
    pub fn cleanup_inactive_service(
        &mut self,
        service_type: &str,
        cleanup: &dyn ServiceCleanup,
    ) -> CoordinationResult<bool> {
        self.with_service_lock(service_type, true, |lm| {
            let registered = lm.registered_services(service_type)?;
            let mut inactive = None;
            for (index, name) in registered.iter().enumerate() {
                if !lm.is_active(service_type, name)? {
                    inactive = Some(index);
                    break;
                }
            }
            let Some(index) = inactive else {
                return Ok(true);
            };

            let service_name = &registered[index];
            info!("Cleaning up inactive service '{service_name}' of type '{service_type}'");
            cleanup.clean_up_service(service_name)?;

            lm.clear_global_flag(&registered_flag_name(service_type, service_name))?;
            let last = registered.len() - 1;
            if last != index {
                lm.write_service_name(
                    &service_list_entry(service_type, index),
                    Some(&registered[last]),
                )?;
            }
            lm.write_service_name(&service_list_entry(service_type, last), None)?;
            Ok(false)
        })
    }

    /// Leave the active state; the registration itself persists
    ///
    /// # Errors
    ///
    /// `Setup` if the service is not active.
    pub fn end_service_activity(&mut self, service_type: &str, service_name: &str) -> CoordinationResult<()> {
        self.with_service_lock(service_type, true, |lm| {
            let active_flag = active_flag_name(service_type, service_name);
            if !lm.check_global_flag(&active_flag)? {
                return Err(CoordinationError::Setup(format!(
                    "Service '{service_name}' of type '{service_type}' is not active"
                )));
            }
            lm.write_data(&service_data_name(service_type, service_name), None)?;
            lm.clear_global_flag(&active_flag)?;
            debug!("Service '{service_name}' of type '{service_type}' ended activity");
            Ok(())
        })
    }

    pub fn check_service_active(&mut self, service_type: &str, service_name: &str) -> CoordinationResult<bool> {
        self.with_service_lock(service_type, false, |lm| lm.is_active(service_type, service_name))
    }

    /// Registered service names of a type, active or not
    pub fn list_registered_services(&mut self, service_type: &str) -> CoordinationResult<Vec<String>> {
        self.with_service_lock(service_type, false, |lm| lm.registered_services(service_type))
    }
}
