//! Single-process backend
//!
//! All exclusion happens in the process-local lock objects, so global holds
//! always succeed. Flags and data live in memory; session flags never lapse
//! because their owner is this very process.

use dashmap::DashMap;
use uuid::Uuid;

use super::{CoordinationBackend, FlagLifetime};
use crate::error::CoordinationResult;
use crate::lock_manager::LockKind;

#[derive(Debug)]
pub struct InProcessBackend {
    holder_id: String,
    flags: DashMap<String, FlagLifetime>,
    data: DashMap<String, Vec<u8>>,
}

impl InProcessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            holder_id: Uuid::new_v4().to_string(),
            flags: DashMap::new(),
            data: DashMap::new(),
        }
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationBackend for InProcessBackend {
    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn try_acquire(&self, _key: &str, _kind: LockKind) -> CoordinationResult<bool> {
        Ok(true)
    }

    fn release(&self, _key: &str, _kind: LockKind) -> CoordinationResult<()> {
        Ok(())
    }

    fn set_flag(&self, name: &str, lifetime: FlagLifetime) -> CoordinationResult<()> {
        self.flags.insert(name.to_string(), lifetime);
        Ok(())
    }

    fn clear_flag(&self, name: &str) -> CoordinationResult<()> {
        self.flags.remove(name);
        Ok(())
    }

    fn check_flag(&self, name: &str) -> CoordinationResult<bool> {
        Ok(self.flags.contains_key(name))
    }

    fn read_data(&self, name: &str) -> CoordinationResult<Option<Vec<u8>>> {
        Ok(self.data.get(name).map(|entry| entry.value().clone()))
    }

    fn write_data(&self, name: &str, data: Option<&[u8]>) -> CoordinationResult<()> {
        match data {
            Some(bytes) => {
                self.data.insert(name.to_string(), bytes.to_vec());
            }
            None => {
                self.data.remove(name);
            }
        }
        Ok(())
    }

    fn renew_leases(&self) -> CoordinationResult<usize> {
        Ok(0)
    }
}
