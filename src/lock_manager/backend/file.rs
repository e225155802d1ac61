//! Shared-directory backend for several processes on one host
//!
//! Layout under the synch directory:
//!
//! - `locks/<fan-out>/<name>.status`: JSON list of holders with lease expiry
//! - `flags/<fan-out>/<name>.flag`: JSON flag record
//! - `data/<fan-out>/<name>.data`: raw bytes
//!
//! Every resource file sits next to a `.guard` file; an `fslock` lock on the
//! guard serialises each read-modify-write across processes. Holds and
//! session flags carry a lease; entries whose lease has lapsed are treated as
//! absent, which is how a crashed process's locks and active services are
//! reclaimed.

use fslock::LockFile;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use super::{CoordinationBackend, FlagLifetime};
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock_manager::LockKind;
use crate::utils::{fanout_path, now_ms};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockStatus {
    holders: Vec<LockHolder>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    holder: String,
    kind: LockKind,
    expires_at_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlagRecord {
    owner: Option<String>,
    expires_at_ms: Option<i64>,
}

#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    holder_id: String,
    lease: Duration,
    held: Mutex<HashMap<String, LockKind>>,
    session_flags: Mutex<HashSet<String>>,
}

impl FileBackend {
    /// Open (creating if needed) a synch directory
    ///
    /// # Arguments
    /// * `synch_directory` - Directory shared by all cooperating processes
    /// * `lease` - Lifetime of holds and session flags between renewals
    pub fn open(synch_directory: &Path, lease: Duration) -> CoordinationResult<Self> {
        for sub in ["locks", "flags", "data"] {
            fs::create_dir_all(synch_directory.join(sub))?;
        }
        let holder_id = Uuid::new_v4().to_string();
        debug!(
            "Opened file coordination backend at {} as holder {holder_id}",
            synch_directory.display()
        );
        Ok(Self {
            root: synch_directory.to_path_buf(),
            holder_id,
            lease,
            held: Mutex::new(HashMap::new()),
            session_flags: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn synch_directory(&self) -> &Path {
        &self.root
    }

    fn lease_ms(&self) -> i64 {
        i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX)
    }

    fn resource_path(&self, area: &str, name: &str, extension: &str) -> PathBuf {
        fanout_path(&self.root.join(area), name, extension)
    }

    /// Run `f` while holding the cross-process guard of one resource
    fn with_guard<T>(
        &self,
        resource: &Path,
        f: impl FnOnce() -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        if let Some(parent) = resource.parent() {
            fs::create_dir_all(parent)?;
        }
        let guard_path = resource.with_extension("guard");
        let mut guard = LockFile::open(guard_path.as_os_str())?;
        guard.lock()?;
        let result = f();
        guard.unlock()?;
        result
    }

    fn read_file(path: &Path) -> CoordinationResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a file via rename so readers never observe a partial write
    fn write_file(path: &Path, bytes: &[u8]) -> CoordinationResult<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn remove_file(path: &Path) -> CoordinationResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_status(key: &str, path: &Path) -> CoordinationResult<LockStatus> {
        match Self::read_file(path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoordinationError::corrupt(key, e.to_string())),
            None => Ok(LockStatus::default()),
        }
    }

    fn write_status(path: &Path, status: &LockStatus) -> CoordinationResult<()> {
        if status.holders.is_empty() {
            Self::remove_file(path)
        } else {
            Self::write_file(path, &serde_json::to_vec(status)?)
        }
    }

    fn read_flag(name: &str, path: &Path) -> CoordinationResult<Option<FlagRecord>> {
        match Self::read_file(path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CoordinationError::corrupt(name, e.to_string())),
            None => Ok(None),
        }
    }

    fn release_everything(&self) {
        let held: Vec<(String, LockKind)> = self.held.lock().drain().collect();
        for (key, kind) in held {
            if let Err(e) = self.release(&key, kind) {
                warn!("Failed to release lock '{key}' on shutdown: {e}");
            }
        }
        let flags: Vec<String> = self.session_flags.lock().drain().collect();
        for name in flags {
            if let Err(e) = self.clear_flag(&name) {
                warn!("Failed to clear session flag '{name}' on shutdown: {e}");
            }
        }
    }
}

impl CoordinationBackend for FileBackend {
    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn try_acquire(&self, key: &str, kind: LockKind) -> CoordinationResult<bool> {
        let path = self.resource_path("locks", key, ".status");
        let acquired = self.with_guard(&path, || {
            let now = now_ms();
            let mut status = Self::read_status(key, &path)?;
            status
                .holders
                .retain(|h| h.holder == self.holder_id || h.expires_at_ms > now);
            let conflict = status
                .holders
                .iter()
                .any(|h| h.holder != self.holder_id && !kind.compatible_with(h.kind));
            if conflict {
                return Ok(false);
            }
            status.holders.retain(|h| h.holder != self.holder_id);
            status.holders.push(LockHolder {
                holder: self.holder_id.clone(),
                kind,
                expires_at_ms: now.saturating_add(self.lease_ms()),
            });
            Self::write_status(&path, &status)?;
            Ok(true)
        })?;
        if acquired {
            self.held.lock().insert(key.to_string(), kind);
        }
        Ok(acquired)
    }

    fn release(&self, key: &str, _kind: LockKind) -> CoordinationResult<()> {
        let path = self.resource_path("locks", key, ".status");
        self.held.lock().remove(key);
        self.with_guard(&path, || {
            let now = now_ms();
            let mut status = Self::read_status(key, &path)?;
            status
                .holders
                .retain(|h| h.holder != self.holder_id && h.expires_at_ms > now);
            Self::write_status(&path, &status)
        })
    }

    fn set_flag(&self, name: &str, lifetime: FlagLifetime) -> CoordinationResult<()> {
        let path = self.resource_path("flags", name, ".flag");
        let record = match lifetime {
            FlagLifetime::Permanent => FlagRecord {
                owner: None,
                expires_at_ms: None,
            },
            FlagLifetime::Session => FlagRecord {
                owner: Some(self.holder_id.clone()),
                expires_at_ms: Some(now_ms().saturating_add(self.lease_ms())),
            },
        };
        self.with_guard(&path, || {
            Self::write_file(&path, &serde_json::to_vec(&record)?)
        })?;
        let mut session_flags = self.session_flags.lock();
        if lifetime == FlagLifetime::Session {
            session_flags.insert(name.to_string());
        } else {
            session_flags.remove(name);
        }
        Ok(())
    }

    fn clear_flag(&self, name: &str) -> CoordinationResult<()> {
        let path = self.resource_path("flags", name, ".flag");
        self.session_flags.lock().remove(name);
        self.with_guard(&path, || Self::remove_file(&path))
    }

    fn check_flag(&self, name: &str) -> CoordinationResult<bool> {
        let path = self.resource_path("flags", name, ".flag");
        self.with_guard(&path, || {
            let Some(record) = Self::read_flag(name, &path)? else {
                return Ok(false);
            };
            if record.owner.as_deref() == Some(self.holder_id.as_str()) {
                return Ok(true);
            }
            Ok(record
                .expires_at_ms
                .is_none_or(|expires| expires > now_ms()))
        })
    }

    fn read_data(&self, name: &str) -> CoordinationResult<Option<Vec<u8>>> {
        let path = self.resource_path("data", name, ".data");
        self.with_guard(&path, || Self::read_file(&path))
    }

    fn write_data(&self, name: &str, data: Option<&[u8]>) -> CoordinationResult<()> {
        let path = self.resource_path("data", name, ".data");
        self.with_guard(&path, || match data {
            Some(bytes) => Self::write_file(&path, bytes),
            None => Self::remove_file(&path),
        })
    }

    fn renew_leases(&self) -> CoordinationResult<usize> {
        let expires = now_ms().saturating_add(self.lease_ms());
        let mut renewed = 0;

        let held: Vec<String> = self.held.lock().keys().cloned().collect();
        for key in held {
            let path = self.resource_path("locks", &key, ".status");
            let found = self.with_guard(&path, || {
                let mut status = Self::read_status(&key, &path)?;
                let mut found = false;
                for holder in &mut status.holders {
                    if holder.holder == self.holder_id {
                        holder.expires_at_ms = expires;
                        found = true;
                    }
                }
                if found {
                    Self::write_status(&path, &status)?;
                }
                Ok(found)
            })?;
            if found {
                renewed += 1;
            } else {
                warn!("Lease on lock '{key}' was lost before renewal");
            }
        }

        let flags: Vec<String> = self.session_flags.lock().iter().cloned().collect();
        for name in flags {
            let path = self.resource_path("flags", &name, ".flag");
            let record = FlagRecord {
                owner: Some(self.holder_id.clone()),
                expires_at_ms: Some(expires),
            };
            self.with_guard(&path, || {
                Self::write_file(&path, &serde_json::to_vec(&record)?)
            })?;
            renewed += 1;
        }

        debug!("Renewed {renewed} leases for holder {}", self.holder_id);
        Ok(renewed)
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        self.release_everything();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, lease_ms: u64) -> FileBackend {
        FileBackend::open(dir.path(), Duration::from_millis(lease_ms)).expect("open backend")
    }

    #[test]
    fn test_conflicting_holders_across_backends() {
        let dir = TempDir::new().expect("temp dir");
        let a = open(&dir, 60_000);
        let b = open(&dir, 60_000);

        assert!(a.try_acquire("k", LockKind::Read).expect("a read"));
        assert!(b.try_acquire("k", LockKind::Read).expect("b read"));
        assert!(b.try_acquire("k2", LockKind::Write).expect("free"));
        assert!(!a.try_acquire("k2", LockKind::Read).expect("conflict"));

        a.release("k", LockKind::Read).expect("release");
        assert!(!a.try_acquire("k", LockKind::Write).expect("b still reads"));
        b.release("k", LockKind::Read).expect("release");
        assert!(a.try_acquire("k", LockKind::Write).expect("now free"));
    }

    #[test]
    fn test_expired_hold_is_ignored() {
        let dir = TempDir::new().expect("temp dir");
        let crashed = open(&dir, 1);
        assert!(crashed.try_acquire("k", LockKind::Write).expect("write"));
        // Simulate a crash: the holder never releases or renews.
        std::mem::forget(crashed);
        std::thread::sleep(Duration::from_millis(20));

        let survivor = open(&dir, 60_000);
        assert!(survivor.try_acquire("k", LockKind::Write).expect("lease lapsed"));
    }

    #[test]
    fn test_session_flag_visibility() {
        let dir = TempDir::new().expect("temp dir");
        let owner = open(&dir, 1);
        let observer = open(&dir, 60_000);

        owner.set_flag("active", FlagLifetime::Session).expect("set");
        assert!(owner.check_flag("active").expect("own flag"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(owner.check_flag("active").expect("own flag never lapses for owner"));
        assert!(!observer.check_flag("active").expect("lapsed for others"));

        observer.set_flag("perm", FlagLifetime::Permanent).expect("set");
        assert!(owner.check_flag("perm").expect("permanent flag"));
    }

    #[test]
    fn test_data_roundtrip_and_delete() {
        let dir = TempDir::new().expect("temp dir");
        let a = open(&dir, 60_000);
        let b = open(&dir, 60_000);
        a.write_data("blob/with/slashes", Some(&[1, 2, 3])).expect("write");
        assert_eq!(
            b.read_data("blob/with/slashes").expect("read"),
            Some(vec![1, 2, 3])
        );
        b.write_data("blob/with/slashes", None).expect("delete");
        assert_eq!(a.read_data("blob/with/slashes").expect("read"), None);
    }

    #[test]
    fn test_drop_releases_holds() {
        let dir = TempDir::new().expect("temp dir");
        {
            let a = open(&dir, 60_000);
            assert!(a.try_acquire("k", LockKind::Write).expect("write"));
        }
        let b = open(&dir, 60_000);
        assert!(b.try_acquire("k", LockKind::Write).expect("released on drop"));
    }
}
