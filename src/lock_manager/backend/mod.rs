//! Pluggable coordination backends
//!
//! A backend carries the state that must be visible to every cooperating
//! process: global lock holds, flags and shared data blobs. The lock manager
//! layers process-local exclusion and per-session reentrancy on top, so a
//! backend only ever sees one hold per key from its own process.
//!
//! Backends are chosen once at startup from [`BackendConfig`].

mod file;
mod in_process;

pub use file::FileBackend;
pub use in_process::InProcessBackend;

use crate::config::{BackendConfig, CoordinationConfig};
use crate::error::CoordinationResult;
use crate::lock_manager::LockKind;
use std::fmt;
use std::sync::Arc;

/// How long a flag outlives the process that set it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagLifetime {
    /// Survives until explicitly cleared
    Permanent,
    /// Lapses with the setting process's lease
    Session,
}

/// Cross-process coordination primitive
pub trait CoordinationBackend: Send + Sync + fmt::Debug {
    /// Identity of this process in shared state
    fn holder_id(&self) -> &str;

    /// Take a global hold of `kind` on `key` without blocking.
    ///
    /// Returns `Ok(false)` when another process holds a conflicting kind.
    fn try_acquire(&self, key: &str, kind: LockKind) -> CoordinationResult<bool>;

    /// Drop this process's global hold on `key`
    fn release(&self, key: &str, kind: LockKind) -> CoordinationResult<()>;

    fn set_flag(&self, name: &str, lifetime: FlagLifetime) -> CoordinationResult<()>;

    fn clear_flag(&self, name: &str) -> CoordinationResult<()>;

    /// Whether the flag is set and, for session flags, its owner's lease is current
    fn check_flag(&self, name: &str) -> CoordinationResult<bool>;

    fn read_data(&self, name: &str) -> CoordinationResult<Option<Vec<u8>>>;

    /// Replace the named blob; `None` deletes it
    fn write_data(&self, name: &str, data: Option<&[u8]>) -> CoordinationResult<()>;

    /// Extend the lease of every hold and session flag owned by this process.
    ///
    /// Returns how many entries were renewed.
    fn renew_leases(&self) -> CoordinationResult<usize>;
}

/// Construct the backend named by the configuration
///
/// # Errors
///
/// Returns an error if the file backend's synch directory cannot be created.
pub fn open_backend(config: &CoordinationConfig) -> CoordinationResult<Arc<dyn CoordinationBackend>> {
    match config.backend() {
        BackendConfig::InProcess => Ok(Arc::new(InProcessBackend::new())),
        BackendConfig::File { synch_directory } => Ok(Arc::new(FileBackend::open(
            synch_directory,
            config.lease_duration(),
        )?)),
    }
}
