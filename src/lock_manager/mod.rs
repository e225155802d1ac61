//! Named read / non-exclusive-write / write locks and critical sections
//!
//! ```text
//! LockSystem (one per process)
//!   ├─ backend: cross-process holds, flags, shared data
//!   ├─ lock pool: one LockObject per contended key
//!   └─ section pool: process-local critical sections
//! LockManager (one per thread) ── reentrant counts per key
//! ```

pub mod backend;
mod local_locks;
mod lock_kind;
mod lock_object;
mod manager;
mod system;

pub use backend::{CoordinationBackend, FileBackend, FlagLifetime, InProcessBackend, open_backend};
pub use lock_kind::{LockKind, LockRequest, sorted_unique_requests};
pub use manager::LockManager;
pub use system::LockSystem;
