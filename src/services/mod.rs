//! Service registry: which crawler nodes and agents are alive
//!
//! The registry operations are methods on [`LockManager`](crate::lock_manager::LockManager)
//! so that they share the session's reentrant locks.

mod cleanup;
mod registry;

pub use cleanup::ServiceCleanup;
