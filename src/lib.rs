//! Resource coordination for crawlers
//!
//! - [`lock_manager`]: named read / non-exclusive-write / write locks and
//!   critical sections, exclusive within a process and across processes
//!   sharing a backend
//! - [`services`]: service registration and liveness on top of the locks
//! - [`cache`]: an object cache whose entries are invalidated by key under
//!   the same locks
//! - [`throttler`]: per-bin connection, fetch-rate and byte-rate limits
//!   shared fairly between processes
//! - [`housekeeping`]: lease renewal and throttle polling in the background

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod housekeeping;
pub mod lock_manager;
pub mod services;
pub mod throttler;
pub mod utils;

pub use cache::{Cache, CacheManager, StringSet};
pub use cancel::CancelToken;
pub use config::{BackendConfig, CoordinationConfig};
pub use error::{CoordinationError, CoordinationResult};
pub use housekeeping::Housekeeper;
pub use lock_manager::{LockKind, LockManager, LockSystem};
pub use services::ServiceCleanup;
pub use throttler::{FetchThrottler, StreamThrottler, ThrottleSpec, Throttler};
