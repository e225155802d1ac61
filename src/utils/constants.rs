//! Shared configuration constants for crawl coordination
//!
//! Default values and reserved name prefixes used throughout the crate.
//! The prefixes partition the shared coordination namespace so that service
//! bookkeeping, cache invalidation stamps and throttle apportionment never
//! collide with caller-chosen lock keys.

/// Default back-off between attempts to take a cross-process lock: 10ms
///
/// Only applies when another process holds the key; in-process contention
/// is woken directly by the releasing thread.
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 10;

/// Default slice for cancellation checks while blocked: 100ms
///
/// Upper bound on how long a cancelled caller may stay blocked before
/// observing its token.
pub const DEFAULT_CANCEL_CHECK_INTERVAL_MS: u64 = 100;

/// Default lease on cross-process holds: 60 seconds
///
/// A process that dies while holding a lock or an active-service flag
/// releases it implicitly once the lease lapses without renewal.
pub const DEFAULT_LEASE_DURATION_MS: u64 = 60_000;

/// Default lease renewal period: 15 seconds
///
/// Must be comfortably shorter than the lease so a single delayed
/// heartbeat does not expire live holds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default throttle apportionment poll period: 5 seconds
pub const DEFAULT_THROTTLE_POLL_INTERVAL_MS: u64 = 5_000;

/// Prefix of the write lock serialising registration per service type
pub const SERVICE_LOCK_PREFIX: &str = "_SERVICELOCK_";

/// Prefix of the indexed service list entries
pub const SERVICE_LIST_PREFIX: &str = "_SERVICELIST_";

/// Prefix of the permanent "registered" flag
pub const SERVICE_PREFIX: &str = "_SERVICE_";

/// Prefix of the session-lifetime "active" flag
pub const ACTIVE_PREFIX: &str = "_ACTIVE_";

/// Prefix of per-service data blobs
pub const SERVICE_DATA_PREFIX: &str = "_SERVICEDATA_";

/// Prefix of generated service names
pub const ANONYMOUS_SERVICE_PREFIX: &str = "_ANON_";

/// Prefix of the per-type anonymous name counter
pub const SERVICE_COUNTER_PREFIX: &str = "_SERVICECOUNTER_";

/// Prefix applied to cache keys when they are used as lock keys
pub const CACHE_LOCK_PREFIX: &str = "_Cache_";

/// Prefix of shared invalidation timestamps, one per cache key
pub const CACHE_STAMP_PREFIX: &str = "cache-";

/// Service type prefix for throttle groups
pub const THROTTLE_POOL_PREFIX: &str = "_THROTTLEPOOL_";

/// Service type prefix for connection-count bins
pub const CONNECTION_BIN_PREFIX: &str = "_CONNECTIONBIN_";

/// Lock prefix guarding connection-count apportionment
pub const CONNECTION_BIN_TARGET_PREFIX: &str = "_CONNECTIONBINTARGET_";

/// Service type prefix for fetch-interval bins
pub const FETCH_BIN_PREFIX: &str = "_FETCHBIN_";

/// Lock prefix guarding fetch-interval apportionment
pub const FETCH_BIN_TARGET_PREFIX: &str = "_FETCHBINTARGET_";

/// Service type prefix for byte-rate bins
pub const THROTTLE_BIN_PREFIX: &str = "_THROTTLEBIN_";

/// Lock prefix guarding byte-rate apportionment
pub const THROTTLE_BIN_TARGET_PREFIX: &str = "_THROTTLEBINTARGET_";
