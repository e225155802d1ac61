//! Lock-coordinated object cache with key-based invalidation

pub mod cache_keys;
mod description;
mod executor;
mod handle;
mod lru_classes;
mod manager;
mod store;
mod string_set;
mod transaction;

pub use description::{BasicCacheDescription, CacheClass, CacheDescription, CachedObject};
pub use executor::CacheExecutor;
pub use handle::{CacheCreateHandle, CacheHandle};
pub use manager::CacheManager;
pub use store::Cache;
pub use string_set::StringSet;
