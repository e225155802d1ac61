//! Callback interface for `CacheManager::find_objects_and_execute`

use super::description::{CacheDescription, CachedObject};
use crate::error::CoordinationResult;

/// Builds missing objects and consumes found ones inside a cache section
///
/// All three callbacks run while the section's cache locks are held;
/// `create` additionally runs inside the build critical sections.
pub trait CacheExecutor {
    /// Build the objects for `missing`, returned in the same order
    fn create(&mut self, missing: &[&dyn CacheDescription]) -> CoordinationResult<Vec<CachedObject>>;

    /// Called once per description with its cached or freshly built object
    fn exists(&mut self, description: &dyn CacheDescription, object: &CachedObject) -> CoordinationResult<()>;

    /// Called after every description has been resolved, before invalidation
    fn execute(&mut self) -> CoordinationResult<()>;
}
