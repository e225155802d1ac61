//! Hooks invoked while the service registry reclaims state

use crate::error::CoordinationResult;

/// Callbacks run under the service type's write lock during registration
/// and inactive-service cleanup
///
/// Implementations typically reset rows or queues owned by a crawler node.
/// An error aborts the registry operation that triggered it.
pub trait ServiceCleanup {
    /// Reset state belonging to one departed service
    fn clean_up_service(&self, service_name: &str) -> CoordinationResult<()>;

    /// Reset state belonging to every service of the type
    fn clean_up_all_services(&self) -> CoordinationResult<()>;

    /// Initialise shared state before the first service of a cluster starts
    fn cluster_init(&self) -> CoordinationResult<()>;
}
