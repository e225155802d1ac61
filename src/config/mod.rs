//! Configuration module for coordination
//!
//! This module provides the `CoordinationConfig` struct and its type-safe builder
//! for choosing a backend and tuning lock, lease, cache and throttle timings.

// Sub-modules
pub mod builder;
pub mod getters;
pub mod types;

// Re-exports for public API
pub use builder::{CoordinationConfigBuilder, WithBackend};
pub use types::{BackendConfig, CoordinationConfig};
