//! Connection throttling
//!
//! Bounds, per bin (usually a host name), how many connections are open at
//! once, how closely fetches follow each other and how fast bytes are read.
//! Bins live inside throttle groups, each with its own [`ThrottleSpec`].

mod connection_bin;
mod fetch;
mod fetch_bin;
mod group;
mod service_data;
mod spec;
mod throttle_bin;
#[allow(clippy::module_inception)]
mod throttler;

pub use fetch::{FetchThrottler, StreamThrottler};
pub use spec::{
    FixedThrottleSpec, RegexThrottleSpec, ThrottleLimits, ThrottleSpec, ms_per_byte, ms_per_fetch,
};
pub use throttler::Throttler;
