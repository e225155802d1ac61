//! Throttle limits per bin

use regex::Regex;
use std::fmt;

use crate::error::{CoordinationError, CoordinationResult};

/// Limits applied to the bins of one throttle group
///
/// Limits are global: every process sharing the group splits them between
/// its members when polled.
pub trait ThrottleSpec: Send + Sync + fmt::Debug {
    /// Most connections open at once against `bin`; `None` is unlimited
    fn max_open_connections(&self, bin: &str) -> Option<u32>;

    /// Minimum average milliseconds per byte read from `bin`; `0.0` is unlimited
    fn min_ms_per_byte(&self, bin: &str) -> f64;

    /// Minimum milliseconds between fetch starts against `bin`; `0` is unlimited
    fn min_ms_per_fetch(&self, bin: &str) -> u64;
}

/// Milliseconds per byte for a rate in bytes per second
#[must_use]
pub fn ms_per_byte(max_bytes_per_sec: u64) -> f64 {
    if max_bytes_per_sec == 0 {
        0.0
    } else {
        1000.0 / max_bytes_per_sec as f64
    }
}

/// Milliseconds between fetches for a rate in fetches per minute
#[must_use]
pub fn ms_per_fetch(max_fetches_per_min: u64) -> u64 {
    if max_fetches_per_min == 0 {
        0
    } else {
        60_000 / max_fetches_per_min
    }
}

/// The limits a rule or a fixed spec applies
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThrottleLimits {
    pub max_connections: Option<u32>,
    pub min_ms_per_byte: f64,
    pub min_ms_per_fetch: u64,
}

impl ThrottleLimits {
    /// No limits at all
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    #[must_use]
    pub fn max_bytes_per_sec(mut self, max_bytes_per_sec: u64) -> Self {
        self.min_ms_per_byte = ms_per_byte(max_bytes_per_sec);
        self
    }

    #[must_use]
    pub fn max_fetches_per_min(mut self, max_fetches_per_min: u64) -> Self {
        self.min_ms_per_fetch = ms_per_fetch(max_fetches_per_min);
        self
    }

    #[must_use]
    pub fn min_ms_per_fetch(mut self, min_ms_per_fetch: u64) -> Self {
        self.min_ms_per_fetch = min_ms_per_fetch;
        self
    }
}

/// The same limits for every bin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedThrottleSpec {
    limits: ThrottleLimits,
}

impl FixedThrottleSpec {
    #[must_use]
    pub fn new(limits: ThrottleLimits) -> Self {
        Self { limits }
    }
}

impl ThrottleSpec for FixedThrottleSpec {
    fn max_open_connections(&self, _bin: &str) -> Option<u32> {
        self.limits.max_connections
    }

    fn min_ms_per_byte(&self, _bin: &str) -> f64 {
        self.limits.min_ms_per_byte
    }

    fn min_ms_per_fetch(&self, _bin: &str) -> u64 {
        self.limits.min_ms_per_fetch
    }
}

/// Limits chosen by matching bin names against regular expressions
///
/// When several rules match a bin, the most permissive limit of each kind
/// wins. Bins no rule matches are unlimited. A connection limit of zero in a
/// rule is raised to one.
#[derive(Debug, Clone, Default)]
pub struct RegexThrottleSpec {
    rules: Vec<(Regex, ThrottleLimits)>,
}

impl RegexThrottleSpec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule
    ///
    /// # Errors
    ///
    /// `Setup` if `pattern` is not a valid regular expression.
    pub fn add_rule(&mut self, pattern: &str, mut limits: ThrottleLimits) -> CoordinationResult<()> {
        let regex = Regex::new(pattern)
            .map_err(|e| CoordinationError::Setup(format!("Invalid bin pattern '{pattern}': {e}")))?;
        if limits.max_connections == Some(0) {
            limits.max_connections = Some(1);
        }
        self.rules.push((regex, limits));
        Ok(())
    }

    pub fn with_rule(mut self, pattern: &str, limits: ThrottleLimits) -> CoordinationResult<Self> {
        self.add_rule(pattern, limits)?;
        Ok(self)
    }

    fn matching<'a>(&'a self, bin: &'a str) -> impl Iterator<Item = &'a ThrottleLimits> + 'a {
        self.rules
            .iter()
            .filter(move |(regex, _)| regex.is_match(bin))
            .map(|(_, limits)| limits)
    }
}

impl ThrottleSpec for RegexThrottleSpec {
    fn max_open_connections(&self, bin: &str) -> Option<u32> {
        let mut matched = false;
        let mut best: Option<u32> = Some(0);
        for limits in self.matching(bin) {
            matched = true;
            best = match (best, limits.max_connections) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
        }
        if matched { best } else { None }
    }

    fn min_ms_per_byte(&self, bin: &str) -> f64 {
        self.matching(bin)
            .map(|limits| limits.min_ms_per_byte)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    fn min_ms_per_fetch(&self, bin: &str) -> u64 {
        self.matching(bin)
            .map(|limits| limits.min_ms_per_fetch)
            .min()
            .unwrap_or(0)
    }
}
