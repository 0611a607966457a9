//! Stop-condition configurations for routing and fan-out.

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Which transport a request should go over.
///
/// Carried through to the RPC collaborators untouched.
pub enum TransportPreference {
    #[default]
    Default,
    ForceUdp,
    ForceTcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// When an iterative routing lookup stops.
pub struct RoutingConfig {
    max_direct_hits: usize,
    max_no_new_info: usize,
    max_failures: usize,
    max_success: usize,
    parallelism: usize,
    transport: TransportPreference,
}

impl RoutingConfig {
    /// Create a routing configuration.
    ///
    /// Fails with [Error::InvalidConfig] if any count is negative.
    pub fn new(
        max_direct_hits: i64,
        max_no_new_info: i64,
        max_failures: i64,
        max_success: i64,
        parallelism: i64,
    ) -> Result<Self> {
        Ok(Self {
            max_direct_hits: count("max_direct_hits", max_direct_hits)?,
            max_no_new_info: count("max_no_new_info", max_no_new_info)?,
            max_failures: count("max_failures", max_failures)?,
            max_success: count("max_success", max_success)?,
            parallelism: count("parallelism", parallelism)?,
            transport: TransportPreference::Default,
        })
    }

    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport = transport;
        self
    }

    // === Getters ===

    /// Stop as soon as this many peers claim to hold the data.
    pub fn max_direct_hits(&self) -> usize {
        self.max_direct_hits
    }

    /// Stop after this many consecutive responses that did not improve the best candidate.
    pub fn max_no_new_info(&self) -> usize {
        self.max_no_new_info
    }

    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    pub fn max_success(&self) -> usize {
        self.max_success
    }

    /// Number of concurrent neighbor queries.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn transport(&self) -> TransportPreference {
        self.transport
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_direct_hits: usize::MAX,
            max_no_new_info: 5,
            max_failures: 3,
            max_success: 20,
            parallelism: 3,
            transport: TransportPreference::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// When a bounded fan-out stops.
pub struct RequestConfig {
    minimum_results: usize,
    max_failure: usize,
    parallel_diff: usize,
    transport: TransportPreference,
}

impl RequestConfig {
    /// Create a fan-out configuration.
    ///
    /// Fails with [Error::InvalidConfig] if any count is negative.
    pub fn new(minimum_results: i64, max_failure: i64, parallel_diff: i64) -> Result<Self> {
        Ok(Self {
            minimum_results: count("minimum_results", minimum_results)?,
            max_failure: count("max_failure", max_failure)?,
            parallel_diff: count("parallel_diff", parallel_diff)?,
            transport: TransportPreference::Default,
        })
    }

    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport = transport;
        self
    }

    // === Getters ===

    pub fn minimum_results(&self) -> usize {
        self.minimum_results
    }

    pub fn max_failure(&self) -> usize {
        self.max_failure
    }

    pub fn parallel_diff(&self) -> usize {
        self.parallel_diff
    }

    /// Number of concurrent requests: `minimum_results + parallel_diff`.
    pub fn parallel(&self) -> usize {
        self.minimum_results.saturating_add(self.parallel_diff)
    }

    pub fn transport(&self) -> TransportPreference {
        self.transport
    }

    // === Public Methods ===

    /// A copy that never waits for more results than `actual` replicas can give.
    pub fn adjust_to_actual(&self, actual: usize) -> Self {
        Self {
            minimum_results: self.minimum_results.min(actual),
            ..*self
        }
    }

    /// A copy that asks every one of `count` peers and tolerates all of them failing.
    pub fn broadcast(&self, count: usize) -> Self {
        Self {
            minimum_results: count,
            max_failure: count,
            parallel_diff: 0,
            ..*self
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            minimum_results: 3,
            max_failure: 5,
            parallel_diff: 0,
            transport: TransportPreference::Default,
        }
    }
}

fn count(field: &'static str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidConfig { field, value })
}
