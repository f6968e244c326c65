//! Per-endpoint rate policies and their lookup.
//!
//! A [`PolicyTable`] is a static snapshot: one default policy plus any number
//! of endpoint-specific overrides keyed by `METHOD:/route`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::key::EndpointKey;

const DEFAULT_REQUESTS_PER_MINUTE: u32 = 100;
const DEFAULT_BURST_SIZE: u32 = 50;
const DEFAULT_TTL_MINUTES: u32 = 5;

/// Limits applied to every (endpoint, client) pair an endpoint resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    /// Steady-state refill rate
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Bucket capacity, and the number of back-to-back requests allowed
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Idle time after which an entry may be evicted
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u32,
}

impl RatePolicy {
    pub fn new(requests_per_minute: u32, burst_size: u32, ttl_minutes: u32) -> Self {
        Self {
            requests_per_minute,
            burst_size,
            ttl_minutes,
        }
    }

    /// Tokens added to the bucket per second.
    pub fn refill_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl_minutes) * 60)
    }
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst_size: DEFAULT_BURST_SIZE,
            ttl_minutes: DEFAULT_TTL_MINUTES,
        }
    }
}

fn default_requests_per_minute() -> u32 {
    DEFAULT_REQUESTS_PER_MINUTE
}

fn default_burst_size() -> u32 {
    DEFAULT_BURST_SIZE
}

fn default_ttl_minutes() -> u32 {
    DEFAULT_TTL_MINUTES
}

/// The default policy together with its endpoint overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Applied to every endpoint without an override
    #[serde(default)]
    pub default: RatePolicy,
    /// Overrides keyed by `METHOD:/route`
    #[serde(default)]
    pub endpoints: HashMap<String, RatePolicy>,
}

impl PolicyTable {
    pub fn new(default: RatePolicy) -> Self {
        Self {
            default,
            endpoints: HashMap::new(),
        }
    }

    /// Add or replace the override for one endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, policy: RatePolicy) -> Self {
        self.endpoints.insert(endpoint.into(), policy);
        self
    }

    /// Return the override for `endpoint` if one exists, else the default.
    ///
    /// Pure lookup: store creation, sweeping and rejection rendering all go
    /// through here so they agree on the limits in force.
    pub fn resolve(&self, endpoint: &EndpointKey) -> &RatePolicy {
        self.endpoints
            .get(endpoint.as_str())
            .unwrap_or(&self.default)
    }

    /// Iterate over every configured policy, default first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RatePolicy)> {
        std::iter::once(("default", &self.default))
            .chain(self.endpoints.iter().map(|(k, v)| (k.as_str(), v)))
    }
}
