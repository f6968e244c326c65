//! Endpoint and client key handling.

use std::fmt;

/// Identifies an HTTP method + route, e.g. `GET:/api/v1/packages`.
///
/// Used both as the quota scope and as the policy lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Build a key from a method and a route identifier.
    pub fn new(method: &str, route: &str) -> Self {
        Self(format!("{}:{}", method, route))
    }

    /// Wrap an already formatted `METHOD:/route` string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller's network address as seen by the service.
///
/// Addresses are compared verbatim: no family normalization, no port stripping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key that uniquely identifies one limiter entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The endpoint this quota is scoped to
    pub endpoint: EndpointKey,
    /// The client this quota belongs to
    pub client: ClientKey,
}

impl LimiterKey {
    pub fn new(endpoint: EndpointKey, client: ClientKey) -> Self {
        Self { endpoint, client }
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.client)
    }
}
