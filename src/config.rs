//! Configuration management for Tollgate.
//!
//! Configuration is read once at startup: built-in defaults, then an optional
//! YAML file, then `TOLLGATE_*` environment overrides for scalar settings
//! (e.g. `TOLLGATE_RATE_LIMITING__DEFAULT__BURST_SIZE=20`).
//!
//! Already configured endpoint policies can be tuned the same way. The endpoint
//! key is spelled as its alphanumeric runs joined by `_`, so `GET:/api/v1/packages`
//! becomes `TOLLGATE_RATE_LIMITING__ENDPOINTS__GET_API_V1_PACKAGES__BURST_SIZE`.
//! Endpoints whose spellings coincide receive the same override.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{PolicyTable, RatePolicy, DEFAULT_SWEEP_INTERVAL};

const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only safe behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

/// Which request attribute names the endpoint half of a quota key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKeySource {
    /// The matched route template, e.g. `/api/v1/packages/{id}`
    #[default]
    Route,
    /// The literal request path, e.g. `/api/v1/packages/123`
    Path,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy for endpoints without an override
    #[serde(default)]
    pub default: RatePolicy,

    /// Per-endpoint overrides keyed by `METHOD:/route`
    #[serde(default = "default_endpoint_policies")]
    pub endpoints: HashMap<String, RatePolicy>,

    /// Interval between idle-entry sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How the endpoint key is derived from a request
    #[serde(default)]
    pub endpoint_key_source: EndpointKeySource,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default: RatePolicy::default(),
            endpoints: default_endpoint_policies(),
            sweep_interval_secs: default_sweep_interval(),
            endpoint_key_source: EndpointKeySource::default(),
        }
    }
}

fn default_endpoint_policies() -> HashMap<String, RatePolicy> {
    HashMap::from([
        ("GET:/api/v1/packages".to_string(), RatePolicy::new(200, 100, 5)),
        ("GET:/api/v1/packages/search".to_string(), RatePolicy::new(150, 75, 5)),
        ("POST:/api/v1/packages".to_string(), RatePolicy::new(50, 25, 5)),
    ])
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl RateLimitingConfig {
    /// Build the static policy table handed to the quota store.
    pub fn policy_table(&self) -> PolicyTable {
        PolicyTable {
            default: self.default,
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Apply `TOLLGATE_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        self.apply_overrides(&env)
    }

    fn apply_overrides(&mut self, source: &config::Config) -> Result<()> {
        override_from(source, "server.http_addr", &mut self.server.http_addr)?;
        override_from(
            source,
            "server.trust_forwarded_headers",
            &mut self.server.trust_forwarded_headers,
        )?;

        let rl = &mut self.rate_limiting;
        override_from(
            source,
            "rate_limiting.default.requests_per_minute",
            &mut rl.default.requests_per_minute,
        )?;
        override_from(source, "rate_limiting.default.burst_size", &mut rl.default.burst_size)?;
        override_from(source, "rate_limiting.default.ttl_minutes", &mut rl.default.ttl_minutes)?;
        override_from(
            source,
            "rate_limiting.sweep_interval_secs",
            &mut rl.sweep_interval_secs,
        )?;
        override_from(
            source,
            "rate_limiting.endpoint_key_source",
            &mut rl.endpoint_key_source,
        )?;

        for (endpoint, policy) in rl.endpoints.iter_mut() {
            let prefix = format!("rate_limiting.endpoints.{}", env_key_segment(endpoint));
            override_from(
                source,
                &format!("{}.requests_per_minute", prefix),
                &mut policy.requests_per_minute,
            )?;
            override_from(source, &format!("{}.burst_size", prefix), &mut policy.burst_size)?;
            override_from(source, &format!("{}.ttl_minutes", prefix), &mut policy.ttl_minutes)?;
        }
        Ok(())
    }

    /// Reject settings that would make the limiter unusable.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        let table = rl.policy_table();
        for (name, policy) in table.iter() {
            if policy.burst_size == 0 {
                return Err(TollgateError::Config(format!(
                    "burst_size for {} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Lowercase alphanumeric runs of `endpoint` joined by `_`, the form an
/// endpoint key takes inside an environment variable name.
fn env_key_segment(endpoint: &str) -> String {
    endpoint
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

fn override_from<T: DeserializeOwned>(
    source: &config::Config,
    key: &str,
    slot: &mut T,
) -> Result<()> {
    match source.get::<T>(key) {
        Ok(value) => {
            *slot = value;
            Ok(())
        }
        Err(config::ConfigError::NotFound(_)) => Ok(()),
        Err(e) => Err(TollgateError::Config(format!("Invalid value for {}: {}", key, e))),
    }
}
