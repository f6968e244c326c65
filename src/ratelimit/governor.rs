//! Admission decisions and background eviction.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::key::{ClientKey, EndpointKey, LimiterKey};
use super::store::QuotaStore;

/// How often idle entries are swept when no interval is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A token was consumed; the request may proceed
    Allowed,
    /// The bucket was empty; the request must be turned away
    Rejected(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Details reported to a rejected caller.
///
/// `limit` and `burst` are the configured values for the endpoint, not the
/// instantaneous bucket state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub endpoint: EndpointKey,
    pub limit: u32,
    pub burst: u32,
}

/// Resolves admission for incoming requests against a [`QuotaStore`].
#[derive(Clone)]
pub struct RateGovernor {
    store: Arc<QuotaStore>,
}

impl RateGovernor {
    pub fn new(store: Arc<QuotaStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<QuotaStore> {
        &self.store
    }

    /// Decide whether `client` may call `method` on `route` at `now`.
    ///
    /// Never blocks and never fails: unconfigured endpoints use the default policy.
    pub fn admit(&self, method: &str, route: &str, client: &str, now: Instant) -> Decision {
        self.admit_key(EndpointKey::new(method, route), ClientKey::new(client), now)
    }

    /// Same as [`RateGovernor::admit`] for an already built endpoint key.
    pub fn admit_key(&self, endpoint: EndpointKey, client: ClientKey, now: Instant) -> Decision {
        let key = LimiterKey::new(endpoint, client);
        let entry = self.store.resolve(&key, now);

        trace!(key = %key, "Checking rate limit");

        if entry.try_acquire(now) {
            return Decision::Allowed;
        }

        let policy = self.store.policy(&key.endpoint);
        debug!(
            key = %key,
            limit = policy.requests_per_minute,
            burst = policy.burst_size,
            "Rate limit exceeded"
        );

        Decision::Rejected(Rejection {
            limit: policy.requests_per_minute,
            burst: policy.burst_size,
            endpoint: key.endpoint,
        })
    }

    /// Spawn the background task that evicts idle entries every `interval`.
    ///
    /// The task runs until `shutdown` is cancelled. The first sweep happens one
    /// full interval after the call. Panics if `interval` is zero.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(interval_secs = interval.as_secs_f64(), "Limiter sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep(Instant::now());
                        if evicted > 0 {
                            info!(
                                evicted,
                                remaining = store.len(),
                                "Evicted idle limiter entries"
                            );
                        }
                    }
                }
            }

            info!("Limiter sweeper stopped");
        })
    }
}
