//! Rate limiting logic and state management.

mod bucket;
mod governor;
mod key;
mod policy;
mod store;

pub use bucket::TokenBucket;
pub use governor::{Decision, RateGovernor, Rejection, DEFAULT_SWEEP_INTERVAL};
pub use key::{ClientKey, EndpointKey, LimiterKey};
pub use policy::{PolicyTable, RatePolicy};
pub use store::{LimiterEntry, LimiterHandle, QuotaStore};
