//! Tollgate - per-endpoint, per-client rate limiting for HTTP services
//!
//! Each (endpoint, client address) pair gets an independent token bucket,
//! created lazily from a static policy table and evicted by a background
//! sweep once it has been idle past its policy's TTL. The `http` module
//! wires the governor into an axum router as middleware.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
