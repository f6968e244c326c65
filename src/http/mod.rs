//! HTTP surface: the rate limiting middleware and the server that hosts it.

mod middleware;
mod rejection;
mod server;

pub use middleware::{rate_limit, GovernorState, UNMATCHED_ROUTE};
pub use server::HttpServer;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Put `routes` behind the rate limiter, with request tracing outermost.
pub fn governed(routes: Router, state: GovernorState) -> Router {
    routes
        .layer(axum::middleware::from_fn_with_state(state, rate_limit))
        .layer(TraceLayer::new_for_http())
}
