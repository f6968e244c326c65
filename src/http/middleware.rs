//! axum middleware that runs every request through the rate governor.

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::config::EndpointKeySource;
use crate::ratelimit::{ClientKey, Decision, EndpointKey, RateGovernor};

/// Client key used when no address can be determined.
const UNKNOWN_CLIENT: &str = "unknown";

/// Route identifier for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

/// State shared by every invocation of [`rate_limit`].
#[derive(Clone)]
pub struct GovernorState {
    governor: RateGovernor,
    key_source: EndpointKeySource,
    trust_forwarded_headers: bool,
}

impl GovernorState {
    pub fn new(governor: RateGovernor) -> Self {
        Self {
            governor,
            key_source: EndpointKeySource::default(),
            trust_forwarded_headers: false,
        }
    }

    pub fn with_key_source(mut self, key_source: EndpointKeySource) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn with_trusted_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }
}

/// Admit the request or answer it with 429 before it reaches the handler.
pub async fn rate_limit(
    State(state): State<GovernorState>,
    request: Request,
    next: Next,
) -> Response {
    let endpoint = endpoint_key(&request, state.key_source);
    let client = client_key(&request, state.trust_forwarded_headers);

    match state.governor.admit_key(endpoint, client, Instant::now()) {
        Decision::Allowed => next.run(request).await,
        Decision::Rejected(rejection) => rejection.into_response(),
    }
}

/// `METHOD:/route` for the request.
///
/// With [`EndpointKeySource::Route`] the matched route template is used, so
/// path parameters share one quota. Requests that matched no route all share
/// the [`UNMATCHED_ROUTE`] key for their method.
fn endpoint_key<B>(request: &Request<B>, source: EndpointKeySource) -> EndpointKey {
    let route = match source {
        EndpointKeySource::Route => request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str())
            .unwrap_or(UNMATCHED_ROUTE),
        EndpointKeySource::Path => request.uri().path(),
    };
    EndpointKey::new(request.method().as_str(), route)
}

fn client_key<B>(request: &Request<B>, trust_forwarded_headers: bool) -> ClientKey {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_ip(request) {
            return ClientKey::new(ip.to_string());
        }
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => ClientKey::new(addr.ip().to_string()),
        None => ClientKey::new(UNKNOWN_CLIENT),
    }
}

fn forwarded_ip<B>(request: &Request<B>) -> Option<IpAddr> {
    let headers = request.headers();

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').map(str::trim).find_map(parse_ip))
    {
        return Some(ip);
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| parse_ip(raw.trim()))
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{PolicyTable, QuotaStore, RatePolicy};
    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(table: PolicyTable) -> GovernorState {
        GovernorState::new(RateGovernor::new(Arc::new(QuotaStore::new(table))))
    }

    fn app(state: GovernorState) -> Router {
        Router::new()
            .route("/api/v1/packages", get(|| async { "list" }))
            .route("/api/v1/packages/{id}", get(|| async { "one" }))
            .layer(axum::middleware::from_fn_with_state(state, rate_limit))
    }

    fn request(uri: &str, peer: &str) -> Request {
        let peer: SocketAddr = peer.parse().unwrap();
        http::Request::builder()
            .uri(uri)
            .extension(ConnectInfo(peer))
            .body(Body::empty())
            .unwrap()
    }

    async fn status(app: &Router, request: Request) -> StatusCode {
        app.clone().oneshot(request).await.unwrap().status()
    }

    #[test]
    fn test_endpoint_key_without_match() {
        let req = http::Request::builder()
            .method("POST")
            .uri("/api/v1/packages?page=2")
            .body(())
            .unwrap();

        assert_eq!(
            endpoint_key(&req, EndpointKeySource::Route).as_str(),
            "POST:<unmatched>"
        );
        assert_eq!(
            endpoint_key(&req, EndpointKeySource::Path).as_str(),
            "POST:/api/v1/packages"
        );
    }

    #[test]
    fn test_client_key_from_peer_address() {
        let req = request("/", "10.0.0.1:52000");
        assert_eq!(client_key(&req, false).as_str(), "10.0.0.1");
    }

    #[test]
    fn test_client_key_without_connect_info() {
        let req = http::Request::builder().uri("/").body(()).unwrap();
        assert_eq!(client_key(&req, false).as_str(), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_forwarded_headers_ignored_unless_trusted() {
        let peer: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let req = http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .extension(ConnectInfo(peer))
            .body(())
            .unwrap();

        assert_eq!(client_key(&req, false).as_str(), "10.0.0.1");
        assert_eq!(client_key(&req, true).as_str(), "203.0.113.9");
    }

    #[test]
    fn test_real_ip_fallback() {
        let req = http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "garbage")
            .header("x-real-ip", "198.51.100.4")
            .body(())
            .unwrap();

        assert_eq!(client_key(&req, true).as_str(), "198.51.100.4");
    }

    #[tokio::test]
    async fn test_rejects_after_burst() {
        let app = app(state(PolicyTable::new(RatePolicy::new(60, 3, 5))));

        for _ in 0..3 {
            let s = status(&app, request("/api/v1/packages", "10.0.0.1:1")).await;
            assert_eq!(s, StatusCode::OK);
        }
        let s = status(&app, request("/api/v1/packages", "10.0.0.1:1")).await;
        assert_eq!(s, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_second_client_unaffected() {
        let app = app(state(PolicyTable::new(RatePolicy::new(60, 1, 5))));

        assert_eq!(status(&app, request("/api/v1/packages", "10.0.0.1:1")).await, StatusCode::OK);
        assert_eq!(
            status(&app, request("/api/v1/packages", "10.0.0.1:1")).await,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status(&app, request("/api/v1/packages", "10.0.0.2:1")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_route_template_shares_quota_across_ids() {
        let state = state(PolicyTable::new(RatePolicy::new(60, 1, 5)));
        let app = app(state.clone());

        assert_eq!(status(&app, request("/api/v1/packages/1", "10.0.0.1:1")).await, StatusCode::OK);
        assert_eq!(
            status(&app, request("/api/v1/packages/2", "10.0.0.1:1")).await,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(state.governor().store().len(), 1);
    }

    #[tokio::test]
    async fn test_literal_path_keys_each_id_separately() {
        let state = state(PolicyTable::new(RatePolicy::new(60, 1, 5)))
            .with_key_source(EndpointKeySource::Path);
        let app = app(state.clone());

        assert_eq!(status(&app, request("/api/v1/packages/1", "10.0.0.1:1")).await, StatusCode::OK);
        assert_eq!(status(&app, request("/api/v1/packages/2", "10.0.0.1:1")).await, StatusCode::OK);
        assert_eq!(state.governor().store().len(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_paths_share_one_entry() {
        let state = state(PolicyTable::new(RatePolicy::new(60, 100, 5)));
        let app = app(state.clone());

        for i in 0..20 {
            let uri = format!("/nope/{}", i);
            assert_eq!(status(&app, request(&uri, "10.0.0.1:1")).await, StatusCode::NOT_FOUND);
        }

        let store = state.governor().store();
        assert_eq!(store.len(), 1);
        assert!(store.contains(&crate::ratelimit::LimiterKey::new(
            EndpointKey::new("GET", UNMATCHED_ROUTE),
            ClientKey::new("10.0.0.1"),
        )));
    }

    #[tokio::test]
    async fn test_unmatched_paths_are_limited_together() {
        let app = app(state(PolicyTable::new(RatePolicy::new(60, 1, 5))));

        assert_eq!(status(&app, request("/a", "10.0.0.1:1")).await, StatusCode::NOT_FOUND);
        assert_eq!(
            status(&app, request("/b", "10.0.0.1:1")).await,
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
