//! HTTP rendering of a rate limit rejection.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::Rejection;

/// JSON body of a 429 response. Field order is part of the wire contract.
#[derive(Debug, Serialize)]
struct RejectionBody<'a> {
    error: &'static str,
    success: bool,
    endpoint: &'a str,
    limit: u32,
    burst: u32,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: "Rate limit exceeded",
            success: false,
            endpoint: self.endpoint.as_str(),
            limit: self.limit,
            burst: self.burst,
        };
        (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
    }
}
