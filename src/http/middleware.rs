//! Admission middleware: identity extraction and decision-to-response mapping.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::AdmissionBackend;

/// Message returned with every rate-limit rejection.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

const FORWARDED_FOR: &str = "x-forwarded-for";
const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Shared state for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    backend: Arc<dyn AdmissionBackend>,
    token_header: HeaderName,
}

impl AdmissionState {
    /// Create middleware state reading the API token from `token_header`.
    pub fn new(backend: Arc<dyn AdmissionBackend>, token_header: &str) -> Result<Self> {
        let token_header = HeaderName::from_bytes(token_header.as_bytes()).map_err(|e| {
            GatekeeperError::Config(format!("invalid token header '{}': {}", token_header, e))
        })?;
        Ok(Self {
            backend,
            token_header,
        })
    }
}

#[derive(Debug, Serialize)]
struct MessageBody {
    message: &'static str,
}

/// Admit or reject a request based on its client identity.
///
/// Allowed requests are forwarded with `X-RateLimit-*` headers attached.
/// Denied requests get `429 Too Many Requests`; backend failures get
/// `500 Internal Server Error` so they are never mistaken for a rate limit.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);
    let token = api_token(request.headers(), &state.token_header);

    let result = match state.backend.check(&ip, &token).await {
        Ok(result) => result,
        Err(e) => {
            error!(ip = %ip, error = %e, "Admission check failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageBody {
                    message: "internal error",
                }),
            )
                .into_response();
        }
    };

    if !result.allowed {
        warn!(
            ip = %ip,
            count = result.count,
            limit = result.limit,
            block_remaining = ?result.block_remaining,
            "Request rejected"
        );

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(MessageBody {
                message: RATE_LIMITED_MESSAGE,
            }),
        )
            .into_response();

        let retry_after = retry_after_secs(result.block_remaining);
        if retry_after > 0 {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
        return response;
    }

    debug!(ip = %ip, count = result.count, limit = result.limit, "Request admitted");

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(result.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(result.remaining()));
    response
}

/// The client IP: first `X-Forwarded-For` entry, else the peer address
/// without its port, else an empty string.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    match (forwarded, peer) {
        (Some(first), _) => first.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => String::new(),
    }
}

/// The API token from `header`, empty when missing or not valid text.
pub fn api_token(headers: &HeaderMap, header: &HeaderName) -> String {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
