// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-visitor rate limiting middleware for Axum.
//!
//! Every request is attributed to a [`Principal`] (the client IP) and charged
//! one token from that principal's bucket.
//!
//! ## Response Headers
//!
//! - Admitted requests carry `X-RateLimit-Limit`
//! - Refused requests get `429 Too Many Requests`, `Retry-After` in whole
//!   seconds, `X-RateLimit-Limit` and `X-RateLimit-Remaining: 0`

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::domain::gate_config::RateLimitConfig;
use crate::domain::identity::Principal;
use crate::infrastructure::rate_limiter::{Admission, RateLimitError, RateLimiter};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const UNKNOWN_PRINCIPAL: &str = "unknown";

/// Derives the principal of a request from configured headers, falling back
/// to the peer address.
#[derive(Debug, Clone, Default)]
pub struct PrincipalExtractor {
    headers: Vec<HeaderName>,
}

impl PrincipalExtractor {
    /// Headers are consulted in order. Names that are not valid HTTP header
    /// names are skipped.
    pub fn new<S: AsRef<str>>(headers: &[S]) -> Self {
        let headers = headers
            .iter()
            .filter_map(|name| {
                let name = name.as_ref().trim();
                match HeaderName::from_bytes(name.as_bytes()) {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(header = %name, "Ignoring invalid client IP header name");
                        None
                    }
                }
            })
            .collect();
        Self { headers }
    }

    pub fn extract(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Principal {
        for name in &self.headers {
            let first = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(value) = first {
                return Principal::from(value);
            }
        }
        match peer {
            Some(addr) => Principal::from(addr.ip().to_string()),
            None => Principal::from(UNKNOWN_PRINCIPAL),
        }
    }

    fn extract_request(&self, req: &Request<Body>) -> Principal {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        self.extract(req.headers(), peer)
    }
}

/// Rate limiting state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct RateLimitLayerState {
    limiter: Arc<RateLimiter>,
    extractor: PrincipalExtractor,
}

impl RateLimitLayerState {
    pub fn new(limiter: Arc<RateLimiter>, extractor: PrincipalExtractor) -> Self {
        Self { limiter, extractor }
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        Ok(Self::new(
            Arc::new(RateLimiter::from_config(config)?),
            PrincipalExtractor::new(&config.ip_key_headers),
        ))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Charge the request's principal one token, or answer 429.
pub async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitLayerState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let principal = state.extractor.extract_request(&req);
    let limiter = &state.limiter;

    match limiter.get_visitor(&principal).try_acquire() {
        Admission::Allowed => {
            let mut response = next.run(req).await;
            if limiter.is_enabled() {
                insert_header(response.headers_mut(), X_RATELIMIT_LIMIT, &limiter.limit().to_string());
            }
            response
        }
        Admission::Limited { retry_after } => {
            let retry_after_secs = retry_after_secs(retry_after);
            warn!(
                principal = %principal,
                path = %req.uri().path(),
                limit = limiter.limit(),
                retry_after_secs = retry_after_secs,
                "Rate limit exceeded"
            );
            rate_limit_response(limiter.limit(), retry_after_secs)
        }
    }
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    retry_after.as_secs_f64().ceil().max(1.0) as u64
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

fn rate_limit_response(limit: f64, retry_after_secs: u64) -> Response {
    let body = serde_json::json!({
        "code": "RATE_LIMITED",
        "message": format!(
            "Rate limit exceeded. Limit: {} requests per second. Retry after {} seconds.",
            limit, retry_after_secs
        ),
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    insert_header(headers, header::RETRY_AFTER, &retry_after_secs.to_string());
    insert_header(headers, X_RATELIMIT_LIMIT, &limit.to_string());
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
    response
}
