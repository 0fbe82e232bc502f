use axum::{
    body::HttpBody,
    extract::{MatchedPath, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::metrics::{RequestSample, Sample};
use crate::AppState;

/// Dashboard routes are never sampled.
pub const METRICS_ROUTE_PREFIX: &str = "/metrics";

/// Route-layer middleware that turns every completed request into a
/// request [`Sample`] and adds two response headers:
///
///   X-Response-Time-Us: total handler wall time in microseconds
///   Server-Timing: same value in the standard Server-Timing format
///
/// Applied with `route_layer`, so `MatchedPath` holds the route template
/// ("/users/:id"), not the concrete path.
pub async fn timing_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if is_ignored(&path, &state.metrics.config().ignored_routes) {
        return next.run(req).await;
    }

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned());
    let method = req.method().as_str().to_owned();
    let bytes_in = content_length(req.headers()).unwrap_or(0);
    let timestamp = state.metrics.now();

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros();

    // ── Inject response headers ─────────────────────────────────
    if let Ok(val) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }

    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    // ── Hand the sample to the engine ───────────────────────────
    let status = response.status().as_u16();
    let bytes_out = content_length(response.headers())
        .or_else(|| response.body().size_hint().exact())
        .unwrap_or(0);

    debug!(status, method = %method, path = %path, us = us as u64, "request sampled");
    state.metrics.ingest(Sample::request(
        timestamp,
        RequestSample {
            route,
            method: Some(method),
            status_code: Some(status),
            duration_seconds: elapsed.as_secs_f64(),
            bytes_in,
            bytes_out,
        },
    ));

    response
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// The dashboard's own routes plus any configured prefix.
pub fn is_ignored(path: &str, ignored: &[String]) -> bool {
    path.starts_with(METRICS_ROUTE_PREFIX)
        || ignored.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_and_configured_routes_are_ignored() {
        let ignored = vec!["/sensitive".to_string()];
        assert!(is_ignored("/metrics/json", &ignored));
        assert!(is_ignored("/sensitive/key", &ignored));
        assert!(!is_ignored("/ping", &ignored));
    }

    #[test]
    fn content_length_is_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, "42".parse().unwrap());
        assert_eq!(content_length(&headers), Some(42));
    }
}
