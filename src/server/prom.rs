use axum::extract::State;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};

use super::ServerState;

/// Handle Prometheus metrics scraping.
pub(super) async fn prometheus_scrape(State(state): State<ServerState>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.metrics.render())
}
