pub mod health;
pub mod metrics;
pub mod playlist;
pub mod proxy;
pub mod segment;
pub mod stream;

use crate::error::Result;
use axum::response::Response;
use std::time::Instant;

/// Record request count and latency for `endpoint`, whatever the outcome.
fn observe(endpoint: &'static str, start: Instant, result: Result<Response>) -> Result<Response> {
    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => e.status_code(),
    };
    crate::metrics::record_request(endpoint, status.as_u16());
    crate::metrics::record_duration(endpoint, start);
    result
}
