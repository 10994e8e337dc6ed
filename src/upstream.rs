//! Upstream HTTP fetching and header forwarding.
//!
//! Every manifest, segment and key fetch goes through [`fetch`], which
//! forwards the viewer's request headers and turns any non-200 answer into a
//! [`ProxyError`]. Failures are never retried here; players retry on their own.

use crate::error::{ProxyError, Result};
use crate::metrics;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Substituted when the viewer sends no `User-Agent` of its own.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Request headers never forwarded upstream.
///
/// `accept-encoding` is dropped because `content-encoding` is stripped on the
/// way back, so the body must reach the proxy uncompressed. Range and
/// conditional headers are dropped because bodies are always fetched and
/// cached whole; only a full 200 is accepted.
fn skip_request_header(name: &HeaderName) -> bool {
    [
        header::HOST,
        header::ACCEPT_ENCODING,
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
        header::CONTENT_LENGTH,
        header::RANGE,
        header::IF_RANGE,
        header::IF_MATCH,
        header::IF_NONE_MATCH,
        header::IF_MODIFIED_SINCE,
        header::IF_UNMODIFIED_SINCE,
    ]
    .contains(name)
}

/// Upstream response headers recomputed by the proxy layer.
fn skip_response_header(name: &HeaderName) -> bool {
    [
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::CONTENT_ENCODING,
        header::CONTENT_TYPE,
        header::CONNECTION,
    ]
    .contains(name)
}

/// Options for [`fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Optional per-request timeout. When `None`, the client's own timeout applies.
    pub timeout: Option<Duration>,
}

/// Build the shared HTTP client used for all upstream traffic.
pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build()
}

/// Copy the viewer's request headers for the upstream request.
pub fn forward_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 1);
    for (name, value) in incoming {
        if !skip_request_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
    }
    headers
}

/// Copy upstream response headers that are safe to hand back to the viewer.
pub fn forward_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !skip_response_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// GET `url` with the given (already forwarded) headers.
///
/// Redirects are followed by the client; callers can read the final URL from
/// [`Response::url`].
///
/// # Errors
///
/// [`ProxyError::UpstreamRequest`] on network failure and
/// [`ProxyError::UpstreamStatus`] for any status other than 200.
pub async fn fetch(
    client: &Client,
    url: &Url,
    headers: HeaderMap,
    config: &FetchConfig,
) -> Result<Response> {
    let mut request = client.get(url.clone()).headers(headers);
    if let Some(timeout) = config.timeout {
        request = request.timeout(timeout);
    }

    let response = request.send().await.map_err(|e| {
        warn!("Upstream fetch failed for {}: {}", url, e);
        metrics::record_upstream_error();
        ProxyError::UpstreamRequest(e)
    })?;

    let status = response.status();
    if status != StatusCode::OK {
        warn!("Upstream fetch returned {} for {}", status, url);
        metrics::record_upstream_error();
        return Err(ProxyError::UpstreamStatus {
            url: url.to_string(),
            status,
        });
    }

    debug!("Upstream {} answered from {}", url, response.url());
    Ok(response)
}
