//! Segment and key responses.
//!
//! Both are cached under their absolute upstream URL. A `key_cache_id` is
//! that same URL, not a digest of it, so ids minted by other proxies that
//! hash the URL never hit.

use crate::{
    error::{ProxyError, Result},
    server::state::AppState,
    token::ContentKind,
    upstream,
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::{debug, info};
use url::Url;

/// Serve a segment or key, from cache when possible.
pub(crate) async fn proxy_cached(
    state: &AppState,
    upstream_url: Url,
    kind: ContentKind,
    incoming: &HeaderMap,
) -> Result<Response> {
    let headers = upstream::forward_request_headers(incoming);
    let fetched = state.fetcher.get_or_fetch(&upstream_url, headers).await?;

    if fetched.from_cache {
        debug!("Serving {} from cache", upstream_url);
    } else {
        info!("Fetched {} from upstream", upstream_url);
    }

    Ok(content_response(kind, fetched.headers, fetched.body))
}

/// Serve a key purely from the cache. `key_cache_id` is the key's absolute
/// upstream URL.
pub(crate) fn cached_key(state: &AppState, key_cache_id: &str) -> Result<Response> {
    let body = state
        .cache
        .get(key_cache_id)
        .ok_or_else(|| ProxyError::NotCached(key_cache_id.to_string()))?;

    debug!("Serving key {} from cache", key_cache_id);
    Ok(content_response(ContentKind::Key, HeaderMap::new(), body))
}

fn content_response(kind: ContentKind, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = (StatusCode::OK, Body::from(body)).into_response();
    response.headers_mut().extend(headers);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(kind.content_type()),
    );
    response
}
