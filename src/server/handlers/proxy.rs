//! Entry points for proxied manifests, segments and keys.
//!
//! Two URL shapes reach the same logic: the path form produced by the
//! rewriter (`/<prefix>/<token>.<ext>`) and the older query form
//! (`/<prefix>.<ext>?url=...` or `?encoded_remote=...`).

use super::{observe, playlist, segment};
use crate::{
    error::{ProxyError, Result},
    server::state::AppState,
    token::{ContentKind, ProxiedUrl, decode_upstream, parse_upstream},
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use std::time::Instant;
use url::Url;

/// Query parameters accepted by the query-form routes
#[derive(Debug, Default, Deserialize)]
pub struct LegacyQuery {
    /// Raw absolute upstream URL
    pub url: Option<String>,
    /// URL-safe base64 upstream URL
    pub encoded_remote: Option<String>,
    /// Cache key of a previously fetched key (`.key` only)
    pub key_cache_id: Option<String>,
}

impl LegacyQuery {
    fn upstream(&self) -> Result<Url> {
        if let Some(raw) = &self.url {
            parse_upstream(raw)
        } else if let Some(encoded) = &self.encoded_remote {
            decode_upstream(encoded)
        } else {
            Err(ProxyError::BadRequest(
                "Missing 'url' or 'encoded_remote' query parameter".to_string(),
            ))
        }
    }
}

/// `GET /<prefix>/<token>.<ext>`
pub async fn serve_token(
    Path(file): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    dispatch(&state, ProxiedUrl::from_file_name(&file), &headers, start).await
}

/// `GET /<prefix>.m3u8?url=...`
pub async fn legacy_manifest(
    Query(query): Query<LegacyQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let proxied = query
        .upstream()
        .map(|url| ProxiedUrl::new(url, ContentKind::Manifest));
    dispatch(&state, proxied, &headers, start).await
}

/// `GET /<prefix>.ts?url=...`
pub async fn legacy_segment(
    Query(query): Query<LegacyQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let proxied = query
        .upstream()
        .map(|url| ProxiedUrl::new(url, ContentKind::Segment));
    dispatch(&state, proxied, &headers, start).await
}

/// `GET /<prefix>.key?url=...` or `?key_cache_id=...`
///
/// A `key_cache_id` is only ever served from the cache.
pub async fn legacy_key(
    Query(query): Query<LegacyQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    if let Some(id) = &query.key_cache_id {
        return observe("key", start, segment::cached_key(&state, id));
    }

    let proxied = query
        .upstream()
        .map(|url| ProxiedUrl::new(url, ContentKind::Key));
    dispatch(&state, proxied, &headers, start).await
}

async fn dispatch(
    state: &AppState,
    proxied: Result<ProxiedUrl>,
    headers: &HeaderMap,
    start: Instant,
) -> Result<Response> {
    let proxied = match proxied {
        Ok(proxied) => proxied,
        Err(e) => return observe("rejected", start, Err(e)),
    };

    match proxied.kind {
        ContentKind::Manifest => observe(
            "manifest",
            start,
            playlist::proxy_manifest(state, proxied.upstream, headers).await,
        ),
        ContentKind::Segment => observe(
            "segment",
            start,
            segment::proxy_cached(state, proxied.upstream, ContentKind::Segment, headers).await,
        ),
        ContentKind::Key => observe(
            "key",
            start,
            segment::proxy_cached(state, proxied.upstream, ContentKind::Key, headers).await,
        ),
        // Streams have their own route
        ContentKind::Stream => observe(
            "rejected",
            start,
            Err(ProxyError::BadRequest(
                "Live streams are served under /stream/".to_string(),
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_url_takes_precedence() {
        let query = LegacyQuery {
            url: Some("http://a.example/x.m3u8".into()),
            encoded_remote: Some("aHR0cDovL2IuZXhhbXBsZS95Lm0zdTg=".into()),
            key_cache_id: None,
        };
        assert_eq!(query.upstream().unwrap().as_str(), "http://a.example/x.m3u8");
    }

    #[test]
    fn encoded_remote_is_decoded() {
        let query = LegacyQuery {
            encoded_remote: Some("aHR0cDovL2IuZXhhbXBsZS95Lm0zdTg=".into()),
            ..Default::default()
        };
        assert_eq!(query.upstream().unwrap().as_str(), "http://b.example/y.m3u8");
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let err = LegacyQuery::default().upstream().unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn relative_url_is_rejected() {
        let query = LegacyQuery {
            url: Some("/relative/path.ts".into()),
            ..Default::default()
        };
        assert!(matches!(
            query.upstream().unwrap_err(),
            ProxyError::InvalidUpstreamUrl(_)
        ));
    }
}
