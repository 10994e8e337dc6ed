use crate::{
    error::Result,
    server::state::AppState,
    token::ContentKind,
    upstream,
};
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::info;
use url::Url;

/// Fetch an upstream manifest and serve it with every URI proxied.
///
/// Prefetching of the referenced segments and keys is dispatched before the
/// response is returned and keeps running if the client goes away.
pub(crate) async fn proxy_manifest(
    state: &AppState,
    upstream_url: Url,
    incoming: &HeaderMap,
) -> Result<Response> {
    info!("Serving manifest for {}", upstream_url);

    let headers = upstream::forward_request_headers(incoming);
    let playlist = state
        .rewriter
        .fetch_and_rewrite(&upstream_url, headers)
        .await?;

    let mut response = (StatusCode::OK, playlist.body).into_response();
    response.headers_mut().extend(playlist.headers);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(ContentKind::Manifest.content_type()),
    );
    Ok(response)
}
