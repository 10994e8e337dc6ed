use super::observe;
use crate::{
    error::Result,
    server::state::AppState,
    token::{ContentKind, decode_upstream},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::info;

/// `GET /<prefix>/stream/<token>[.ts]`
///
/// Attaches the client to the shared decoder for the channel and streams
/// MPEG-TS until either side goes away. The viewer is detached when axum
/// drops the body.
pub async fn serve_stream(
    Path(token): Path<String>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    observe("stream", start, attach(&state, &token).await)
}

async fn attach(state: &AppState, token: &str) -> Result<Response> {
    let token = token.strip_suffix(".ts").unwrap_or(token);
    let upstream_url = decode_upstream(token)?;

    let viewer = state.live.attach(upstream_url.as_str()).await?;
    info!(
        "Viewer {} streaming {} (session {})",
        viewer.connection_id(),
        upstream_url,
        viewer.session().id()
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, ContentKind::Stream.content_type())],
        Body::from_stream(viewer.into_stream()),
    )
        .into_response())
}
