use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced on the request path.
///
/// Background work (prefetch, decoder stderr) logs its failures instead of
/// returning them, so every variant here maps to a client-visible status.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid proxy token: {0}")]
    InvalidToken(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUpstreamUrl(String),

    #[error("Upstream {url} returned {status}")]
    UpstreamStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Upstream request failed: {0}")]
    UpstreamRequest(#[from] reqwest::Error),

    #[error("No cached entry for {0}")]
    NotCached(String),

    #[error("Failed to start decoder for {url}: {source}")]
    DecoderSpawn {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_)
            | ProxyError::InvalidToken(_)
            | ProxyError::InvalidUpstreamUrl(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamStatus { .. }
            | ProxyError::UpstreamRequest(_)
            | ProxyError::NotCached(_) => StatusCode::NOT_FOUND,
            ProxyError::DecoderSpawn { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{}", self);
        } else {
            warn!("{}", self);
        }

        (status, format!("{}\n", self)).into_response()
    }
}
