pub mod handlers;
pub mod state;

use crate::config::Config;
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use state::AppState;
use std::time::Duration;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// Header carrying the crate version on every response
pub const VERSION_HEADER: HeaderName = HeaderName::from_static("x-hlsrelay-version");

/// Build the application router with fresh shared state.
///
/// Spawns the cache sweeper, so it must be called from within a Tokio
/// runtime.
pub fn build_router(config: Config) -> reqwest::Result<Router> {
    let state = AppState::new(config)?;
    start_cache_sweeper(&state);
    Ok(router(state))
}

fn start_cache_sweeper(state: &AppState) {
    let interval = Duration::from_secs(state.config.cache_sweep_secs.max(1));
    state.cache.spawn_sweeper(interval);
}

/// Routes for an existing [`AppState`]
pub fn router(state: AppState) -> Router {
    let prefix = state.config.proxy_prefix.clone();

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::serve_metrics))
        // Query-string form: /<prefix>.m3u8?url=... and friends
        .route(
            &format!("/{}.m3u8", prefix),
            get(handlers::proxy::legacy_manifest),
        )
        .route(
            &format!("/{}.ts", prefix),
            get(handlers::proxy::legacy_segment),
        )
        .route(
            &format!("/{}.key", prefix),
            get(handlers::proxy::legacy_key),
        )
        // Token form: /<prefix>/<token>.<ext> and /<prefix>/stream/<token>
        .route(
            &format!("/{}/stream/{{token}}", prefix),
            get(handlers::stream::serve_stream),
        )
        .route(
            &format!("/{}/{{file}}", prefix),
            get(handlers::proxy::serve_token),
        )
        .layer(middleware::from_fn(version_header))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn version_header(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    let state = AppState::new(config)?;
    start_cache_sweeper(&state);
    let live = state.live.clone();
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    // Live bodies never end on their own; stopping their decoders lets the
    // graceful shutdown drain them
    let shutdown = async move {
        shutdown_signal().await;
        live.stop_all();
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
