use crate::{
    cache::ContentCache,
    config::Config,
    fetch::CachingFetcher,
    hls::{PlaylistRewriter, RewriteOptions},
    live::{LiveConfig, LiveMultiplexer},
    upstream,
};
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Segment and key cache, shared with the prefetcher
    pub cache: ContentCache,
    pub fetcher: CachingFetcher,
    pub rewriter: PlaylistRewriter,
    /// Live decoder sessions keyed by upstream URL
    pub live: LiveMultiplexer,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> reqwest::Result<Self> {
        let http_client = upstream::build_client()?;
        let cache = ContentCache::new(config.cache_capacity);
        let fetcher = CachingFetcher::new(
            http_client.clone(),
            cache.clone(),
            config.segment_ttl(),
            config.upstream_timeout(),
        );
        let rewriter = PlaylistRewriter::new(
            fetcher.clone(),
            RewriteOptions {
                base_url: config.base_url.clone(),
                prefix: config.proxy_prefix.clone(),
                blank_lines: config.blank_lines,
            },
        );
        let live = LiveMultiplexer::new(LiveConfig::from_config(&config));

        Ok(Self {
            config: Arc::new(config),
            cache,
            fetcher,
            rewriter,
            live,
            started_at: Instant::now(),
        })
    }
}
