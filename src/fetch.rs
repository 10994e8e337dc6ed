//! Cache-backed fetching of segments and keys.
//!
//! [`CachingFetcher::get_or_fetch`] serves from the [`ContentCache`] and
//! populates it on a miss. [`CachingFetcher::prefetch`] does the same for a
//! batch of URLs in a detached task; its failures are logged and dropped.

use crate::cache::ContentCache;
use crate::error::Result;
use crate::metrics;
use crate::upstream::{self, FetchConfig};
use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Maximum simultaneous upstream fetches per prefetch batch.
const PREFETCH_CONCURRENCY: usize = 4;

/// Body returned by [`CachingFetcher::get_or_fetch`].
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Bytes,
    /// Forwardable upstream headers; empty when served from cache
    pub headers: HeaderMap,
    pub from_cache: bool,
}

#[derive(Clone, Debug)]
pub struct CachingFetcher {
    client: Client,
    cache: ContentCache,
    ttl: Duration,
    fetch_config: FetchConfig,
}

impl CachingFetcher {
    pub fn new(client: Client, cache: ContentCache, ttl: Duration, timeout: Option<Duration>) -> Self {
        Self {
            client,
            cache,
            ttl,
            fetch_config: FetchConfig { timeout },
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn fetch_config(&self) -> &FetchConfig {
        &self.fetch_config
    }

    /// Serve `url` from the cache, fetching and caching it on a miss.
    pub async fn get_or_fetch(&self, url: &Url, headers: HeaderMap) -> Result<Fetched> {
        if let Some(body) = self.cache.get(url.as_str()) {
            return Ok(Fetched {
                body,
                headers: HeaderMap::new(),
                from_cache: true,
            });
        }

        let response = upstream::fetch(&self.client, url, headers, &self.fetch_config).await?;
        let forwarded = upstream::forward_response_headers(response.headers());
        let body = response.bytes().await?;

        self.cache.set(url.as_str(), body.clone(), self.ttl);
        info!("Saved {} to cache ({} bytes)", url, body.len());

        Ok(Fetched {
            body,
            headers: forwarded,
            from_cache: false,
        })
    }

    /// Populate the cache with `urls` in the background.
    ///
    /// Returns `None` when there is nothing to fetch. The caller never waits
    /// on the returned handle on the request path.
    pub fn prefetch(&self, urls: Vec<Url>, headers: HeaderMap) -> Option<JoinHandle<()>> {
        if urls.is_empty() {
            return None;
        }

        let fetcher = self.clone();
        Some(tokio::spawn(async move {
            debug!("Prefetching {} upstream resources", urls.len());
            stream::iter(urls)
                .for_each_concurrent(PREFETCH_CONCURRENCY, |url| {
                    let fetcher = &fetcher;
                    let headers = headers.clone();
                    async move {
                        if fetcher.cache.exists(url.as_str()) {
                            return;
                        }
                        match fetcher.get_or_fetch(&url, headers).await {
                            Ok(_) => metrics::record_prefetch(true),
                            Err(e) => {
                                warn!("Failed to prefetch {}: {}", url, e);
                                metrics::record_prefetch(false);
                            }
                        }
                    }
                })
                .await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(capacity: usize) -> CachingFetcher {
        CachingFetcher::new(
            Client::new(),
            ContentCache::new(capacity),
            Duration::from_secs(30),
            Some(Duration::from_secs(5)),
        )
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[tokio::test]
    async fn miss_then_hit_fetches_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seg1.ts"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "max-age=10")
                    .set_body_bytes(b"segment-bytes".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = fetcher(8);
        let seg = url(&server, "/seg1.ts");

        let first = fetcher.get_or_fetch(&seg, HeaderMap::new()).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.body, Bytes::from_static(b"segment-bytes"));
        assert_eq!(first.headers["cache-control"], "max-age=10");

        let second = fetcher.get_or_fetch(&seg, HeaderMap::new()).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = fetcher(8);
        let result = fetcher
            .get_or_fetch(&url(&server, "/broken.ts"), HeaderMap::new())
            .await;

        assert!(result.is_err());
        assert!(fetcher.cache().is_empty());
    }

    #[tokio::test]
    async fn prefetch_populates_cache_and_swallows_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/k.key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789abcdef".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.ts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = fetcher(8);
        let urls = vec![
            url(&server, "/a.ts"),
            url(&server, "/k.key"),
            url(&server, "/gone.ts"),
        ];
        let handle = fetcher.prefetch(urls, HeaderMap::new()).unwrap();
        handle.await.unwrap();

        assert!(fetcher.cache().exists(url(&server, "/a.ts").as_str()));
        assert!(fetcher.cache().exists(url(&server, "/k.key").as_str()));
        assert!(!fetcher.cache().exists(url(&server, "/gone.ts").as_str()));
    }

    #[tokio::test]
    async fn prefetch_skips_cached_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = fetcher(8);
        let seg = url(&server, "/cached.ts");
        fetcher
            .cache()
            .set(seg.as_str(), Bytes::from_static(b"cached"), Duration::from_secs(30));

        fetcher
            .prefetch(vec![seg.clone()], HeaderMap::new())
            .unwrap()
            .await
            .unwrap();

        assert_eq!(
            fetcher.cache().get(seg.as_str()),
            Some(Bytes::from_static(b"cached"))
        );
    }

    #[tokio::test]
    async fn empty_prefetch_spawns_nothing() {
        assert!(fetcher(8).prefetch(Vec::new(), HeaderMap::new()).is_none());
    }
}
