//! HLS manifest rewriting.
//!
//! The rewrite is line based rather than a parse/serialize round-trip so that
//! every tag the proxy does not care about reaches the player byte for byte.
//! Only two kinds of lines change:
//! 1. URI lines, which become absolute proxied URLs
//! 2. `#EXT-X-KEY` lines, whose `URI` attribute becomes a proxied key URL
//!
//! Segment and key URLs are collected while rewriting so that the caller can
//! warm the content cache before the player asks for them.

use crate::config::BlankLines;
use crate::error::Result;
use crate::fetch::CachingFetcher;
use crate::token::{ContentKind, ProxiedUrl};
use crate::upstream;
use axum::http::HeaderMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

const KEY_TAG: &str = "#EXT-X-KEY";

/// Where rewritten URLs point and how blank lines are treated
#[derive(Clone, Debug)]
pub struct RewriteOptions {
    /// Externally reachable base URL of this proxy, without trailing slash
    pub base_url: String,
    /// Route prefix, without surrounding slashes
    pub prefix: String,
    pub blank_lines: BlankLines,
}

/// Output of [`rewrite`]
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenPlaylist {
    pub body: String,
    /// Upstream segment and key URLs referenced by the manifest, in order
    pub prefetch: Vec<Url>,
}

/// Rewrite every child URI of `manifest` to go through the proxy.
///
/// Relative URIs are resolved against `source_base`. URIs that already point
/// at this proxy are decoded and re-encoded, never wrapped a second time.
pub fn rewrite(manifest: &str, source_base: &Url, options: &RewriteOptions) -> RewrittenPlaylist {
    let mut lines = Vec::new();
    let mut prefetch = Vec::new();

    for line in manifest.lines() {
        if line.trim().is_empty() {
            if options.blank_lines == BlankLines::Preserve {
                lines.push(line.to_string());
            }
        } else if line.starts_with(KEY_TAG) {
            lines.push(rewrite_key_line(line, source_base, options, &mut prefetch));
        } else if line.starts_with('#') {
            lines.push(line.to_string());
        } else {
            lines.push(rewrite_uri_line(line, source_base, options, &mut prefetch));
        }
    }

    let mut body = lines.join("\n");
    if manifest.ends_with('\n') {
        body.push('\n');
    }

    RewrittenPlaylist { body, prefetch }
}

fn rewrite_uri_line(
    line: &str,
    base: &Url,
    options: &RewriteOptions,
    prefetch: &mut Vec<Url>,
) -> String {
    match proxify(line.trim(), base, options, None) {
        Some(proxied) => {
            if proxied.kind == ContentKind::Segment {
                prefetch.push(proxied.upstream.clone());
            }
            proxied.to_proxy_url(&options.base_url, &options.prefix)
        }
        None => {
            warn!("Leaving unresolvable manifest line untouched: {}", line);
            line.to_string()
        }
    }
}

fn rewrite_key_line(
    line: &str,
    base: &Url,
    options: &RewriteOptions,
    prefetch: &mut Vec<Url>,
) -> String {
    let Some((start, end)) = key_uri_span(line) else {
        // METHOD=NONE and friends carry no URI
        return line.to_string();
    };

    match proxify(&line[start..end], base, options, Some(ContentKind::Key)) {
        Some(proxied) => {
            prefetch.push(proxied.upstream.clone());
            format!(
                "{}{}{}",
                &line[..start],
                proxied.to_proxy_url(&options.base_url, &options.prefix),
                &line[end..]
            )
        }
        None => {
            warn!("Leaving unresolvable key URI untouched: {}", line);
            line.to_string()
        }
    }
}

/// Resolve `uri` and wrap it in a proxied URL.
///
/// `kind` overrides suffix classification. URLs already served by this proxy
/// keep the kind encoded in them.
fn proxify(
    uri: &str,
    base: &Url,
    options: &RewriteOptions,
    kind: Option<ContentKind>,
) -> Option<ProxiedUrl> {
    let absolute = base.join(uri).ok()?;

    if let Some(existing) =
        ProxiedUrl::from_proxy_url(absolute.as_str(), &options.base_url, &options.prefix)
    {
        return Some(existing);
    }

    if !matches!(absolute.scheme(), "http" | "https") {
        return None;
    }

    let kind = kind.unwrap_or_else(|| ContentKind::classify(&absolute));
    Some(ProxiedUrl::new(absolute, kind))
}

/// Byte range of the `URI` attribute value in an `#EXT-X-KEY` line.
///
/// Handles the quoted form required by RFC 8216 and tolerates an unquoted
/// value terminated by `,` or end of line.
fn key_uri_span(line: &str) -> Option<(usize, usize)> {
    let (_, attributes) = line.split_once(':')?;
    let offset = line.len() - attributes.len();

    let mut search = 0;
    while let Some(found) = attributes[search..].find("URI=") {
        let at = search + found;
        let at_boundary = at == 0 || attributes[..at].ends_with(',');
        let value_start = at + "URI=".len();

        if at_boundary {
            let rest = &attributes[value_start..];
            return if let Some(quoted) = rest.strip_prefix('"') {
                let len = quoted.find('"')?;
                let start = offset + value_start + 1;
                Some((start, start + len))
            } else {
                let len = rest.find(',').unwrap_or(rest.len());
                let start = offset + value_start;
                (len > 0).then_some((start, start + len))
            };
        }
        search = value_start;
    }
    None
}

/// Directory of `url`, used as the base for relative manifest URIs.
fn base_of(url: &Url) -> Url {
    url.join("./").unwrap_or_else(|_| url.clone())
}

/// A rewritten upstream manifest ready to serve
#[derive(Debug)]
pub struct FetchedPlaylist {
    pub body: String,
    /// Forwardable upstream response headers
    pub headers: HeaderMap,
    /// Upstream URL after redirects
    pub final_url: Url,
    /// Background prefetch of referenced segments and keys, if any
    pub prefetch_task: Option<JoinHandle<()>>,
}

/// Fetches upstream manifests, rewrites them and kicks off prefetching
#[derive(Clone, Debug)]
pub struct PlaylistRewriter {
    fetcher: CachingFetcher,
    options: RewriteOptions,
}

impl PlaylistRewriter {
    pub fn new(fetcher: CachingFetcher, options: RewriteOptions) -> Self {
        Self { fetcher, options }
    }

    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Fetch `upstream_url`, rewrite it against its post-redirect location and
    /// dispatch prefetching of the referenced segments and keys.
    ///
    /// The prefetch runs detached; failures before rewriting schedule nothing.
    pub async fn fetch_and_rewrite(
        &self,
        upstream_url: &Url,
        headers: HeaderMap,
    ) -> Result<FetchedPlaylist> {
        let response = upstream::fetch(
            self.fetcher.client(),
            upstream_url,
            headers.clone(),
            self.fetcher.fetch_config(),
        )
        .await?;

        let final_url = response.url().clone();
        let base = base_of(&final_url);
        debug!("Resolving manifest URIs for {} against {}", upstream_url, base);

        let forwarded = upstream::forward_response_headers(response.headers());
        let content = response.text().await?;

        let rewritten = rewrite(&content, &base, &self.options);
        info!(
            "Rewrote manifest {} ({} prefetch targets)",
            upstream_url,
            rewritten.prefetch.len()
        );

        let prefetch_task = self.fetcher.prefetch(rewritten.prefetch, headers);

        Ok(FetchedPlaylist {
            body: rewritten.body,
            headers: forwarded,
            final_url,
            prefetch_task,
        })
    }
}
