//! Self-describing proxy tokens.
//!
//! A token is the URL-safe base64 encoding of an absolute upstream URL. The
//! extension appended to it (or the `stream/` path form) tells the proxy what
//! kind of content it points at, so decoding needs no server-side state.

use crate::error::{ProxyError, Result};
use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use url::Url;

/// URL-safe alphabet; emits padding like the legacy `encoded_remote` links
/// but accepts tokens with or without it.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Path segment used for continuous live streams.
pub const STREAM_SEGMENT: &str = "stream";

/// What a proxied URL points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Nested HLS manifest (`.m3u8`)
    Manifest,
    /// Discrete media segment (`.ts`)
    Segment,
    /// Encryption key referenced by `#EXT-X-KEY`
    Key,
    /// Continuous transport stream served by a live session
    Stream,
}

impl ContentKind {
    /// Classify a manifest URL line by its path suffix.
    pub fn classify(url: &Url) -> Self {
        if url.path().ends_with(".m3u8") {
            ContentKind::Manifest
        } else {
            ContentKind::Segment
        }
    }

    pub fn extension(self) -> Option<&'static str> {
        match self {
            ContentKind::Manifest => Some("m3u8"),
            ContentKind::Segment => Some("ts"),
            ContentKind::Key => Some("key"),
            ContentKind::Stream => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "m3u8" => Some(ContentKind::Manifest),
            "ts" => Some(ContentKind::Segment),
            "key" => Some(ContentKind::Key),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ContentKind::Manifest => "application/vnd.apple.mpegurl",
            ContentKind::Key => "application/octet-stream",
            ContentKind::Segment | ContentKind::Stream => "video/mp2t",
        }
    }
}

/// An upstream URL paired with the kind of content it serves
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxiedUrl {
    pub upstream: Url,
    pub kind: ContentKind,
}

impl ProxiedUrl {
    pub fn new(upstream: Url, kind: ContentKind) -> Self {
        Self { upstream, kind }
    }

    /// Encode the upstream URL as a path-safe token.
    pub fn token(&self) -> String {
        TOKEN_ENGINE.encode(self.upstream.as_str())
    }

    /// Path relative to the proxy prefix, e.g. `<token>.ts` or `stream/<token>`.
    pub fn path(&self) -> String {
        match self.kind.extension() {
            Some(ext) => format!("{}.{}", self.token(), ext),
            None => format!("{}/{}", STREAM_SEGMENT, self.token()),
        }
    }

    /// Absolute proxied URL served by this proxy.
    pub fn to_proxy_url(&self, base_url: &str, prefix: &str) -> String {
        format!("{}/{}/{}", base_url, prefix, self.path())
    }

    /// Decode a bare token into a proxied URL of the given kind.
    pub fn decode(token: &str, kind: ContentKind) -> Result<Self> {
        let upstream = decode_upstream(token)?;
        Ok(Self { upstream, kind })
    }

    /// Decode a `<token>.<ext>` file name taken from a request path.
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        let (token, ext) = file_name.rsplit_once('.').ok_or_else(|| {
            ProxyError::BadRequest(format!("Missing extension in '{}'", file_name))
        })?;
        let kind = ContentKind::from_extension(ext).ok_or_else(|| {
            ProxyError::BadRequest(format!("Unsupported extension '.{}'", ext))
        })?;
        Self::decode(token, kind)
    }

    /// Recognise a URL previously produced by [`ProxiedUrl::to_proxy_url`].
    ///
    /// Returns `None` for anything that is not one of this proxy's URLs.
    /// `base_url` may be in any form `Url` accepts (default port, uppercase
    /// host); `url` is matched against its normalized form as well.
    pub fn from_proxy_url(url: &str, base_url: &str, prefix: &str) -> Option<Self> {
        let normalized = normalize_base_url(base_url).ok();
        let rest = normalized
            .as_deref()
            .and_then(|base| url.strip_prefix(base))
            .or_else(|| url.strip_prefix(base_url.trim_end_matches('/')))?
            .strip_prefix('/')?
            .strip_prefix(prefix)?
            .strip_prefix('/')?;

        match rest.strip_prefix(STREAM_SEGMENT).and_then(|r| r.strip_prefix('/')) {
            Some(token) => Self::decode(token, ContentKind::Stream).ok(),
            None => Self::from_file_name(rest).ok(),
        }
    }
}

/// Canonical form of a public base URL, without the trailing slash.
///
/// `http://Relay.Local:80/` becomes `http://relay.local`, the form
/// [`Url::as_str`] prints for URLs under it.
pub fn normalize_base_url(raw: &str) -> std::result::Result<String, url::ParseError> {
    let url = Url::parse(raw)?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Decode a token into an absolute http(s) URL.
pub fn decode_upstream(token: &str) -> Result<Url> {
    if token.is_empty() {
        return Err(ProxyError::InvalidToken("empty token".to_string()));
    }

    let raw = TOKEN_ENGINE
        .decode(token)
        .map_err(|e| ProxyError::InvalidToken(format!("'{}': {}", token, e)))?;
    let text = String::from_utf8(raw)
        .map_err(|_| ProxyError::InvalidToken(format!("'{}' is not UTF-8", token)))?;

    parse_upstream(&text)
}

/// Parse and validate a raw upstream URL.
pub fn parse_upstream(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ProxyError::InvalidUpstreamUrl(format!("'{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        "http" | "https" => Err(ProxyError::InvalidUpstreamUrl(format!(
            "No host in URL: {}",
            raw
        ))),
        scheme => Err(ProxyError::InvalidUpstreamUrl(format!(
            "Scheme '{}' not allowed, only http/https permitted",
            scheme
        ))),
    }
}
