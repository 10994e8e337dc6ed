//! End-to-end tests for hlsrelay
//!
//! Starts a real Axum server on a random port and drives it with reqwest.
//! Upstream HLS origins are wiremock servers; live tests replace the decoder
//! with a shell loop so no media tooling is needed.

use hlsrelay::config::{BlankLines, Config, DEFAULT_PROXY_PREFIX};
use hlsrelay::server::build_router;
use hlsrelay::token::{ContentKind, ProxiedUrl};
use m3u8_rs::Playlist;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Test server helpers ───────────────────────────────────────────────────────

/// Spin up a test server with the given decoder command.
///
/// Binds a listener first to discover the random port so `base_url` points
/// back at the server itself, the way a player would see it.
async fn start_server(decoder_path: &str, decoder_args: &[&str]) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();

    let config = Config {
        port: 0,
        base_url: format!("http://{}", addr),
        proxy_prefix: DEFAULT_PROXY_PREFIX.to_string(),
        is_dev: true,
        blank_lines: BlankLines::Preserve,
        cache_capacity: 64,
        cache_sweep_secs: 60,
        segment_ttl_secs: 30,
        upstream_timeout_secs: 5,
        decoder_path: decoder_path.to_string(),
        decoder_args: decoder_args.iter().map(|a| a.to_string()).collect(),
        buffer_window_secs: 60,
        inactivity_timeout_secs: 30,
        stop_grace_ms: 200,
        viewer_poll_ms: 10,
    };

    let app = build_router(config).unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn start_test_server() -> SocketAddr {
    start_server("/nonexistent/decoder-binary", &["[URL]"]).await
}

fn proxy_url(addr: SocketAddr, upstream: &str, kind: ContentKind) -> String {
    ProxiedUrl::new(Url::parse(upstream).unwrap(), kind)
        .to_proxy_url(&format!("http://{}", addr), DEFAULT_PROXY_PREFIX)
}

async fn health(client: &reqwest::Client, addr: SocketAddr) -> serde_json::Value {
    client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll /health until `check` holds, failing after five seconds.
async fn wait_for_health(
    client: &reqwest::Client,
    addr: SocketAddr,
    check: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let body = health(client, addr).await;
            if check(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("health condition not reached within 5s")
}

const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720\n\
hd/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=640000,RESOLUTION=640x360\n\
sd/index.m3u8\n";

const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:100\n\
#EXTINF:4.0,\n\
seg100.ts\n\
#EXTINF:4.0,\n\
seg101.ts\n";

async fn mount_origin(origin: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/channel/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MASTER))
        .mount(origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/channel/hd/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(MEDIA))
        .mount(origin)
        .await;
    for seg in ["seg100.ts", "seg101.ts"] {
        Mock::given(method("GET"))
            .and(path(format!("/channel/hd/{}", seg)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(seg.as_bytes().to_vec()))
            .mount(origin)
            .await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_check() {
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("x-hlsrelay-version").is_some());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn hls_proxy_pipeline() {
    let origin = MockServer::start().await;
    mount_origin(&origin).await;
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    // Master playlist: variants become proxied manifest URLs
    let master_url = format!("{}/channel/master.m3u8", origin.uri());
    let resp = client
        .get(proxy_url(addr, &master_url, ContentKind::Manifest))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/vnd.apple.mpegurl"
    );
    let body = resp.text().await.unwrap();

    let playlist =
        m3u8_rs::parse_playlist_res(body.as_bytes()).expect("Response should be valid M3U8");
    let Playlist::MasterPlaylist(master) = playlist else {
        panic!("Expected a MasterPlaylist, got:\n{}", body);
    };
    assert_eq!(master.variants.len(), 2);
    let hd = &master.variants[0].uri;
    assert_eq!(
        hd,
        &proxy_url(
            addr,
            &format!("{}/channel/hd/index.m3u8", origin.uri()),
            ContentKind::Manifest
        )
    );

    // Follow the variant through the proxy
    let body = client.get(hd).send().await.unwrap().text().await.unwrap();
    let Playlist::MediaPlaylist(media) = m3u8_rs::parse_playlist_res(body.as_bytes()).unwrap()
    else {
        panic!("Expected a MediaPlaylist, got:\n{}", body);
    };
    assert_eq!(media.media_sequence, 100);
    assert_eq!(media.segments.len(), 2);

    // Segments come back byte for byte, whether prefetched or not
    for (segment, expected) in media.segments.iter().zip(["seg100.ts", "seg101.ts"]) {
        let resp = client.get(&segment.uri).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("content-type").unwrap(), "video/mp2t");
        assert_eq!(resp.bytes().await.unwrap(), expected.as_bytes());
    }
}

#[tokio::test]
async fn upstream_failure_maps_to_404() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&origin)
        .await;
    let addr = start_test_server().await;

    let resp = reqwest::get(proxy_url(
        addr,
        &format!("{}/broken/index.m3u8", origin.uri()),
        ContentKind::Manifest,
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
}

#[cfg(unix)]
mod live {
    use super::*;

    const TICKER: &str = "while true; do echo \"$0\"; sleep 0.05; done";

    #[tokio::test]
    async fn viewers_share_one_decoder_until_they_leave() {
        let addr = start_server("sh", &["-c", TICKER, "[URL]"]).await;
        let client = reqwest::Client::new();
        let stream_url = proxy_url(addr, "http://iptv.example.com/live/42", ContentKind::Stream);

        let mut first = client.get(&stream_url).send().await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(first.headers().get("content-type").unwrap(), "video/mp2t");
        let mut second = client.get(format!("{}.ts", stream_url)).send().await.unwrap();
        assert_eq!(second.status(), 200);

        let chunk = first.chunk().await.unwrap().expect("stream ended early");
        assert!(chunk.starts_with(b"http://iptv.example.com/live/42"));
        assert!(second.chunk().await.unwrap().is_some());

        let body = health(&client, addr).await;
        assert_eq!(body["live_sessions"], 1);
        assert_eq!(body["live_viewers"], 2);

        drop(first);
        wait_for_health(&client, addr, |h| h["live_viewers"] == 1).await;
        assert_eq!(health(&client, addr).await["live_sessions"], 1);

        drop(second);
        wait_for_health(&client, addr, |h| h["live_sessions"] == 0).await;
    }

    #[tokio::test]
    async fn finished_decoder_ends_response() {
        let addr = start_server("sh", &["-c", "printf 'short-lived'", "[URL]"]).await;

        let resp = reqwest::get(proxy_url(
            addr,
            "http://iptv.example.com/live/7",
            ContentKind::Stream,
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);

        let body = tokio::time::timeout(Duration::from_secs(5), resp.bytes())
            .await
            .expect("body did not finish")
            .unwrap();
        assert_eq!(body, "short-lived".as_bytes());
    }
}
