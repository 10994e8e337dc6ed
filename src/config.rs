use crate::token::normalize_base_url;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default decoder arguments: demux the input, copy every elementary stream,
/// and mux to MPEG-TS on stdout. `[URL]` is replaced per session.
pub const DEFAULT_DECODER_ARGS: &str = "-hide_banner -loglevel error -probesize 10M \
     -analyzeduration 0 -fpsprobesize 0 -i [URL] -c copy -f mpegts pipe:1";

/// Default path prefix for every proxied route.
pub const DEFAULT_PROXY_PREFIX: &str = "tic-hls-proxy";

/// How blank manifest lines are treated when rewriting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlankLines {
    /// Keep blank lines verbatim (default)
    #[default]
    Preserve,
    /// Drop blank lines from the rewritten output
    Drop,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Externally reachable base URL used when generating absolute proxied URLs
    pub base_url: String,
    /// Path prefix for proxied routes, without surrounding slashes
    pub proxy_prefix: String,
    pub is_dev: bool,
    pub blank_lines: BlankLines,
    /// Maximum number of content cache entries
    pub cache_capacity: usize,
    /// Interval between eager expired-entry sweeps
    pub cache_sweep_secs: u64,
    /// TTL for cached segments and keys
    pub segment_ttl_secs: u64,
    /// Per-request timeout for manifest, segment and key fetches
    pub upstream_timeout_secs: u64,
    /// Decode program spawned per live session
    pub decoder_path: String,
    /// Decoder argument template, `[URL]` is substituted
    pub decoder_args: Vec<String>,
    /// Retention window of each viewer buffer
    pub buffer_window_secs: u64,
    /// Live sessions producing nothing for this long are torn down
    pub inactivity_timeout_secs: u64,
    /// Grace period between closing the decoder pipe and force-killing it
    pub stop_grace_ms: u64,
    /// Sleep between polls of an empty viewer buffer
    pub viewer_poll_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and BASE_URL are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        // Base URL: required in prod, defaults to localhost in dev
        let base_url = if is_dev {
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://localhost:{}", port))
        } else {
            env::var("BASE_URL").map_err(|_| "BASE_URL is required in production")?
        };
        let base_url = normalize_base_url(&base_url)
            .map_err(|e| format!("BASE_URL '{}' is not a valid URL: {}", base_url, e))?;

        let proxy_prefix = env::var("PROXY_PREFIX")
            .unwrap_or_else(|_| DEFAULT_PROXY_PREFIX.to_string())
            .trim_matches('/')
            .to_string();
        if proxy_prefix.is_empty() {
            return Err("PROXY_PREFIX must not be empty".into());
        }

        let blank_lines = match env::var("PLAYLIST_BLANK_LINES")
            .unwrap_or_else(|_| "preserve".to_string())
            .to_lowercase()
            .as_str()
        {
            "drop" | "strip" => BlankLines::Drop,
            _ => BlankLines::Preserve,
        };

        let decoder_path = env::var("DECODER_PATH").unwrap_or_else(|_| "ffmpeg".to_string());
        let decoder_args = env::var("DECODER_ARGS")
            .unwrap_or_else(|_| DEFAULT_DECODER_ARGS.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !decoder_args.iter().any(|arg| arg.contains("[URL]")) {
            return Err("DECODER_ARGS must contain the [URL] placeholder".into());
        }

        Ok(Config {
            port,
            base_url,
            proxy_prefix,
            is_dev,
            blank_lines,
            cache_capacity: env_or("CACHE_CAPACITY", 512).max(1),
            cache_sweep_secs: env_or("CACHE_SWEEP_SECS", 60).max(1),
            segment_ttl_secs: env_or("SEGMENT_TTL_SECS", 30),
            upstream_timeout_secs: env_or("UPSTREAM_TIMEOUT_SECS", 30),
            decoder_path,
            decoder_args,
            buffer_window_secs: env_or("BUFFER_WINDOW_SECS", 60),
            inactivity_timeout_secs: env_or("INACTIVITY_TIMEOUT_SECS", 300),
            stop_grace_ms: env_or("STOP_GRACE_MS", 3000),
            viewer_poll_ms: env_or("VIEWER_POLL_MS", 100).max(1),
        })
    }

    pub fn segment_ttl(&self) -> Duration {
        Duration::from_secs(self.segment_ttl_secs)
    }

    /// `None` disables the per-request timeout
    pub fn upstream_timeout(&self) -> Option<Duration> {
        (self.upstream_timeout_secs > 0).then(|| Duration::from_secs(self.upstream_timeout_secs))
    }
}

/// Parse an optional numeric variable, falling back on absence or garbage.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Set env vars, run `f`, then restore original state.
    ///
    /// `set` lists vars to set, `unset` vars to remove before running `f`.
    fn with_env(set: &[(&str, &str)], unset: &[&str], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let save_set: Vec<(&str, Option<String>)> = set
            .iter()
            .map(|(k, _)| (*k, std::env::var(k).ok()))
            .collect();
        let save_unset: Vec<(&str, Option<String>)> =
            unset.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        for (k, v) in set {
            // SAFETY: serialized by ENV_LOCK, no other thread modifies env vars concurrently.
            unsafe { std::env::set_var(k, v) };
        }
        for k in unset {
            unsafe { std::env::remove_var(k) };
        }

        f();

        for (k, old) in save_set.into_iter().chain(save_unset) {
            match old {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "PORT",
        "BASE_URL",
        "PROXY_PREFIX",
        "PLAYLIST_BLANK_LINES",
        "CACHE_CAPACITY",
        "CACHE_SWEEP_SECS",
        "SEGMENT_TTL_SECS",
        "UPSTREAM_TIMEOUT_SECS",
        "DECODER_PATH",
        "DECODER_ARGS",
        "BUFFER_WINDOW_SECS",
        "INACTIVITY_TIMEOUT_SECS",
        "STOP_GRACE_MS",
        "VIEWER_POLL_MS",
    ];

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], ALL_VARS, || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 3000);
            assert_eq!(config.base_url, "http://localhost:3000");
            assert_eq!(config.proxy_prefix, DEFAULT_PROXY_PREFIX);
            assert_eq!(config.blank_lines, BlankLines::Preserve);
            assert_eq!(config.cache_capacity, 512);
            assert_eq!(config.segment_ttl(), Duration::from_secs(30));
            assert_eq!(config.decoder_path, "ffmpeg");
            assert!(config.decoder_args.contains(&"[URL]".to_string()));
            assert!(config.decoder_args.contains(&"mpegts".to_string()));
            assert_eq!(config.buffer_window_secs, 60);
            assert_eq!(config.inactivity_timeout_secs, 300);
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[], &["DEV_MODE", "PORT", "BASE_URL"], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_requires_base_url() {
        with_env(&[("PORT", "8080")], &["DEV_MODE", "BASE_URL"], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without BASE_URL in prod mode");
        });
    }

    #[test]
    fn prefix_and_base_url_are_normalised() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("BASE_URL", "https://tv.example.com/"),
                ("PROXY_PREFIX", "/relay/"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.base_url, "https://tv.example.com");
                assert_eq!(config.proxy_prefix, "relay");
            },
        );
    }

    #[test]
    fn base_url_default_port_and_case_are_canonicalised() {
        with_env(
            &[("DEV_MODE", "true"), ("BASE_URL", "http://Relay.Local:80/")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.base_url, "http://relay.local");
            },
        );
    }

    #[test]
    fn invalid_base_url_rejected() {
        with_env(&[("DEV_MODE", "true"), ("BASE_URL", "relay.local")], &[], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn empty_prefix_rejected() {
        with_env(&[("DEV_MODE", "true"), ("PROXY_PREFIX", "/")], &[], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn blank_lines_drop() {
        with_env(
            &[("DEV_MODE", "true"), ("PLAYLIST_BLANK_LINES", "drop")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.blank_lines, BlankLines::Drop);
            },
        );
    }

    #[test]
    fn decoder_args_require_url_placeholder() {
        with_env(
            &[("DEV_MODE", "true"), ("DECODER_ARGS", "-i - -c copy -f mpegts pipe:1")],
            &[],
            || {
                assert!(Config::from_env().is_err());
            },
        );
    }

    #[test]
    fn numeric_overrides_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("CACHE_CAPACITY", "16"),
                ("SEGMENT_TTL_SECS", "5"),
                ("BUFFER_WINDOW_SECS", "10"),
                ("UPSTREAM_TIMEOUT_SECS", "0"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.cache_capacity, 16);
                assert_eq!(config.segment_ttl(), Duration::from_secs(5));
                assert_eq!(config.buffer_window_secs, 10);
                assert_eq!(config.upstream_timeout(), None);
            },
        );
    }

    #[test]
    fn garbage_numbers_fall_back_to_defaults() {
        with_env(
            &[("DEV_MODE", "true"), ("CACHE_CAPACITY", "lots")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.cache_capacity, 512);
            },
        );
    }
}
