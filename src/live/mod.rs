//! Live process multiplexer.
//!
//! One decoder per upstream URL, shared by every viewer of that channel.
//! Viewers get their own time-windowed buffer and poll it; the decoder is
//! stopped when the last viewer leaves or the producer goes quiet.

pub mod buffer;
pub mod process;
pub mod session;

pub use buffer::ViewerBuffer;
pub use process::{DecodeProcess, DecoderCommand};
pub use session::{LiveSession, SessionState};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::metrics;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::Stream;
use session::ReaderTiming;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Upper bound on a single blocking read from the decoder.
pub const READ_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Decoder and timing settings shared by all sessions
#[derive(Clone, Debug)]
pub struct LiveConfig {
    pub decoder: DecoderCommand,
    /// How long each viewer buffer retains chunks
    pub buffer_window: Duration,
    /// Stop a session whose decoder produced nothing for this long
    pub inactivity_timeout: Duration,
    /// Grace between closing the decoder's stdout and killing it
    pub stop_grace: Duration,
    pub read_poll_interval: Duration,
    /// Sleep between empty-buffer polls in the serve loop
    pub viewer_poll_interval: Duration,
}

impl LiveConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            decoder: DecoderCommand::new(&config.decoder_path, config.decoder_args.clone()),
            buffer_window: Duration::from_secs(config.buffer_window_secs),
            inactivity_timeout: Duration::from_secs(config.inactivity_timeout_secs),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
            read_poll_interval: READ_POLL_INTERVAL,
            viewer_poll_interval: Duration::from_millis(config.viewer_poll_ms),
        }
    }

    fn reader_timing(&self) -> ReaderTiming {
        ReaderTiming {
            read_poll: self.read_poll_interval,
            inactivity_timeout: self.inactivity_timeout,
            stop_grace: self.stop_grace,
        }
    }
}

/// Registry of live sessions keyed by upstream URL.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Debug)]
pub struct LiveMultiplexer {
    sessions: Arc<DashMap<String, Arc<LiveSession>>>,
    config: Arc<LiveConfig>,
}

impl LiveMultiplexer {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Attach a viewer to the session for `upstream_url`, starting one if
    /// needed.
    ///
    /// Lookup and creation happen while holding the registry entry for that
    /// URL, so concurrent attaches share one decoder. A new session is
    /// reserved in `Starting` and the decoder is spawned after the entry is
    /// released; other attaches wait for it to come up. A session that is
    /// still shutting down is awaited first; its replacement never overlaps
    /// with it.
    pub async fn attach(&self, upstream_url: &str) -> Result<ViewerHandle> {
        loop {
            let slot = match self.sessions.entry(upstream_url.to_string()) {
                Entry::Occupied(mut entry) => {
                    let session = entry.get().clone();
                    if let Some(handle) = self.join(&session) {
                        return Ok(handle);
                    }
                    if session.state() == SessionState::Terminated {
                        let fresh = self.reserve(upstream_url);
                        entry.insert(fresh.clone());
                        Slot::Start(fresh)
                    } else {
                        Slot::Wait(session)
                    }
                }
                Entry::Vacant(entry) => {
                    let fresh = self.reserve(upstream_url);
                    entry.insert(fresh.clone());
                    Slot::Start(fresh)
                }
            };

            match slot {
                Slot::Start(session) => return self.start_session(session),
                Slot::Wait(session) => {
                    debug!(
                        "Session {} for {} is {:?}, waiting before retry",
                        session.id(),
                        upstream_url,
                        session.state()
                    );
                    session.wait_settled().await;
                }
            }
        }
    }

    /// Registered session for `upstream_url`, if any.
    pub fn session(&self, upstream_url: &str) -> Option<Arc<LiveSession>> {
        self.sessions.get(upstream_url).map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Viewers across all sessions
    pub fn viewer_count(&self) -> usize {
        self.sessions.iter().map(|s| s.value().viewer_count()).sum()
    }

    /// Ask every session to stop. Used on server shutdown.
    pub fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for session in sessions {
            session.stop();
        }
    }

    fn join(&self, session: &Arc<LiveSession>) -> Option<ViewerHandle> {
        let (connection_id, buffer) = session.register_viewer()?;
        Some(self.handle(session.clone(), connection_id, buffer))
    }

    fn handle(
        &self,
        session: Arc<LiveSession>,
        connection_id: Uuid,
        buffer: Arc<ViewerBuffer>,
    ) -> ViewerHandle {
        ViewerHandle {
            session,
            connection_id,
            buffer,
            poll_interval: self.config.viewer_poll_interval,
        }
    }

    fn reserve(&self, upstream_url: &str) -> Arc<LiveSession> {
        LiveSession::new(upstream_url.to_string(), self.config.buffer_window)
    }

    /// Spawn the decoder for a reserved session, register its first viewer,
    /// then start the reader and stderr tasks.
    ///
    /// The viewer is registered before the reader runs, so a decoder that
    /// exits at once still yields a stream that ends cleanly.
    fn start_session(&self, session: Arc<LiveSession>) -> Result<ViewerHandle> {
        let upstream_url = session.upstream_url().to_string();

        let (process, pipes) = match self.config.decoder.spawn(&upstream_url) {
            Ok(spawned) => spawned,
            Err(source) => {
                error!(
                    "Failed to start decoder {} for {}: {}",
                    self.config.decoder.program(),
                    upstream_url,
                    source
                );
                session.finish();
                self.sessions
                    .remove_if(&upstream_url, |_, current| Arc::ptr_eq(current, &session));
                return Err(ProxyError::DecoderSpawn {
                    url: upstream_url,
                    source,
                });
            }
        };

        let first = session.activate();
        metrics::live_session_started();
        info!("Live session {} started for {}", session.id(), upstream_url);

        tokio::spawn(session::drain_stderr(session.clone(), pipes.stderr));

        let registry = self.sessions.clone();
        let key = upstream_url.clone();
        let registered = session.clone();
        tokio::spawn(session::run_reader(
            session.clone(),
            process,
            pipes.stdout,
            self.config.reader_timing(),
            move || {
                registry.remove_if(&key, |_, current| Arc::ptr_eq(current, &registered));
            },
        ));

        let (connection_id, buffer) = first.ok_or_else(|| {
            ProxyError::Internal(format!(
                "live session for {} was stopped while starting",
                upstream_url
            ))
        })?;
        Ok(self.handle(session, connection_id, buffer))
    }
}

/// Outcome of the registry lookup in [`LiveMultiplexer::attach`].
enum Slot {
    /// Reserved by this caller; spawn its decoder
    Start(Arc<LiveSession>),
    /// Starting or stopping elsewhere; wait and retry
    Wait(Arc<LiveSession>),
}

/// One viewer's attachment to a live session.
///
/// Dropping the handle detaches the viewer. The streaming response body owns
/// it, so a client disconnect detaches even in the middle of a poll sleep.
#[derive(Debug)]
pub struct ViewerHandle {
    session: Arc<LiveSession>,
    connection_id: Uuid,
    buffer: Arc<ViewerBuffer>,
    poll_interval: Duration,
}

impl ViewerHandle {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn session(&self) -> &Arc<LiveSession> {
        &self.session
    }

    /// Next chunk for this viewer, or `None` once the session has ended and
    /// the buffer is drained.
    pub async fn next_chunk(&self) -> Option<Bytes> {
        loop {
            // Read the state before popping so the final chunks are not lost
            let running = self.session.is_running();
            if let Some(chunk) = self.buffer.pop() {
                return Some(chunk);
            }
            if !running {
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Unbounded byte stream suitable for a chunked response body.
    pub fn into_stream(self) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send {
        futures_util::stream::unfold(self, |viewer| async move {
            let chunk = viewer.next_chunk().await?;
            metrics::record_stream_bytes(chunk.len());
            Some((Ok(chunk), viewer))
        })
    }
}

impl Drop for ViewerHandle {
    fn drop(&mut self) {
        self.session.detach(self.connection_id);
    }
}
