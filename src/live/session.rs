//! A single shared decoder and the viewers attached to it.
//!
//! State moves strictly forward: `Starting → Running → Stopping →
//! Terminated`. A terminated session is never reused; the registry starts a
//! fresh one instead.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::buffer::ViewerBuffer;
use super::process::{DecodeProcess, is_fatal_stderr};
use crate::metrics;

/// Bytes requested from the decoder per read.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    viewers: HashMap<Uuid, Arc<ViewerBuffer>>,
    ref_count: usize,
}

/// One decoder process fanned out to many viewer buffers.
///
/// The viewer map and reference count live behind a single per-session lock;
/// unrelated channels never contend with each other.
#[derive(Debug)]
pub struct LiveSession {
    id: Uuid,
    upstream_url: String,
    buffer_window: Duration,
    inner: Mutex<SessionInner>,
    /// Cancelled once the session leaves `Starting`
    started: CancellationToken,
    shutdown: CancellationToken,
    terminated: CancellationToken,
}

impl LiveSession {
    pub(crate) fn new(upstream_url: String, buffer_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            upstream_url,
            buffer_window,
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                last_activity: Instant::now(),
                viewers: HashMap::new(),
                ref_count: 0,
            }),
            started: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            terminated: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream_url
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.lock().viewers.len()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.lock().ref_count
    }

    /// Time since the decoder last produced output.
    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    /// Resolves once the decoder has exited and the session is terminated.
    pub async fn wait_terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// Resolves once a retried attach can make progress: a starting session
    /// has come up, or a stopping one has terminated.
    pub(crate) async fn wait_settled(&self) {
        match self.state() {
            SessionState::Starting => self.started.cancelled().await,
            SessionState::Stopping => self.terminated.cancelled().await,
            SessionState::Running | SessionState::Terminated => {}
        }
    }

    /// Move `Starting → Running` and register the creator as first viewer in
    /// the same critical section.
    ///
    /// Returns `None` if the session was stopped before its decoder came up.
    pub(crate) fn activate(&self) -> Option<(Uuid, Arc<ViewerBuffer>)> {
        let first = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Starting {
                inner.state = SessionState::Running;
                inner.last_activity = Instant::now();
                Some(self.add_viewer(&mut inner))
            } else {
                None
            }
        };
        self.started.cancel();
        first
    }

    #[cfg(test)]
    pub(crate) fn mark_running(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Starting {
            inner.state = SessionState::Running;
            inner.last_activity = Instant::now();
        }
        drop(inner);
        self.started.cancel();
    }

    /// Register a new viewer buffer, or `None` if the session is not running.
    pub(crate) fn register_viewer(&self) -> Option<(Uuid, Arc<ViewerBuffer>)> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Running {
            return None;
        }
        Some(self.add_viewer(&mut inner))
    }

    fn add_viewer(&self, inner: &mut SessionInner) -> (Uuid, Arc<ViewerBuffer>) {
        let connection_id = Uuid::new_v4();
        let buffer = Arc::new(ViewerBuffer::new(self.buffer_window));
        inner.viewers.insert(connection_id, buffer.clone());
        inner.ref_count += 1;
        debug_assert_eq!(inner.ref_count, inner.viewers.len());
        metrics::viewer_attached();

        debug!(
            "Viewer {} attached to {} ({} viewers)",
            connection_id, self.upstream_url, inner.ref_count
        );
        (connection_id, buffer)
    }

    /// Remove a viewer; the last one out stops the session.
    pub(crate) fn detach(&self, connection_id: Uuid) {
        let stop = {
            let mut inner = self.inner.lock();
            if inner.viewers.remove(&connection_id).is_none() {
                // Already dropped by termination
                return;
            }
            inner.ref_count -= 1;
            debug_assert_eq!(inner.ref_count, inner.viewers.len());
            metrics::viewer_detached();

            debug!(
                "Viewer {} detached from {} ({} viewers)",
                connection_id, self.upstream_url, inner.ref_count
            );

            if inner.ref_count == 0 && inner.state == SessionState::Running {
                inner.state = SessionState::Stopping;
                true
            } else {
                false
            }
        };

        if stop {
            info!("Last viewer left {}, stopping decoder", self.upstream_url);
            self.shutdown.cancel();
        }
    }

    /// Fan a decoder chunk out to every attached viewer.
    pub(crate) fn publish(&self, chunk: Bytes) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_activity = now;
        for buffer in inner.viewers.values() {
            buffer.push_at(now, chunk.clone());
        }
    }

    /// Request teardown. Idempotent.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Starting | SessionState::Running) {
                inner.state = SessionState::Stopping;
            }
        }
        self.shutdown.cancel();
    }

    /// Final transition once the decoder is gone.
    pub(crate) fn finish(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.state = SessionState::Terminated;
            inner.ref_count = 0;
            inner.viewers.drain().count()
        };
        for _ in 0..dropped {
            metrics::viewer_detached();
        }
        self.started.cancel();
        self.terminated.cancel();
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        self.inner.lock().last_activity = at;
    }
}

/// Timing knobs for [`run_reader`]
#[derive(Clone, Copy, Debug)]
pub struct ReaderTiming {
    /// Longest a single read may block before the inactivity check runs
    pub read_poll: Duration,
    pub inactivity_timeout: Duration,
    pub stop_grace: Duration,
}

#[derive(Debug)]
enum StopReason {
    Requested,
    EndOfStream,
    ReadError(std::io::Error),
    Inactive(Duration),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::EndOfStream => write!(f, "decoder output ended"),
            StopReason::ReadError(e) => write!(f, "read error: {}", e),
            StopReason::Inactive(idle) => write!(f, "no output for {:?}", idle),
        }
    }
}

/// Producer loop: copy decoder output into every viewer buffer.
///
/// This is the only place a session's decoder is torn down. Every way out of
/// the loop (end of stream, read error, inactivity, stop request) falls
/// through to the same shutdown sequence, after which `on_terminated` runs.
pub(crate) async fn run_reader<F>(
    session: Arc<LiveSession>,
    process: DecodeProcess,
    mut stdout: ChildStdout,
    timing: ReaderTiming,
    on_terminated: F,
) where
    F: FnOnce() + Send + 'static,
{
    let shutdown = session.shutdown.clone();
    let mut buf = vec![0u8; CHUNK_SIZE];

    let reason = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break StopReason::Requested,
            read = tokio::time::timeout(timing.read_poll, stdout.read(&mut buf)) => match read {
                Ok(Ok(0)) => break StopReason::EndOfStream,
                Ok(Ok(n)) => session.publish(Bytes::copy_from_slice(&buf[..n])),
                Ok(Err(e)) => break StopReason::ReadError(e),
                Err(_) => {
                    let idle = session.idle_for();
                    if idle >= timing.inactivity_timeout {
                        break StopReason::Inactive(idle);
                    }
                }
            }
        }
    };

    match &reason {
        StopReason::ReadError(_) | StopReason::Inactive(_) => warn!(
            "Live session {} for {} stopping: {}",
            session.id, session.upstream_url, reason
        ),
        _ => info!(
            "Live session {} for {} stopping: {}",
            session.id, session.upstream_url, reason
        ),
    }

    session.stop();
    drop(stdout);
    process.shutdown(timing.stop_grace).await;
    session.finish();
    on_terminated();
    metrics::live_session_stopped();

    info!(
        "Live session {} for {} terminated",
        session.id, session.upstream_url
    );
}

/// Log decoder stderr; stop the session on unrecoverable input errors.
pub(crate) async fn drain_stderr(session: Arc<LiveSession>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_fatal_stderr(&line) => {
                error!("Decoder for {} failed: {}", session.upstream_url, line);
                session.stop();
            }
            Ok(Some(line)) => warn!("Decoder for {}: {}", session.upstream_url, line),
            Ok(None) => break,
            Err(e) => {
                debug!(
                    "Stopped reading decoder stderr for {}: {}",
                    session.upstream_url, e
                );
                break;
            }
        }
    }
}
