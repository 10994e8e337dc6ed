//! Per-viewer time-windowed chunk buffer.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// FIFO of transport-stream chunks retained for at most `window`.
///
/// The producer never blocks on a slow viewer: every append drops chunks
/// older than the window, so a lagging reader loses data instead.
#[derive(Debug)]
pub struct ViewerBuffer {
    window: Duration,
    chunks: Mutex<VecDeque<(Instant, Bytes)>>,
}

impl ViewerBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            chunks: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a chunk stamped with the current time.
    pub fn push(&self, chunk: Bytes) {
        self.push_at(Instant::now(), chunk);
    }

    /// Append a chunk stamped `at`, evicting everything older than the window.
    pub fn push_at(&self, at: Instant, chunk: Bytes) {
        let mut chunks = self.chunks.lock();
        chunks.push_back((at, chunk));
        while chunks
            .front()
            .is_some_and(|(stamp, _)| at.saturating_duration_since(*stamp) > self.window)
        {
            chunks.pop_front();
        }
    }

    /// Take the oldest buffered chunk.
    pub fn pop(&self) -> Option<Bytes> {
        self.chunks.lock().pop_front().map(|(_, chunk)| chunk)
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Age of the oldest retained chunk relative to `now`.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.chunks
            .lock()
            .front()
            .map(|(stamp, _)| now.saturating_duration_since(*stamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[test]
    fn fifo_order() {
        let buffer = ViewerBuffer::new(Duration::from_secs(60));
        for n in 0..5 {
            buffer.push(chunk(n));
        }
        for n in 0..5 {
            assert_eq!(buffer.pop(), Some(chunk(n)));
        }
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn appends_evict_chunks_outside_window() {
        let window = Duration::from_secs(10);
        let buffer = ViewerBuffer::new(window);
        let start = Instant::now();

        // One chunk per second for 30 seconds of simulated wall time
        for s in 0..30u64 {
            buffer.push_at(start + Duration::from_secs(s), chunk(s as u8));
        }

        let now = start + Duration::from_secs(29);
        assert!(buffer.oldest_age(now).unwrap() <= window);
        // Seconds 19..=29 are within the window
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.pop(), Some(chunk(19)));
    }

    #[test]
    fn window_holds_after_every_append() {
        let window = Duration::from_millis(250);
        let buffer = ViewerBuffer::new(window);
        let start = Instant::now();

        for step in 0..200u64 {
            let at = start + Duration::from_millis(step * 7);
            buffer.push_at(at, chunk(0));
            assert!(buffer.oldest_age(at).unwrap() <= window);
        }
    }

    #[test]
    fn slow_reader_falls_behind_but_never_ahead() {
        let buffer = ViewerBuffer::new(Duration::from_secs(2));
        let start = Instant::now();

        for s in 0..5u64 {
            buffer.push_at(start + Duration::from_secs(s), chunk(s as u8));
        }

        // Chunks 0 and 1 fell out of the window; the reader resumes at 2
        assert_eq!(buffer.pop(), Some(chunk(2)));
        assert_eq!(buffer.pop(), Some(chunk(3)));
        assert_eq!(buffer.pop(), Some(chunk(4)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn draining_leaves_no_oldest_age() {
        let buffer = ViewerBuffer::new(Duration::from_secs(60));
        buffer.push(chunk(1));
        assert!(buffer.oldest_age(Instant::now()).is_some());
        assert_eq!(buffer.pop(), Some(chunk(1)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.oldest_age(Instant::now()), None);
    }
}
