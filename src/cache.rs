//! Bounded in-memory content cache with per-entry TTL.
//!
//! Holds segment and key bodies keyed by their absolute upstream URL. A
//! single mutex guards the whole map: operations are short and payloads are
//! reference-counted [`Bytes`], so contention stays low.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics;

/// Fallback TTL used when a caller passes a zero duration.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Bytes,
    expiry: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now <= self.expiry
    }
}

/// Thread-safe content cache with TTL expiry and a capacity bound.
///
/// On overflow the entry closest to expiry is evicted first, regardless of
/// its size or how recently it was read.
#[derive(Clone, Debug)]
pub struct ContentCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    capacity: usize,
}

impl ContentCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Return the cached value if present and not yet expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => {
                debug!("Content cache HIT for {}", key);
                metrics::record_cache_lookup(true);
                Some(entry.value.clone())
            }
            _ => {
                debug!("Content cache MISS for {}", key);
                metrics::record_cache_lookup(false);
                None
            }
        }
    }

    /// Whether a live entry exists for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now()))
    }

    /// Insert or replace `key`, expiring after `ttl`.
    ///
    /// Expired entries are swept first; if the cache is still full, the entry
    /// with the earliest expiry is evicted before inserting.
    pub fn set(&self, key: impl Into<String>, value: Bytes, ttl: Duration) {
        let key = key.into();
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        let now = Instant::now();

        let mut entries = self.entries.lock();
        sweep(&mut entries, now);

        if !entries.contains_key(&key) {
            while entries.len() >= self.capacity {
                let Some(victim) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expiry)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                debug!("Content cache full, evicting {}", victim);
                entries.remove(&victim);
                metrics::record_cache_evictions(1);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expiry: now + ttl,
            },
        );
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let removed = sweep(&mut self.entries.lock(), Instant::now());
        if removed > 0 {
            debug!("Content cache swept {} expired entries", removed);
            metrics::record_cache_evictions(removed);
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`ContentCache::evict_expired`] every `interval` until aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.evict_expired();
            }
        })
    }
}

fn sweep(entries: &mut HashMap<String, CacheEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before - entries.len()
}
