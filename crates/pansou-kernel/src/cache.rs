//! Two-level result cache with per-key single-flight.
//!
//! Every cache entry moves through three ages:
//!
//! - **fresh** (younger than the fresh TTL): served as-is, marked final;
//! - **stale** (between the fresh and stale TTLs): served immediately while
//!   a background refresh replaces the snapshot;
//! - **hard-expired** (past the stale TTL): removed; the next caller
//!   refetches synchronously.
//!
//! Reads never block writes: a lookup clones an `Arc` of the current
//! snapshot and a store atomically swaps the entry. The per-key flight
//! mutex is what guarantees at most one upstream call per key at a time,
//! for synchronous misses and background refreshes alike.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pansou_core::SearchResult;

/// Outcome of a cache lookup.
pub enum CacheLookup {
    /// No usable entry; fetch synchronously.
    Miss,
    /// Entry within the fresh TTL.
    Fresh(Arc<Vec<SearchResult>>),
    /// Entry past the fresh TTL but still usable; serve and refresh.
    Stale(Arc<Vec<SearchResult>>),
}

struct Entry {
    snapshot: Arc<Vec<SearchResult>>,
    stored_at: Instant,
    stale_until: Instant,
}

struct Inner {
    fresh_ttl: Duration,
    stale_ttl: Duration,
    /// Extra stale validity granted when a refresh fails, so a flapping
    /// upstream is not hammered by every caller at once.
    error_extension: Duration,
    entries: DashMap<String, Entry>,
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Concurrent two-level cache keyed by `(plugin, keyword, ext-hash)`
/// strings.
#[derive(Clone)]
pub struct TwoLevelCache {
    inner: Arc<Inner>,
}

impl TwoLevelCache {
    /// `stale_ttl` counts from the store time and must exceed `fresh_ttl`.
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        debug_assert!(stale_ttl > fresh_ttl);
        Self {
            inner: Arc::new(Inner {
                fresh_ttl,
                stale_ttl,
                error_extension: Duration::from_secs(30),
                entries: DashMap::new(),
                flights: DashMap::new(),
            }),
        }
    }

    pub fn lookup(&self, key: &str) -> CacheLookup {
        let now = Instant::now();
        if let Some(entry) = self.inner.entries.get(key) {
            if now.duration_since(entry.stored_at) < self.inner.fresh_ttl {
                return CacheLookup::Fresh(entry.snapshot.clone());
            }
            if now < entry.stale_until {
                return CacheLookup::Stale(entry.snapshot.clone());
            }
        } else {
            return CacheLookup::Miss;
        }
        // Hard-expired: drop the entry outside the read guard.
        self.inner.entries.remove(key);
        CacheLookup::Miss
    }

    /// Atomically replaces the snapshot for `key`, marking it fresh.
    pub fn store(&self, key: &str, snapshot: Vec<SearchResult>) {
        let now = Instant::now();
        self.inner.entries.insert(
            key.to_string(),
            Entry {
                snapshot: Arc::new(snapshot),
                stored_at: now,
                stale_until: now + self.inner.stale_ttl,
            },
        );
    }

    /// Extends the stale validity of `key` after a failed refresh. The
    /// snapshot is left intact.
    pub fn extend_stale(&self, key: &str) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.stale_until += self.inner.error_extension;
        }
    }

    /// The single-flight mutex for `key`. Holding its guard is what
    /// "owning the refresh" means.
    pub fn flight(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .flights
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Drops the flight slot for `key` when nobody holds it. Keeps the
    /// flight map bounded by the live keyspace instead of every key ever
    /// seen.
    pub fn release_flight(&self, key: &str) {
        self.inner
            .flights
            .remove_if(key, |_, flight| Arc::strong_count(flight) == 1);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str) -> SearchResult {
        SearchResult {
            unique_id: id.to_string(),
            title: id.to_string(),
            links: vec![pansou_core::Link::new("https://pan.quark.cn/s/x")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_then_stale_then_gone() {
        let cache = TwoLevelCache::new(Duration::from_millis(30), Duration::from_millis(90));
        cache.store("k", vec![result("a")]);

        assert!(matches!(cache.lookup("k"), CacheLookup::Fresh(_)));

        tokio::time::sleep(Duration::from_millis(45)).await;
        match cache.lookup("k") {
            CacheLookup::Stale(snapshot) => assert_eq!(snapshot[0].unique_id, "a"),
            _ => panic!("expected stale"),
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(cache.lookup("k"), CacheLookup::Miss));
        assert!(!cache.contains("k"));
    }

    #[tokio::test]
    async fn store_swaps_snapshot_for_readers() {
        let cache = TwoLevelCache::new(Duration::from_secs(1), Duration::from_secs(2));
        cache.store("k", vec![result("old")]);
        let CacheLookup::Fresh(old) = cache.lookup("k") else {
            panic!()
        };
        cache.store("k", vec![result("new")]);
        // The reader's snapshot is unaffected by the swap.
        assert_eq!(old[0].unique_id, "old");
        let CacheLookup::Fresh(new) = cache.lookup("k") else {
            panic!()
        };
        assert_eq!(new[0].unique_id, "new");
    }

    #[tokio::test]
    async fn flight_is_exclusive_and_released() {
        let cache = TwoLevelCache::new(Duration::from_millis(10), Duration::from_millis(20));
        let flight = cache.flight("k");
        let guard = flight.clone().try_lock_owned().unwrap();
        // Second taker sees the slot occupied.
        assert!(cache.flight("k").try_lock().is_err());
        drop(guard);
        drop(flight);
        cache.release_flight("k");
        assert!(cache.flight("k").try_lock().is_ok());
    }
}
