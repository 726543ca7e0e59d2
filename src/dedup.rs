//! Match dedup cache.
//!
//! Suppresses repeat notifications for a (profile, killmail) pair that was
//! already dispatched within the retention window.
//!
//! # Concurrency
//! Keys are spread over independently locked shards, each an LRU bounded to
//! its share of the total capacity. The check-and-record for one key happens
//! under its shard lock, so two concurrent evaluations of the same pair can
//! never both observe [`DedupStatus::Fresh`]. Unrelated keys on other shards
//! never wait on each other.
//!
//! # Retention
//! An entry is live for `ttl` after it was first recorded; expired entries are
//! treated as absent and overwritten. A duplicate check does not refresh
//! recency, so each shard's LRU order is first-seen order. At capacity the
//! oldest entry of the shard is evicted in O(1) as part of the insert. After
//! eviction a pair may be dispatched one more time, which downstream channels
//! tolerate.

use lru::LruCache;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::DedupConfig;
use crate::error::CacheWriteError;
use crate::event::KillmailId;
use crate::profile::ProfileId;

const PURGE_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub profile_id: ProfileId,
    pub killmail_id: KillmailId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStatus {
    /// First sighting within the window; dispatch it.
    Fresh,
    /// Already dispatched; suppress.
    Duplicate,
}

pub struct DedupCache {
    shards: Vec<Mutex<LruCache<DedupKey, Instant>>>,
    hasher: RandomState,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        let shard_count = config.shards.max(1);
        let per_shard = config.capacity.div_ceil(shard_count);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            hasher: RandomState::new(),
            ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, key: &DedupKey) -> usize {
        (self.hasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    /// Atomically check whether the pair was seen and record it if not.
    pub fn record_and_check(
        &self,
        profile_id: ProfileId,
        killmail_id: KillmailId,
    ) -> Result<DedupStatus, CacheWriteError> {
        self.record_and_check_at(profile_id, killmail_id, Instant::now())
    }

    pub(crate) fn record_and_check_at(
        &self,
        profile_id: ProfileId,
        killmail_id: KillmailId,
        now: Instant,
    ) -> Result<DedupStatus, CacheWriteError> {
        let key = DedupKey {
            profile_id,
            killmail_id,
        };
        let index = self.shard_index(&key);
        let mut shard = self.shards[index]
            .lock()
            .map_err(|_| CacheWriteError::Poisoned(index))?;

        let live = shard
            .peek(&key)
            .map_or(false, |first_seen| now.saturating_duration_since(*first_seen) < self.ttl);
        if live {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Ok(DedupStatus::Duplicate)
        } else {
            shard.put(key, now);
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(DedupStatus::Fresh)
        }
    }

    /// Whether a live entry exists, without recording or touching recency.
    pub fn contains(&self, profile_id: ProfileId, killmail_id: KillmailId) -> bool {
        let key = DedupKey {
            profile_id,
            killmail_id,
        };
        let index = self.shard_index(&key);
        match self.shards[index].lock() {
            Ok(shard) => shard
                .peek(&key)
                .map_or(false, |first_seen| first_seen.elapsed() < self.ttl),
            Err(_) => false,
        }
    }

    /// Drop expired entries.
    ///
    /// Walks each shard from its oldest entry and stops at the first live
    /// one. The shard lock is released every `PURGE_BATCH` removals.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let mut purged = 0;
        for shard in &self.shards {
            loop {
                let Ok(mut guard) = shard.lock() else { break };
                let mut batch = 0;
                while batch < PURGE_BATCH {
                    let expired = guard.peek_lru().map_or(false, |(_, first_seen)| {
                        now.saturating_duration_since(*first_seen) >= self.ttl
                    });
                    if !expired {
                        break;
                    }
                    guard.pop_lru();
                    batch += 1;
                }
                purged += batch;
                if batch < PURGE_BATCH {
                    break;
                }
            }
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|shard| shard.lock().ok().map(|s| s.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|shard| shard.lock().ok().map(|s| s.cap().get()))
            .sum()
    }

    /// Fraction of checks that found a live entry.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            if let Ok(mut shard) = shard.lock() {
                shard.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn cache(capacity: usize, shards: usize, ttl: Duration) -> DedupCache {
        DedupCache::new(&DedupConfig {
            ttl,
            capacity,
            shards,
        })
    }

    #[test]
    fn test_second_check_is_duplicate() {
        let cache = cache(100, 4, Duration::from_secs(60));
        let profile = ProfileId::new();
        assert_eq!(cache.record_and_check(profile, 1).unwrap(), DedupStatus::Fresh);
        assert_eq!(cache.record_and_check(profile, 1).unwrap(), DedupStatus::Duplicate);
        assert_eq!(cache.record_and_check(profile, 2).unwrap(), DedupStatus::Fresh);
        assert_eq!(
            cache.record_and_check(ProfileId::new(), 1).unwrap(),
            DedupStatus::Fresh
        );
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(profile, 1));
        assert!((cache.hit_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expired_entry_is_fresh_again() {
        let cache = cache(100, 1, Duration::from_secs(10));
        let profile = ProfileId::new();
        let start = Instant::now();
        assert_eq!(
            cache.record_and_check_at(profile, 9, start).unwrap(),
            DedupStatus::Fresh
        );
        assert_eq!(
            cache
                .record_and_check_at(profile, 9, start + Duration::from_secs(5))
                .unwrap(),
            DedupStatus::Duplicate
        );
        assert_eq!(
            cache
                .record_and_check_at(profile, 9, start + Duration::from_secs(11))
                .unwrap(),
            DedupStatus::Fresh
        );
    }

    #[test]
    fn test_lru_eviction_bounds_size() {
        let cache = cache(4, 1, Duration::from_secs(60));
        let profile = ProfileId::new();
        for killmail in 0..10 {
            cache.record_and_check(profile, killmail).unwrap();
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.capacity(), 4);
        // Evicted pairs are dispatched again.
        assert_eq!(cache.record_and_check(profile, 0).unwrap(), DedupStatus::Fresh);
        assert_eq!(cache.record_and_check(profile, 9).unwrap(), DedupStatus::Duplicate);
    }

    #[test]
    fn test_purge_stops_at_first_live_entry() {
        let cache = cache(10_000, 1, Duration::from_secs(10));
        let old = ProfileId::new();
        let recent = ProfileId::new();
        let start = Instant::now();
        for killmail in 0..1_000 {
            cache.record_and_check_at(old, killmail, start).unwrap();
        }
        for killmail in 0..3 {
            cache
                .record_and_check_at(recent, killmail, start + Duration::from_secs(8))
                .unwrap();
        }
        // A duplicate hit must not make an old entry look recent.
        assert_eq!(
            cache
                .record_and_check_at(old, 0, start + Duration::from_secs(9))
                .unwrap(),
            DedupStatus::Duplicate
        );

        assert_eq!(cache.purge_expired_at(start + Duration::from_secs(12)), 1_000);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(recent, 0));
        assert!(!cache.contains(old, 0));
    }

    #[test]
    fn test_purge_expired() {
        let cache = cache(100, 2, Duration::from_millis(1));
        let profile = ProfileId::new();
        cache.record_and_check(profile, 1).unwrap();
        cache.record_and_check(profile, 2).unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_writers_single_fresh() {
        let cache = Arc::new(cache(1000, 8, Duration::from_secs(60)));
        let profile = ProfileId::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.record_and_check(profile, 42).unwrap()
                })
            })
            .collect();

        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|status| *status == DedupStatus::Fresh)
            .count();
        assert_eq!(fresh, 1);
    }
}
