use std::{
    future::Future,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use dirsearch_domain::{
    error::Result,
    options::{CachingMode, CachingOptions},
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Result of a cache lookup that distinguishes a remembered absence from a
/// plain miss.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Lookup<V> {
    Hit(V),
    KnownAbsent,
    Miss,
}

struct CachedValue<V> {
    // `None` records that the directory had nothing for this key.
    value: Option<V>,
    expires_at: Instant,
}

/// Concurrent key-value store with the expiry policy of a [`CachingOptions`].
///
/// Lookups never perform I/O. A miss followed by a store is not atomic: two
/// callers may both miss and both run their fallback, the last store wins.
///
/// Expired entries are dropped when looked up, and by a sweep that a store
/// runs at most once per TTL.
pub struct ExpiringCache<K, V> {
    entries: DashMap<K, CachedValue<V>>,
    mode: CachingMode,
    ttl: Duration,
    stats: CacheStats,
    created: Instant,
    // Nanoseconds after `created` at which the last sweep ran.
    last_sweep: AtomicU64,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(options: &CachingOptions) -> Self {
        Self::with_ttl(options.mode, options.duration())
    }

    pub fn with_ttl(mode: CachingMode, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            mode,
            ttl,
            stats: CacheStats::default(),
            created: Instant::now(),
            last_sweep: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != CachingMode::None
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, key: &K) -> Lookup<V> {
        if !self.is_enabled() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        }
        let now = Instant::now();
        if let Some(mut cached) = self.entries.get_mut(key) {
            if cached.expires_at > now {
                if self.mode == CachingMode::SlidingExpiration {
                    cached.expires_at = now + self.ttl;
                }
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(?key, "cache hit");
                return match &cached.value {
                    Some(value) => Lookup::Hit(value.clone()),
                    None => Lookup::KnownAbsent,
                };
            }
            drop(cached);
            self.entries.remove(key);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(?key, "cache miss");
        Lookup::Miss
    }

    pub fn get(&self, key: &K) -> Option<V> {
        match self.lookup(key) {
            Lookup::Hit(value) => Some(value),
            Lookup::KnownAbsent | Lookup::Miss => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.store(key, Some(value));
    }

    fn store(&self, key: K, value: Option<V>) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CachedValue {
                value,
                expires_at: now + self.ttl,
            },
        );
        self.sweep_if_due(now);
    }

    fn sweep_if_due(&self, now: Instant) {
        let elapsed =
            u64::try_from(now.duration_since(self.created).as_nanos()).unwrap_or(u64::MAX);
        let period = u64::try_from(self.ttl.as_nanos()).unwrap_or(u64::MAX);
        let last = self.last_sweep.load(Ordering::Relaxed);
        if elapsed.saturating_sub(last) < period {
            return;
        }
        // Only the caller that moves the mark runs the sweep.
        if self
            .last_sweep
            .compare_exchange(last, elapsed, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.evict_expired();
        }
    }

    fn evict_expired(&self) {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, cached| cached.expires_at > now);
        debug!(
            evicted = before.saturating_sub(self.entries.len()),
            "evicted expired cache entries"
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Returns the cached value, or runs `fallback` once and stores what it
    /// found. Absent results and errors are not stored.
    pub async fn get_or_add_async<F, Fut>(&self, key: K, fallback: F) -> Result<Option<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(Some(value));
        }
        let value = fallback(key.clone()).await?;
        if let Some(value) = &value {
            self.insert(key, value.clone());
        }
        Ok(value)
    }

    /// Like [`Self::get_or_add_async`], but an absent result is stored too, so
    /// the fallback is not run again for this key until the entry expires.
    pub async fn get_or_add_remembering_absence_async<F, Fut>(
        &self,
        key: K,
        fallback: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        match self.lookup(&key) {
            Lookup::Hit(value) => return Ok(Some(value)),
            Lookup::KnownAbsent => return Ok(None),
            Lookup::Miss => {}
        }
        let value = fallback(key.clone()).await?;
        self.store(key, value.clone());
        Ok(value)
    }
}
