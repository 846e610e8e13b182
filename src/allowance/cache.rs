//! TTL key-value caches that allowances can be stored in.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// A key-value cache with per-entry expiration.
///
/// Production deployments implement this over their shared cache
/// (Redis, Memcached, ...).
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a live value, `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, expiring `ttl_secs` seconds from now.
    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<()>;

    /// Remove a value; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[async_trait]
impl<C: Cache + ?Sized> Cache for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        (**self).set(key, value, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key).await
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// Unix seconds after which the entry is dead
    expires_at: i64,
}

/// In-process cache backed by a concurrent map.
///
/// Expired entries are hidden on read. Writes sweep the whole map at most
/// once per purge interval, so scopes that are never read again still go
/// away; [`MemoryCache::purge_expired`] sweeps on demand.
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    /// Seconds between sweeps triggered by writes
    purge_interval: i64,
    /// Unix seconds of the last sweep
    last_purge: AtomicI64,
}

/// Default seconds between sweeps triggered by writes.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1;

impl MemoryCache {
    /// Create a cache using the system clock for expiration.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a cache with an explicit clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            entries: DashMap::new(),
            clock,
            purge_interval: DEFAULT_PURGE_INTERVAL as i64,
            last_purge: AtomicI64::new(now),
        }
    }

    /// Sweep expired entries on write at most every `secs` seconds.
    pub fn with_purge_interval(mut self, secs: u64) -> Self {
        self.purge_interval = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.last_purge.store(now, Ordering::Relaxed);
        self.sweep(now)
    }

    /// Sweep if the purge interval has passed; one writer wins the sweep.
    fn maybe_purge(&self, now: i64) {
        let last = self.last_purge.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.purge_interval {
            return;
        }
        if self
            .last_purge
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep(now);
        }
    }

    fn sweep(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        trace!(removed = removed, "Purged expired cache entries");
        removed
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();

        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        // Expired. The read guard is gone, so removing from its shard is safe.
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let now = self.clock.now();
        self.maybe_purge(now);

        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl);
        let entry = CacheEntry { value, expires_at };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// A cache that stores nothing; every read misses.
///
/// With this cache every bucket is always full, which effectively disables
/// rate limiting while keeping observers and headers working.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl_secs: u64) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
}
