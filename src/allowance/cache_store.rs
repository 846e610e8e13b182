//! Allowance storage on top of a TTL cache.

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{RateLimiterError, Result};
use crate::ratelimit::ScopeKey;

use super::cache::Cache;
use super::store::{AllowanceRecord, AllowanceStore};

/// Default prefix for cache keys.
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "allowance";

/// Identifies this store in cache keys, so that other users of the same
/// cache cannot collide with allowance records.
pub const CACHE_STORE_IDENTITY: &str = "cache-allowance-store";

/// Default allowance of a bucket that has never been seen.
///
/// The evaluator clamps it to the limit's capacity, so this is a full bucket.
pub const DEFAULT_ALLOWANCE: i64 = i64::MAX;

/// Stores allowance records as JSON in a [`Cache`], one entry per scope,
/// expiring after the limit's window.
#[derive(Debug)]
pub struct CacheAllowanceStore<C: Cache> {
    cache: C,
    key_prefix: String,
    default_allowance: i64,
}

impl<C: Cache> CacheAllowanceStore<C> {
    /// Create a store over `cache` with the default prefix and allowance.
    pub fn new(cache: C) -> Self {
        Self {
            cache,
            key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            default_allowance: DEFAULT_ALLOWANCE,
        }
    }

    /// Use a different cache key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Use a different allowance for unseen scopes.
    pub fn with_default_allowance(mut self, allowance: i64) -> Self {
        self.default_allowance = allowance;
        self
    }

    /// The underlying cache.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Cache key for `scope`: `{prefix}|{store identity}|{scope}`.
    pub fn cache_key(&self, scope: &ScopeKey) -> String {
        format!("{}|{}|{}", self.key_prefix, CACHE_STORE_IDENTITY, scope)
    }
}

#[async_trait]
impl<C: Cache> AllowanceStore for CacheAllowanceStore<C> {
    async fn load(&self, scope: &ScopeKey, now: i64) -> Result<AllowanceRecord> {
        let key = self.cache_key(scope);

        match self.cache.get(&key).await? {
            Some(raw) => {
                let record: AllowanceRecord = serde_json::from_str(&raw).map_err(|e| {
                    RateLimiterError::Storage(format!("corrupt allowance record at {}: {}", key, e))
                })?;
                trace!(
                    key = %key,
                    allowance = record.allowance,
                    timestamp = record.timestamp,
                    "Loaded allowance"
                );
                Ok(record)
            }
            None => {
                debug!(key = %key, "No stored allowance, starting with a full bucket");
                Ok(AllowanceRecord::new(self.default_allowance, now))
            }
        }
    }

    async fn save(&self, scope: &ScopeKey, record: AllowanceRecord, window: u64) -> Result<()> {
        let key = self.cache_key(scope);
        let value = serde_json::to_string(&record)?;

        trace!(key = %key, allowance = record.allowance, ttl = window, "Saving allowance");
        self.cache.set(&key, value, window).await
    }

    async fn reset(&self, scope: &ScopeKey) -> Result<()> {
        let key = self.cache_key(scope);
        self.cache.delete(&key).await?;
        Ok(())
    }
}
