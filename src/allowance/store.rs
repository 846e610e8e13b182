//! Allowance persistence contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ratelimit::ScopeKey;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceRecord {
    /// Units left in the bucket when `timestamp` was recorded
    pub allowance: i64,
    /// Unix seconds of the last evaluation
    pub timestamp: i64,
}

impl AllowanceRecord {
    pub fn new(allowance: i64, timestamp: i64) -> Self {
        Self { allowance, timestamp }
    }
}

/// Storage for bucket allowances, keyed by scope.
///
/// Implementations must treat a missing key as a full bucket rather than an
/// error; only genuine backend failures are reported as `Err`.
#[async_trait]
pub trait AllowanceStore: Send + Sync {
    /// Load the record for `scope`.
    ///
    /// On a miss, returns the store's default allowance stamped with `now`.
    async fn load(&self, scope: &ScopeKey, now: i64) -> Result<AllowanceRecord>;

    /// Persist `record` for `scope`, expiring after `window` seconds.
    async fn save(&self, scope: &ScopeKey, record: AllowanceRecord, window: u64) -> Result<()>;

    /// Forget the record for `scope`, refilling its bucket.
    async fn reset(&self, scope: &ScopeKey) -> Result<()>;
}
