//! Leaky bucket evaluation.
//!
//! Each bucket refills linearly at `capacity / window` units per second, up to
//! `capacity`, and every permitted request consumes one unit.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::allowance::{AllowanceRecord, AllowanceStore};
use crate::clock::Clock;
use crate::error::Result;

use super::context::Context;
use super::definition::RateLimitDefinition;
use super::result::RateLimitResult;
use super::scope::{ScopeKey, ScopeKeyResolver};

/// Apply the refill for the time elapsed since `last` and clamp to capacity.
///
/// The refill is floored toward negative infinity, so a clock that went
/// backwards never grants allowance that has not been earned. Fractions of a
/// unit are dropped; the next check re-anchors at `now`.
pub fn refill(allowance: i64, last: i64, now: i64, capacity: u64, window: u64) -> i64 {
    let elapsed = now as i128 - last as i128;
    let gained = (elapsed * capacity as i128).div_euclid(window as i128);
    let gained = gained.clamp(i64::MIN as i128, i64::MAX as i128) as i64;

    allowance.saturating_add(gained).min(capacity as i64)
}

/// Per-scope async locks making load-compute-save atomic within the process.
#[derive(Debug, Default)]
struct ScopeLocks {
    locks: DashMap<ScopeKey, Arc<Mutex<()>>>,
}

impl ScopeLocks {
    fn acquire(&self, scope: &ScopeKey) -> ScopeLock<'_> {
        let lock = self.locks.entry(scope.clone()).or_default().clone();
        ScopeLock {
            locks: self,
            scope: scope.clone(),
            lock,
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// A claim on one scope's lock. Dropping it, including when the owning
/// future is cancelled, removes the table entry once nobody else holds it.
struct ScopeLock<'a> {
    locks: &'a ScopeLocks,
    scope: ScopeKey,
    lock: Arc<Mutex<()>>,
}

impl ScopeLock<'_> {
    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for ScopeLock<'_> {
    fn drop(&mut self) {
        // The map's reference and ours: nobody else is waiting on this scope.
        let table = &self.locks.locks;
        table.remove_if(&self.scope, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// Evaluates definitions against persisted allowances.
pub struct LeakyBucket {
    /// Engine identity, the first component of every scope key
    identity: String,
    store: Arc<dyn AllowanceStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ScopeKeyResolver>,
    /// Owner tag used when the context carries none
    default_owner: Option<String>,
    locks: ScopeLocks,
}

impl LeakyBucket {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn AllowanceStore>,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn ScopeKeyResolver>,
    ) -> Self {
        Self {
            identity: identity.into(),
            store,
            clock,
            resolver,
            default_owner: None,
            locks: ScopeLocks::default(),
        }
    }

    /// Namespace scope keys under `owner` when a request has no owner tag.
    pub fn with_default_owner(mut self, owner: Option<String>) -> Self {
        self.default_owner = owner;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn AllowanceStore> {
        &self.store
    }

    /// Scope key under which `definition`, registered as `name`, stores its
    /// allowance for this request.
    pub fn scope_key(
        &self,
        definition: &RateLimitDefinition,
        context: &Context,
        name: &str,
    ) -> ScopeKey {
        let identifier = definition.resolve_identifier(context, name);
        let owner = context.owner().or(self.default_owner.as_deref());
        self.resolver.resolve(&self.identity, owner, name, identifier.as_deref())
    }

    /// Check one definition, consuming a unit if the request is allowed.
    ///
    /// The updated allowance is persisted on both the allowed and the
    /// exceeded path, so rejected requests still advance the timestamp.
    pub async fn check(
        &self,
        definition: &Arc<RateLimitDefinition>,
        context: &Context,
        name: &str,
    ) -> Result<RateLimitResult> {
        let scope = self.scope_key(definition, context, name);

        trace!(
            scope = %scope,
            capacity = definition.capacity(),
            window = definition.window(),
            "Checking rate limit"
        );

        let (now, outcome) = {
            let lock = self.locks.acquire(&scope);
            let _guard = lock.lock().await;
            let now = self.clock.now();
            (now, self.consume(definition, &scope, now).await)
        };
        let allowance = outcome?;

        let is_exceeded = allowance.is_none();
        if is_exceeded {
            debug!(scope = %scope, limit = %name, "Rate limit exceeded");
        }

        Ok(RateLimitResult {
            timestamp: now,
            allowance: allowance.unwrap_or(0),
            is_exceeded,
            name: name.to_string(),
            definition: Arc::clone(definition),
        })
    }

    /// Load, refill, decide and save. Returns the remaining allowance, or
    /// `None` when the bucket is empty.
    async fn consume(
        &self,
        definition: &RateLimitDefinition,
        scope: &ScopeKey,
        now: i64,
    ) -> Result<Option<i64>> {
        let stored = self.store.load(scope, now).await?;
        let allowance = refill(
            stored.allowance,
            stored.timestamp,
            now,
            definition.capacity(),
            definition.window(),
        );

        let remaining = if allowance < 1 { None } else { Some(allowance - 1) };

        let record = AllowanceRecord::new(remaining.unwrap_or(0), now);
        self.store.save(scope, record, definition.window()).await?;

        Ok(remaining)
    }

    /// Number of scopes currently being evaluated.
    pub fn in_flight_scopes(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowance::{CacheAllowanceStore, MemoryCache};
    use crate::clock::ManualClock;
    use crate::error::RateLimiterError;
    use crate::ratelimit::DefaultScopeKeyResolver;
    use async_trait::async_trait;

    const T0: i64 = 1_700_000_000;

    struct Harness {
        bucket: LeakyBucket,
        store: Arc<CacheAllowanceStore<Arc<MemoryCache>>>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(T0);
        let cache = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
        let store = Arc::new(CacheAllowanceStore::new(cache));
        let bucket = LeakyBucket::new(
            "ratewarden",
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(DefaultScopeKeyResolver),
        );
        Harness { bucket, store, clock }
    }

    fn definition(capacity: u64, window: u64) -> Arc<RateLimitDefinition> {
        Arc::new(RateLimitDefinition::new(capacity, window).unwrap())
    }

    #[test]
    fn test_refill_is_linear_and_clamped() {
        assert_eq!(refill(0, 0, 50, 10, 100), 5);
        assert_eq!(refill(0, 0, 59, 10, 100), 5);
        assert_eq!(refill(3, 0, 1_000, 10, 100), 10);
        assert_eq!(refill(i64::MAX, T0, T0, 10, 100), 10);
    }

    #[test]
    fn test_refill_floors_negative_elapsed() {
        // -5 * 10 / 100 = -0.5, floored to -1 rather than truncated to 0
        assert_eq!(refill(4, 105, 100, 10, 100), 3);
        assert_eq!(refill(4, 100, 100, 10, 100), 4);
    }

    #[test]
    fn test_refill_saturates() {
        assert_eq!(refill(i64::MAX, i64::MIN, i64::MAX, u64::MAX >> 1, 1), i64::MAX);
        assert_eq!(refill(i64::MIN, i64::MAX, i64::MIN, 1, 1), i64::MIN);
    }

    #[tokio::test]
    async fn test_fresh_scope_is_allowed() {
        let h = harness();
        let def = definition(1000, 3600);

        let result = h.bucket.check(&def, &Context::new(), "user").await.unwrap();

        assert!(!result.is_exceeded);
        assert_eq!(result.allowance, 999);
        assert_eq!(result.timestamp, T0);
        assert_eq!(result.name, "user");
        assert!(Arc::ptr_eq(&result.definition, &def));
    }

    #[tokio::test]
    async fn test_exhaustion_then_idempotent_rejection() {
        let h = harness();
        let def = definition(3, 3600);
        let ctx = Context::new();

        for expected in [2, 1, 0] {
            let result = h.bucket.check(&def, &ctx, "user").await.unwrap();
            assert!(!result.is_exceeded);
            assert_eq!(result.allowance, expected);
        }

        for _ in 0..5 {
            let result = h.bucket.check(&def, &ctx, "user").await.unwrap();
            assert!(result.is_exceeded);
            assert_eq!(result.allowance, 0);
        }
    }

    #[tokio::test]
    async fn test_refill_after_half_window() {
        let h = harness();
        let def = definition(10, 100);
        let ctx = Context::new();

        for _ in 0..10 {
            assert!(!h.bucket.check(&def, &ctx, "api").await.unwrap().is_exceeded);
        }
        assert!(h.bucket.check(&def, &ctx, "api").await.unwrap().is_exceeded);

        h.clock.advance(50);
        let result = h.bucket.check(&def, &ctx, "api").await.unwrap();
        assert!(!result.is_exceeded);
        assert_eq!(result.allowance, 4);
    }

    #[tokio::test]
    async fn test_rejected_requests_advance_timestamp() {
        let h = harness();
        let def = definition(10, 100);
        let ctx = Context::new();
        let scope = h.bucket.scope_key(&def, &ctx, "api");

        h.store
            .save(&scope, AllowanceRecord::new(0, T0 - 5), 100)
            .await
            .unwrap();

        // 5s * 10/100 = 0 units: rejected, but re-anchored at T0.
        assert!(h.bucket.check(&def, &ctx, "api").await.unwrap().is_exceeded);
        let stored = h.store.load(&scope, T0).await.unwrap();
        assert_eq!(stored, AllowanceRecord::new(0, T0));

        // Another 5s is still not a full unit.
        h.clock.advance(5);
        assert!(h.bucket.check(&def, &ctx, "api").await.unwrap().is_exceeded);
    }

    #[tokio::test]
    async fn test_stored_exhausted_record_is_exceeded() {
        let h = harness();
        let def = Arc::new(RateLimitDefinition::new(1, 3600).unwrap().with_identifier("42"));
        let ctx = Context::new();
        let scope = h.bucket.scope_key(&def, &ctx, "user");
        assert_eq!(scope.as_str(), "ratewarden||user|42");

        h.store
            .save(&scope, AllowanceRecord::new(0, T0 - 10), 3600)
            .await
            .unwrap();

        let result = h.bucket.check(&def, &ctx, "user").await.unwrap();
        assert!(result.is_exceeded);
        assert_eq!(result.allowance, 0);
    }

    #[tokio::test]
    async fn test_clock_skew_suppresses_refill() {
        let h = harness();
        let def = definition(10, 100);
        let ctx = Context::new();
        let scope = h.bucket.scope_key(&def, &ctx, "api");

        h.store
            .save(&scope, AllowanceRecord::new(1, T0 + 30), 100)
            .await
            .unwrap();

        // -30 * 10 / 100 = -3: the single stored unit is not usable yet.
        let result = h.bucket.check(&def, &ctx, "api").await.unwrap();
        assert!(result.is_exceeded);
        assert_eq!(result.allowance, 0);
    }

    #[tokio::test]
    async fn test_persisted_allowance_stays_within_bounds() {
        let h = harness();
        let def = definition(5, 10);
        let ctx = Context::new();
        let scope = h.bucket.scope_key(&def, &ctx, "burst");

        for step in 0..40 {
            h.clock.advance(if step % 7 == 0 { 9 } else { 0 });
            h.bucket.check(&def, &ctx, "burst").await.unwrap();
            let stored = h.store.load(&scope, h.clock.now()).await.unwrap();
            assert!((0..=5).contains(&stored.allowance), "step {}: {:?}", step, stored);
        }
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let h = harness();
        let def = definition(1, 3600);
        let per_user = Arc::new(
            RateLimitDefinition::new(1, 3600)
                .unwrap()
                .with_identifier_fn(|ctx, _| ctx.principal().map(str::to_string)),
        );

        assert!(!h.bucket.check(&def, &Context::new(), "a").await.unwrap().is_exceeded);
        assert!(!h.bucket.check(&def, &Context::new(), "b").await.unwrap().is_exceeded);

        let alice = Context::new().with_principal("alice");
        let bob = Context::new().with_principal("bob");
        assert!(!h.bucket.check(&per_user, &alice, "user").await.unwrap().is_exceeded);
        assert!(!h.bucket.check(&per_user, &bob, "user").await.unwrap().is_exceeded);
        assert!(h.bucket.check(&per_user, &alice, "user").await.unwrap().is_exceeded);
    }

    #[tokio::test]
    async fn test_owner_tag_namespaces_scope() {
        let h = harness();
        let def = definition(1, 3600);

        let users = Context::new().with_owner("users");
        let orders = Context::new().with_owner("orders");
        assert!(!h.bucket.check(&def, &users, "global").await.unwrap().is_exceeded);
        assert!(!h.bucket.check(&def, &orders, "global").await.unwrap().is_exceeded);
        assert!(h.bucket.check(&def, &users, "global").await.unwrap().is_exceeded);
    }

    #[tokio::test]
    async fn test_default_owner_applies_when_context_has_none() {
        let h = harness();
        let bucket = LeakyBucket::new(
            "ratewarden",
            h.store.clone(),
            Arc::new(h.clock.clone()),
            Arc::new(DefaultScopeKeyResolver),
        )
        .with_default_owner(Some("api".to_string()));
        let def = definition(1, 60);

        let scope = bucket.scope_key(&def, &Context::new(), "global");
        assert_eq!(scope.as_str(), "ratewarden|api|global|");

        let scope = bucket.scope_key(&def, &Context::new().with_owner("admin"), "global");
        assert_eq!(scope.as_str(), "ratewarden|admin|global|");
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_overgrant() {
        let h = harness();
        let bucket = Arc::new(h.bucket);
        let def = definition(5, 3600);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let bucket = bucket.clone();
            let def = def.clone();
            handles.push(tokio::spawn(async move {
                bucket.check(&def, &Context::new(), "shared").await.unwrap()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if !handle.await.unwrap().is_exceeded {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
        assert_eq!(bucket.in_flight_scopes(), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl AllowanceStore for FailingStore {
        async fn load(&self, _scope: &ScopeKey, _now: i64) -> Result<AllowanceRecord> {
            Err(RateLimiterError::Storage("backend unavailable".to_string()))
        }

        async fn save(&self, _: &ScopeKey, _: AllowanceRecord, _: u64) -> Result<()> {
            Ok(())
        }

        async fn reset(&self, _scope: &ScopeKey) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let bucket = LeakyBucket::new(
            "ratewarden",
            Arc::new(FailingStore),
            Arc::new(ManualClock::new(T0)),
            Arc::new(DefaultScopeKeyResolver),
        );

        let err = bucket
            .check(&definition(10, 60), &Context::new(), "user")
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimiterError::Storage(_)));
        assert_eq!(bucket.in_flight_scopes(), 0);
    }

    /// A store whose loads never complete.
    struct HangingStore;

    #[async_trait]
    impl AllowanceStore for HangingStore {
        async fn load(&self, _scope: &ScopeKey, _now: i64) -> Result<AllowanceRecord> {
            std::future::pending().await
        }

        async fn save(&self, _: &ScopeKey, _: AllowanceRecord, _: u64) -> Result<()> {
            Ok(())
        }

        async fn reset(&self, _scope: &ScopeKey) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_checks_release_scope_locks() {
        use std::time::Duration;
        use tokio::time::timeout;

        let bucket = LeakyBucket::new(
            "ratewarden",
            Arc::new(HangingStore),
            Arc::new(ManualClock::new(T0)),
            Arc::new(DefaultScopeKeyResolver),
        );
        let def = Arc::new(
            RateLimitDefinition::new(10, 60)
                .unwrap()
                .with_identifier_fn(|ctx, _| ctx.principal().map(str::to_string)),
        );

        for user in 0..100 {
            let ctx = Context::new().with_principal(user.to_string());
            let check = bucket.check(&def, &ctx, "user");
            let outcome = timeout(Duration::from_millis(1), check).await;
            assert!(outcome.is_err());
        }

        assert_eq!(bucket.in_flight_scopes(), 0);
    }

    /// Wraps a store and parks the first load until released.
    struct GatedStore {
        inner: Arc<CacheAllowanceStore<Arc<MemoryCache>>>,
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
        gated: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl AllowanceStore for GatedStore {
        async fn load(&self, scope: &ScopeKey, now: i64) -> Result<AllowanceRecord> {
            if self.gated.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.load(scope, now).await
        }

        async fn save(&self, scope: &ScopeKey, record: AllowanceRecord, window: u64) -> Result<()> {
            self.inner.save(scope, record, window).await
        }

        async fn reset(&self, scope: &ScopeKey) -> Result<()> {
            self.inner.reset(scope).await
        }
    }

    #[tokio::test]
    async fn test_waiting_check_reads_clock_after_lock() {
        let h = harness();
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let store = Arc::new(GatedStore {
            inner: h.store.clone(),
            entered: entered.clone(),
            release: release.clone(),
            gated: std::sync::atomic::AtomicBool::new(true),
        });
        let bucket = Arc::new(LeakyBucket::new(
            "ratewarden",
            store,
            Arc::new(h.clock.clone()),
            Arc::new(DefaultScopeKeyResolver),
        ));
        let def = definition(100, 1);

        let first = {
            let (bucket, def) = (bucket.clone(), def.clone());
            tokio::spawn(async move {
                bucket.check(&def, &Context::new(), "api").await
            })
        };
        entered.notified().await;

        let second = {
            let (bucket, def) = (bucket.clone(), def.clone());
            tokio::spawn(async move {
                bucket.check(&def, &Context::new(), "api").await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // The second check is queued on the scope lock while a second passes.
        h.clock.advance(1);
        release.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.timestamp, T0);
        assert_eq!(first.allowance, 99);
        assert_eq!(second.timestamp, T0 + 1);
        assert_eq!(second.allowance, 99);

        let scope = bucket.scope_key(&def, &Context::new(), "api");
        let stored = h.store.load(&scope, T0 + 1).await.unwrap();
        assert_eq!(stored, AllowanceRecord::new(99, T0 + 1));
    }
}
