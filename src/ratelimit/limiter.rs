//! The rate limiter facade.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::allowance::{AllowanceStore, CacheAllowanceStore, MemoryCache};
use crate::clock::{Clock, SystemClock};
use crate::config::RatewardenConfig;
use crate::error::Result;
use crate::events::{
    EventDispatcher, RateLimitHeadersObserver, RateLimitObserver, RetryAfterHeaderObserver,
    TooManyRequestsObserver,
};

use super::bucket::LeakyBucket;
use super::context::Context;
use super::definition::RateLimitDefinition;
use super::provider::{DefaultRateLimitProvider, LimitEntry, RateLimitProvider};
use super::result::RateLimitResult;
use super::scope::{DefaultScopeKeyResolver, ScopeKeyResolver};
use super::set::RateLimitSet;

/// Default engine identity.
pub const DEFAULT_IDENTITY: &str = "ratewarden";

/// Decides whether operations may proceed.
///
/// Composes the leaky bucket evaluator, the provider of the limits that
/// apply to a request and the event dispatcher. Shareable behind `Arc`.
pub struct RateLimiter {
    bucket: LeakyBucket,
    provider: Arc<dyn RateLimitProvider>,
    dispatcher: EventDispatcher,
}

impl RateLimiter {
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Build a limiter on an in-memory allowance cache from configuration.
    pub fn from_config(config: &RatewardenConfig) -> Result<Self> {
        Ok(RateLimiterBuilder::from_config(config)?.build())
    }

    /// Evaluate the limits the provider supplies for `context`.
    ///
    /// Returns whether the operation may proceed. Storage failures and
    /// observer rejections come back as errors.
    pub async fn evaluate(&self, context: &Context) -> Result<bool> {
        let limits = self.provider.rate_limits(context);
        self.evaluate_entries(&limits, context).await
    }

    /// Evaluate an explicit set of limits for `context`.
    pub async fn evaluate_entries(&self, limits: &RateLimitSet, context: &Context) -> Result<bool> {
        let results = self.check_rate_limits(limits, context).await?;

        let now = self.bucket.clock().now();
        let allowed = self.dispatcher.dispatch(now, context, &results)?;

        if !allowed {
            let exceeded: Vec<&str> = results
                .values()
                .filter(|r| r.is_exceeded)
                .map(|r| r.name.as_str())
                .collect();
            info!(
                owner = context.owner().unwrap_or_default(),
                limits = ?exceeded,
                "Operation rejected by rate limit"
            );
        }
        Ok(allowed)
    }

    /// Check every active limit in `limits` without dispatching events.
    pub async fn check_rate_limits(
        &self,
        limits: &RateLimitSet,
        context: &Context,
    ) -> Result<BTreeMap<String, RateLimitResult>> {
        limits.evaluate(&self.bucket, context).await.map_err(|e| {
            warn!(error = %e, "Rate limit evaluation failed");
            e
        })
    }

    /// Check a single limit without dispatching events. Inactive limits are
    /// still checked.
    pub async fn check_rate_limit(
        &self,
        name: &str,
        entry: &LimitEntry,
        context: &Context,
    ) -> Result<RateLimitResult> {
        let definition = entry.resolve(context)?;
        self.bucket.check(&definition, context, name).await
    }

    /// Forget the stored allowance of one scope, refilling it completely.
    pub async fn reset(
        &self,
        name: &str,
        definition: &RateLimitDefinition,
        context: &Context,
    ) -> Result<()> {
        let scope = self.bucket.scope_key(definition, context, name);
        debug!(scope = %scope, "Resetting allowance");
        self.bucket.store().reset(&scope).await
    }

    pub fn bucket(&self) -> &LeakyBucket {
        &self.bucket
    }

    pub fn provider(&self) -> &Arc<dyn RateLimitProvider> {
        &self.provider
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    identity: String,
    owner: Option<String>,
    store: Option<Arc<dyn AllowanceStore>>,
    clock: Option<Arc<dyn Clock>>,
    resolver: Arc<dyn ScopeKeyResolver>,
    provider: Option<Arc<dyn RateLimitProvider>>,
    dispatcher: EventDispatcher,
    cache_key_prefix: Option<String>,
    default_allowance: Option<i64>,
}

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            owner: None,
            store: None,
            clock: None,
            resolver: Arc::new(DefaultScopeKeyResolver),
            provider: None,
            dispatcher: EventDispatcher::new(),
            cache_key_prefix: None,
            default_allowance: None,
        }
    }

    /// Start from configuration: identity, owner, definitions, handlers and
    /// an in-memory allowance store with the configured key prefix.
    pub fn from_config(config: &RatewardenConfig) -> Result<Self> {
        config.validate()?;

        let limiter = &config.limiter;
        let mut builder = Self::new()
            .identity(limiter.identity.clone())
            .definitions(config.rate_limit_set()?);
        builder.owner = limiter.owner.clone();

        let handlers = &config.handlers;
        if !handlers.header_prefixes.is_empty() {
            builder = builder.observer(RateLimitHeadersObserver::with_prefixes(
                handlers.header_prefixes.iter().cloned(),
            ));
        }
        if let Some(header) = &handlers.retry_after_header {
            builder = builder.observer(RetryAfterHeaderObserver::with_header(header.clone()));
        }
        if handlers.reject {
            builder = builder.observer(TooManyRequestsObserver::with_message(
                handlers.reject_message.clone(),
            ));
        }

        info!(
            identity = %limiter.identity,
            definitions = config.definitions.len(),
            observers = builder.dispatcher.len(),
            "Rate limiter configured"
        );

        Ok(builder
            .cache_key_prefix(limiter.cache_key_prefix.clone())
            .default_allowance(limiter.default_allowance))
    }

    /// Engine identity, the first component of every scope key.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Owner tag for requests whose context carries none.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn AllowanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Key prefix of the built-in in-memory store; ignored with [`store`](Self::store).
    pub fn cache_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_key_prefix = Some(prefix.into());
        self
    }

    /// Allowance the built-in in-memory store reports for unseen scopes.
    pub fn default_allowance(mut self, allowance: i64) -> Self {
        self.default_allowance = Some(allowance);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scope_resolver(mut self, resolver: Arc<dyn ScopeKeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn RateLimitProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use a fixed set of limits for every request.
    pub fn definitions(self, definitions: RateLimitSet) -> Self {
        self.provider(Arc::new(DefaultRateLimitProvider::new(definitions)))
    }

    /// Register an observer; observers run in registration order.
    pub fn observer<O: RateLimitObserver + 'static>(mut self, observer: O) -> Self {
        self.dispatcher.register(observer);
        self
    }

    pub fn observer_arc(mut self, observer: Arc<dyn RateLimitObserver>) -> Self {
        self.dispatcher.register_arc(observer);
        self
    }

    pub fn build(self) -> RateLimiter {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);

        let store = match self.store {
            Some(store) => store,
            None => {
                let mut store =
                    CacheAllowanceStore::new(MemoryCache::with_clock(Arc::clone(&clock)));
                if let Some(prefix) = self.cache_key_prefix {
                    store = store.with_key_prefix(prefix);
                }
                if let Some(allowance) = self.default_allowance {
                    store = store.with_default_allowance(allowance);
                }
                Arc::new(store) as Arc<dyn AllowanceStore>
            }
        };

        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(DefaultRateLimitProvider::default()));

        let bucket = LeakyBucket::new(self.identity, store, clock, self.resolver)
            .with_default_owner(self.owner);

        RateLimiter {
            bucket,
            provider,
            dispatcher: self.dispatcher,
        }
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
