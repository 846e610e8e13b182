//! Rate limit definitions.

use std::fmt;
use std::sync::Arc;

use crate::error::{RateLimiterError, Result};

use super::context::Context;

/// A function evaluated against the current request and the limit's name.
pub type Resolver<T> = Arc<dyn Fn(&Context, &str) -> T + Send + Sync>;

/// A configuration value that is either fixed or computed per request.
#[derive(Clone)]
pub enum Deferred<T> {
    /// The same value for every request
    Constant(T),
    /// Evaluated on every request with `(context, name)`
    Computed(Resolver<T>),
}

impl<T: Clone> Deferred<T> {
    /// Wrap a closure as a computed value.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Context, &str) -> T + Send + Sync + 'static,
    {
        Deferred::Computed(Arc::new(f))
    }

    /// Resolve the value for the current request.
    pub fn resolve(&self, context: &Context, name: &str) -> T {
        match self {
            Deferred::Constant(value) => value.clone(),
            Deferred::Computed(f) => f(context, name),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Deferred::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Static parameters of one named rate limit.
///
/// The name is not stored here: a definition is registered under a name in
/// a provider, and the same definition may be reused under several names.
#[derive(Debug, Clone)]
pub struct RateLimitDefinition {
    /// Maximum allowance per window
    capacity: u64,
    /// Refill period in seconds
    window: u64,
    /// Further scopes the bucket; `None` makes the bucket global
    identifier: Deferred<Option<String>>,
    /// Whether the limit applies to the current request
    active: Deferred<bool>,
}

impl RateLimitDefinition {
    /// Create a global, always-active definition.
    ///
    /// Both `capacity` and `window` must be positive.
    pub fn new(capacity: u64, window: u64) -> Result<Self> {
        if capacity == 0 || capacity > i64::MAX as u64 {
            return Err(RateLimiterError::Config(format!(
                "capacity must be between 1 and {}, got {}",
                i64::MAX,
                capacity
            )));
        }
        if window == 0 || window > i64::MAX as u64 {
            return Err(RateLimiterError::Config(format!(
                "window must be between 1 and {} seconds, got {}",
                i64::MAX,
                window
            )));
        }

        Ok(Self {
            capacity,
            window,
            identifier: Deferred::Constant(None),
            active: Deferred::Constant(true),
        })
    }

    /// Scope the bucket by a fixed identifier.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Deferred::Constant(Some(identifier.into()));
        self
    }

    /// Scope the bucket by an identifier derived from the request.
    ///
    /// Returning `None` puts the request in the global bucket.
    pub fn with_identifier_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.identifier = Deferred::computed(f);
        self
    }

    /// Enable or disable the limit for every request.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Deferred::Constant(active);
        self
    }

    /// Decide per request whether the limit applies.
    pub fn with_active_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &str) -> bool + Send + Sync + 'static,
    {
        self.active = Deferred::computed(f);
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Resolve the identifier that scopes this limit's bucket.
    pub fn resolve_identifier(&self, context: &Context, name: &str) -> Option<String> {
        self.identifier.resolve(context, name)
    }

    /// Whether this limit should be checked for the current request.
    pub fn is_active(&self, context: &Context, name: &str) -> bool {
        self.active.resolve(context, name)
    }
}
