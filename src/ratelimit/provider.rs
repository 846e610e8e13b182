//! Sources of rate limit definitions.

use std::fmt;
use std::sync::Arc;

use crate::config::DefinitionConfig;
use crate::error::{RateLimiterError, Result};

use super::context::Context;
use super::definition::RateLimitDefinition;
use super::set::RateLimitSet;

/// Something that yields a definition for the current request, for example
/// an account type carrying its own quota.
pub trait RateLimitSource: Send + Sync {
    fn rate_limit(&self, context: &Context) -> Result<RateLimitDefinition>;
}

/// One entry of a rate limit set, resolved to a concrete definition at
/// evaluation time.
#[derive(Clone)]
pub enum LimitEntry {
    /// A ready definition
    Definition(Arc<RateLimitDefinition>),
    /// A definition produced per request
    Source(Arc<dyn RateLimitSource>),
    /// An untyped definition, e.g. from a dynamic configuration source
    Raw(serde_json::Value),
}

impl LimitEntry {
    /// Resolve to a concrete definition.
    ///
    /// Raw values that do not describe a definition are rejected with
    /// [`RateLimiterError::InvalidDefinition`]; they are never coerced.
    pub fn resolve(&self, context: &Context) -> Result<Arc<RateLimitDefinition>> {
        match self {
            LimitEntry::Definition(def) => Ok(Arc::clone(def)),
            LimitEntry::Source(source) => source.rate_limit(context).map(Arc::new),
            LimitEntry::Raw(value) => {
                let config: DefinitionConfig = serde_json::from_value(value.clone()).map_err(|e| {
                    RateLimiterError::InvalidDefinition(format!(
                        "expected a rate limit definition with `limit` and `window`: {}",
                        e
                    ))
                })?;
                config.into_definition().map(Arc::new)
            }
        }
    }
}

impl fmt::Debug for LimitEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitEntry::Definition(def) => f.debug_tuple("Definition").field(def).finish(),
            LimitEntry::Source(_) => f.write_str("Source(..)"),
            LimitEntry::Raw(value) => f.debug_tuple("Raw").field(value).finish(),
        }
    }
}

impl From<RateLimitDefinition> for LimitEntry {
    fn from(def: RateLimitDefinition) -> Self {
        LimitEntry::Definition(Arc::new(def))
    }
}

impl From<Arc<RateLimitDefinition>> for LimitEntry {
    fn from(def: Arc<RateLimitDefinition>) -> Self {
        LimitEntry::Definition(def)
    }
}

impl From<Arc<dyn RateLimitSource>> for LimitEntry {
    fn from(source: Arc<dyn RateLimitSource>) -> Self {
        LimitEntry::Source(source)
    }
}

impl From<serde_json::Value> for LimitEntry {
    fn from(value: serde_json::Value) -> Self {
        LimitEntry::Raw(value)
    }
}

/// Supplies the limits that apply to a request.
pub trait RateLimitProvider: Send + Sync {
    fn rate_limits(&self, context: &Context) -> RateLimitSet;
}

/// Provider returning the same configured set for every request.
#[derive(Debug, Clone, Default)]
pub struct DefaultRateLimitProvider {
    definitions: RateLimitSet,
}

impl DefaultRateLimitProvider {
    pub fn new(definitions: RateLimitSet) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &RateLimitSet {
        &self.definitions
    }
}

impl RateLimitProvider for DefaultRateLimitProvider {
    fn rate_limits(&self, _context: &Context) -> RateLimitSet {
        self.definitions.clone()
    }
}
