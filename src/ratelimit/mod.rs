//! Rate limit definitions, evaluation and the limiter facade.

mod bucket;
mod context;
mod definition;
mod limiter;
mod provider;
mod result;
mod scope;
mod set;

pub use bucket::{refill, LeakyBucket};
pub use context::{Context, ResponseHeaders};
pub use definition::{Deferred, RateLimitDefinition, Resolver};
pub use limiter::{RateLimiter, RateLimiterBuilder, DEFAULT_IDENTITY};
pub use provider::{DefaultRateLimitProvider, LimitEntry, RateLimitProvider, RateLimitSource};
pub use result::RateLimitResult;
pub use scope::{DefaultScopeKeyResolver, ScopeKey, ScopeKeyResolver, SCOPE_DELIMITER};
pub use set::RateLimitSet;
