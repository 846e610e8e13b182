//! Observers writing rate limit response headers.

use crate::error::Result;
use crate::ratelimit::RateLimitResult;

use super::observer::{Decision, RateLimitEvent, RateLimitObserver};

/// Combined header values over several results.
///
/// With more than one limit these are advisory aggregates: the smallest
/// limit and remaining allowance, and the longest reset and retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderValues {
    /// Smallest capacity
    pub limit: i64,
    /// Smallest remaining allowance
    pub remaining: i64,
    /// Seconds until every bucket is full again
    pub reset: i64,
    /// Seconds until every bucket has at least one unit; zero or negative
    /// when none is empty
    pub retry_after: i64,
}

impl HeaderValues {
    pub fn compute<'a>(results: impl IntoIterator<Item = &'a RateLimitResult>) -> Self {
        let mut values = HeaderValues {
            limit: i64::MAX,
            remaining: i64::MAX,
            reset: 0,
            retry_after: 0,
        };

        for result in results {
            let limit = result.capacity() as i64;
            let window = result.window() as i64;
            let remaining = result.allowance;

            let reset = (limit - remaining).saturating_mul(window).div_euclid(limit);
            let retry_after = ceil_div((1 - remaining).saturating_mul(window), limit);

            values.limit = values.limit.min(limit);
            values.remaining = values.remaining.min(remaining);
            values.reset = values.reset.max(reset);
            values.retry_after = values.retry_after.max(retry_after);
        }

        values
    }
}

/// Ceiling division for a positive divisor.
fn ceil_div(numerator: i64, divisor: i64) -> i64 {
    -(numerator.saturating_neg().div_euclid(divisor))
}

/// Writes `{prefix}Limit`, `{prefix}Remaining` and `{prefix}Reset` headers
/// whenever limits are checked.
#[derive(Debug, Clone)]
pub struct RateLimitHeadersObserver {
    prefixes: Vec<String>,
}

impl RateLimitHeadersObserver {
    /// Headers prefixed with `X-Rate-Limit-`.
    pub fn new() -> Self {
        Self::with_prefixes(["X-Rate-Limit-"])
    }

    /// Write the headers once per prefix.
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for RateLimitHeadersObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitObserver for RateLimitHeadersObserver {
    fn on_checked(&self, event: &RateLimitEvent<'_>) -> Result<()> {
        let values = HeaderValues::compute(event.results.values());
        let headers = event.context.headers();

        for prefix in &self.prefixes {
            headers.set(format!("{}Limit", prefix), values.limit);
            headers.set(format!("{}Remaining", prefix), values.remaining);
            headers.set(format!("{}Reset", prefix), values.reset);
        }
        Ok(())
    }
}

/// Writes a `Retry-After` header when limits are exceeded.
#[derive(Debug, Clone)]
pub struct RetryAfterHeaderObserver {
    header: String,
}

impl RetryAfterHeaderObserver {
    pub fn new() -> Self {
        Self::with_header("Retry-After")
    }

    pub fn with_header(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for RetryAfterHeaderObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitObserver for RetryAfterHeaderObserver {
    fn on_exceeded(&self, event: &RateLimitEvent<'_>, _decision: &mut Decision) -> Result<()> {
        let values = HeaderValues::compute(event.results.values());

        // A non-positive delay means some allowance is left; say nothing.
        if values.retry_after > 0 {
            event.context.headers().set(self.header.clone(), values.retry_after);
        }
        Ok(())
    }
}
