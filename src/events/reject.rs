//! Observers that stop an operation once a limit is exceeded.

use crate::error::{RateLimiterError, Result};

use super::headers::HeaderValues;
use super::observer::{Decision, RateLimitEvent, RateLimitObserver};

/// Fails the evaluation with [`RateLimiterError::TooManyRequests`].
#[derive(Debug, Clone)]
pub struct TooManyRequestsObserver {
    message: String,
}

impl TooManyRequestsObserver {
    pub fn new() -> Self {
        Self::with_message("Rate limit exceeded.")
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for TooManyRequestsObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitObserver for TooManyRequestsObserver {
    fn on_exceeded(&self, event: &RateLimitEvent<'_>, _decision: &mut Decision) -> Result<()> {
        let retry_after = HeaderValues::compute(event.results.values()).retry_after;

        Err(RateLimiterError::TooManyRequests {
            message: self.message.clone(),
            retry_after: (retry_after > 0).then_some(retry_after),
        })
    }
}

/// Denies the operation without failing the evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyObserver;

impl RateLimitObserver for DenyObserver {
    fn on_exceeded(&self, _event: &RateLimitEvent<'_>, decision: &mut Decision) -> Result<()> {
        decision.deny();
        Ok(())
    }
}
