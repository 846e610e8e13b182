//! Outcome of checking one rate limit.

use std::sync::Arc;

use super::definition::RateLimitDefinition;

/// The result of checking a single named limit for a single request.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Unix seconds at which the limit was checked
    pub timestamp: i64,
    /// Allowance remaining after this request
    pub allowance: i64,
    /// Whether the request exceeded this limit
    pub is_exceeded: bool,
    /// Name the limit was registered under
    pub name: String,
    /// The definition that was checked
    pub definition: Arc<RateLimitDefinition>,
}

impl RateLimitResult {
    pub fn capacity(&self) -> u64 {
        self.definition.capacity()
    }

    pub fn window(&self) -> u64 {
        self.definition.window()
    }
}
