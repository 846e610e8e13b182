//! Ordered delivery of rate limit events to observers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::ratelimit::{Context, RateLimitResult};

use super::observer::{Decision, RateLimitEvent, RateLimitObserver};

/// Dispatches the checked and exceeded events to registered observers.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    observers: Vec<Arc<dyn RateLimitObserver>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Observers run in registration order.
    pub fn register<O: RateLimitObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Arc::new(observer));
    }

    pub fn register_arc(&mut self, observer: Arc<dyn RateLimitObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver events for one evaluation and return whether the operation
    /// may proceed.
    ///
    /// Nothing is dispatched when `results` is empty. Every observer sees
    /// the checked event before any sees the exceeded event, which only
    /// carries the exceeded results. An observer error stops dispatch and
    /// is returned as is.
    pub fn dispatch(
        &self,
        time: i64,
        context: &Context,
        results: &BTreeMap<String, RateLimitResult>,
    ) -> Result<bool> {
        if results.is_empty() {
            return Ok(true);
        }

        let checked = RateLimitEvent::new(time, context, results);
        for observer in &self.observers {
            observer.on_checked(&checked).map_err(|e| {
                warn!(error = %e, "Observer aborted checked event");
                e
            })?;
        }

        let exceeded: BTreeMap<String, RateLimitResult> = results
            .iter()
            .filter(|(_, result)| result.is_exceeded)
            .map(|(name, result)| (name.clone(), result.clone()))
            .collect();
        if exceeded.is_empty() {
            return Ok(true);
        }

        debug!(
            limits = ?exceeded.keys().collect::<Vec<_>>(),
            "Rate limits exceeded"
        );

        let event = RateLimitEvent::new(time, context, &exceeded);
        let mut decision = Decision::new();
        for observer in &self.observers {
            observer.on_exceeded(&event, &mut decision).map_err(|e| {
                if e.is_operational() {
                    warn!(error = %e, "Observer aborted exceeded event");
                }
                e
            })?;
        }

        Ok(decision.is_allowed())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("observers", &self.observers.len())
            .finish()
    }
}
