//! Observer contract for rate limit events.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::ratelimit::{Context, RateLimitResult};

/// Payload of the checked and exceeded events.
///
/// For the checked event `results` holds every checked limit; for the
/// exceeded event only the exceeded ones.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEvent<'a> {
    /// Unix seconds at which the event was dispatched
    pub time: i64,
    /// The request being rate limited
    pub context: &'a Context,
    /// Results keyed by limit name
    pub results: &'a BTreeMap<String, RateLimitResult>,
}

impl<'a> RateLimitEvent<'a> {
    pub fn new(
        time: i64,
        context: &'a Context,
        results: &'a BTreeMap<String, RateLimitResult>,
    ) -> Self {
        Self {
            time,
            context,
            results,
        }
    }

    /// Names of the limits in this event.
    pub fn names(&self) -> impl Iterator<Item = &'a str> {
        self.results.keys().map(String::as_str)
    }
}

/// Whether the operation may proceed after the exceeded event.
///
/// Starts out allowing; any observer may deny. Denial is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    proceed: bool,
}

impl Decision {
    pub fn new() -> Self {
        Self { proceed: true }
    }

    /// Stop the operation from proceeding.
    pub fn deny(&mut self) {
        self.proceed = false;
    }

    pub fn is_allowed(&self) -> bool {
        self.proceed
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::new()
    }
}

/// Reacts to rate limit events.
///
/// Both hooks run synchronously in registration order. Returning an error
/// aborts dispatch of the current event and fails the evaluation; that is
/// how an observer turns an exceeded limit into a hard rejection.
pub trait RateLimitObserver: Send + Sync {
    /// Called whenever at least one limit was checked.
    fn on_checked(&self, _event: &RateLimitEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// Called when at least one limit was exceeded.
    fn on_exceeded(&self, _event: &RateLimitEvent<'_>, _decision: &mut Decision) -> Result<()> {
        Ok(())
    }
}

/// Restricts an observer to events involving particular limit names.
///
/// The observer runs if any name in the event is not in `except` and, when
/// `only` is set, is in `only`.
#[derive(Debug, Clone)]
pub struct Filtered<O> {
    inner: O,
    only: Option<Vec<String>>,
    except: Vec<String>,
}

impl<O> Filtered<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            only: None,
            except: Vec::new(),
        }
    }

    /// Apply only to these limit names.
    pub fn only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Never apply to these limit names.
    pub fn except<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except = names.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the observer applies to an event naming `names`.
    pub fn applies_to<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> bool {
        names.into_iter().any(|name| {
            let excluded = self.except.iter().any(|e| e == name);
            let included = match &self.only {
                Some(only) => only.iter().any(|o| o == name),
                None => true,
            };
            !excluded && included
        })
    }
}

impl<O: RateLimitObserver> RateLimitObserver for Filtered<O> {
    fn on_checked(&self, event: &RateLimitEvent<'_>) -> Result<()> {
        if !self.applies_to(event.names()) {
            return Ok(());
        }
        self.inner.on_checked(event)
    }

    fn on_exceeded(&self, event: &RateLimitEvent<'_>, decision: &mut Decision) -> Result<()> {
        if !self.applies_to(event.names()) {
            return Ok(());
        }
        self.inner.on_exceeded(event, decision)
    }
}

/// Shorthand for wrapping observers in [`Filtered`].
pub trait ObserverExt: RateLimitObserver + Sized {
    fn only<I, S>(self, names: I) -> Filtered<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filtered::new(self).only(names)
    }

    fn except<I, S>(self, names: I) -> Filtered<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filtered::new(self).except(names)
    }
}

impl<O: RateLimitObserver> ObserverExt for O {}
