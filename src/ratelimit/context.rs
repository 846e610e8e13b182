//! Per-request context handed to identifier resolvers, activation predicates
//! and observers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

/// Response headers collected by observers while a request is evaluated.
///
/// The host reads them back after evaluation and copies them onto its own
/// response type. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl ResponseHeaders {
    /// Create an empty header bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value.
    pub fn set(&self, name: impl Into<String>, value: impl ToString) {
        self.inner.lock().insert(name.into(), value.to_string());
    }

    /// Get the current value of a header.
    pub fn get(&self, name: &str) -> Option<String> {
        self.inner.lock().get(name).cloned()
    }

    /// Whether no header has been set.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy of all headers, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().clone()
    }
}

/// The request being rate limited, as seen by the engine.
///
/// The engine itself only reads the owner tag; everything else is there for
/// identifier resolvers and activation predicates.
#[derive(Debug, Clone, Default)]
pub struct Context {
    owner: Option<String>,
    principal: Option<String>,
    attributes: HashMap<String, String>,
    headers: ResponseHeaders,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace scope keys under `owner`, e.g. the controller or route
    /// applying the limits.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the acting principal (user ID, API key, ...).
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Attach a request attribute such as the client IP.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Headers observers want attached to the response.
    pub fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }
}
