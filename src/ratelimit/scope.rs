//! Scope key generation.
//!
//! A scope key is the only thing correlating requests that share a bucket,
//! so it must be stable across restarts and injective over its components.

use std::fmt;

/// Delimiter between scope key components.
pub const SCOPE_DELIMITER: char = '|';

/// A key that uniquely identifies one bucket's persisted allowance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Wrap an already-composed key.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the scope key for a limit evaluated on behalf of a request.
pub trait ScopeKeyResolver: Send + Sync {
    /// Build the key for `(identity, owner, name, identifier)`.
    fn resolve(
        &self,
        identity: &str,
        owner: Option<&str>,
        name: &str,
        identifier: Option<&str>,
    ) -> ScopeKey;
}

/// Joins the components with [`SCOPE_DELIMITER`], escaping each component
/// so the delimiter never appears inside one.
///
/// Missing owner or identifier become empty components, so
/// `("ratewarden", None, "user", Some("1"))` yields `ratewarden||user|1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScopeKeyResolver;

impl ScopeKeyResolver for DefaultScopeKeyResolver {
    fn resolve(
        &self,
        identity: &str,
        owner: Option<&str>,
        name: &str,
        identifier: Option<&str>,
    ) -> ScopeKey {
        let parts = [
            escape_component(identity),
            escape_component(owner.unwrap_or("")),
            escape_component(name),
            escape_component(identifier.unwrap_or("")),
        ];

        ScopeKey(parts.join(&SCOPE_DELIMITER.to_string()))
    }
}

/// Percent-escape `%` and the delimiter.
pub(crate) fn escape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            SCOPE_DELIMITER => out.push_str("%7C"),
            _ => out.push(c),
        }
    }
    out
}
