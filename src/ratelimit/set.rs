//! Evaluation of a whole set of named limits.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::Result;

use super::bucket::LeakyBucket;
use super::context::Context;
use super::provider::LimitEntry;
use super::result::RateLimitResult;

/// Named limits, kept in insertion order. Names are unique.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSet {
    entries: Vec<(String, LimitEntry)>,
}

impl RateLimitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a limit, replacing any limit already registered under `name`.
    pub fn insert(&mut self, name: impl Into<String>, entry: impl Into<LimitEntry>) {
        let name = name.into();
        let entry = entry.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = entry,
            None => self.entries.push((name, entry)),
        }
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, entry: impl Into<LimitEntry>) -> Self {
        self.insert(name, entry);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&LimitEntry> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, entry)| entry)
    }

    /// Check every active limit once and collect the results by name.
    ///
    /// All active limits are checked even after one is exceeded, so
    /// observers see the complete picture. The first error aborts.
    pub async fn evaluate(
        &self,
        bucket: &LeakyBucket,
        context: &Context,
    ) -> Result<BTreeMap<String, RateLimitResult>> {
        let mut results = BTreeMap::new();

        for (name, entry) in &self.entries {
            let definition = entry.resolve(context)?;
            if !definition.is_active(context, name) {
                trace!(limit = %name, "Rate limit inactive, skipping");
                continue;
            }

            let result = bucket.check(&definition, context, name).await?;
            results.insert(name.clone(), result);
        }

        Ok(results)
    }
}

impl<N, E> FromIterator<(N, E)> for RateLimitSet
where
    N: Into<String>,
    E: Into<LimitEntry>,
{
    fn from_iter<I: IntoIterator<Item = (N, E)>>(iter: I) -> Self {
        let mut set = RateLimitSet::new();
        for (name, entry) in iter {
            set.insert(name, entry);
        }
        set
    }
}
