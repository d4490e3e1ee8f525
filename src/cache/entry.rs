use crate::compiler::CompiledTemplate;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What kind of artifact an entry holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    #[default]
    Compiled,
    Rendered,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum CachedValue {
    Compiled(Arc<CompiledTemplate>),
    Rendered(Arc<str>),
}

impl CachedValue {
    pub fn as_compiled(&self) -> Option<&Arc<CompiledTemplate>> {
        match self {
            CachedValue::Compiled(c) => Some(c),
            CachedValue::Rendered(_) => None,
        }
    }

    pub fn as_rendered(&self) -> Option<&str> {
        match self {
            CachedValue::Rendered(s) => Some(s),
            CachedValue::Compiled(_) => None,
        }
    }

    /// Approximate resident size in bytes.
    pub fn size_estimate(&self) -> usize {
        match self {
            CachedValue::Rendered(s) => s.len(),
            CachedValue::Compiled(c) => serde_json::to_vec(c.as_ref()).map_or(0, |v| v.len()),
        }
    }
}

impl From<&str> for CachedValue {
    fn from(s: &str) -> Self {
        CachedValue::Rendered(Arc::from(s))
    }
}

impl From<String> for CachedValue {
    fn from(s: String) -> Self {
        CachedValue::Rendered(Arc::from(s))
    }
}

impl From<CompiledTemplate> for CachedValue {
    fn from(c: CompiledTemplate) -> Self {
        CachedValue::Compiled(Arc::new(c))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: Timestamp,
    pub ttl_ms: Option<u64>,
    pub access_count: u64,
    pub last_access: Timestamp,
    pub size_estimate: usize,
    /// Templates whose change invalidates this entry.
    pub dependencies: BTreeSet<String>,
    pub scope: CacheScope,
}

impl EntryMetadata {
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.ttl_ms
            .map(|ttl| self.created_at.saturating_add(ttl as Timestamp))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub metadata: EntryMetadata,
}

/// Options for [`CacheEngine::set`](super::CacheEngine::set).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetOptions {
    /// Overrides the configured default TTL.
    pub ttl_ms: Option<u64>,
    pub dependencies: BTreeSet<String>,
    pub scope: CacheScope,
}

impl SetOptions {
    pub fn scope(scope: CacheScope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }
}
