//! Two-tier memoization engine.
//!
//! The in-memory tier is bounded by `max_memory_bytes` and `max_entries` and
//! shed through the configured [`EvictionStrategy`]. The optional blob tier is
//! written through on every `set`; an eviction only drops the memory copy, so
//! a later miss in memory can promote the entry back from the blob tier.
//! Deletes, invalidations and expiry remove an entry from both tiers.

use super::blob::{BlobStore, FsBlobStore};
use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, CachedValue, EntryMetadata, SetOptions};
use super::strategy::{strategy_for, EvictionStrategy};
use super::tracker::DependencyTracker;
use super::StrategyKind;
use crate::config::CacheConfig;
use crate::error::CacheIoError;
use crate::hash::blob_name;
use crate::types::Timestamp;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// Values larger than the whole memory ceiling.
    pub rejected: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub promotions: u64,
    pub io_errors: u64,
    pub entries: usize,
    pub resident_bytes: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub expired: usize,
    pub evicted: usize,
    pub resident_bytes: usize,
}

pub struct CacheEngine {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    strategy: Box<dyn EvictionStrategy>,
    tracker: DependencyTracker,
    /// Keys evicted from memory whose blob copy remains.
    spilled: BTreeSet<String>,
    blobs: Option<Arc<dyn BlobStore>>,
    clock: Arc<dyn Clock>,
    resident_bytes: usize,
    stats: CacheStats,
}

impl CacheEngine {
    /// Memory-only engine on the system clock.
    pub fn new(config: CacheConfig) -> Self {
        let strategy = strategy_for(config.strategy, config.adaptive_lfu_threshold);
        Self {
            config,
            entries: HashMap::new(),
            strategy,
            tracker: DependencyTracker::new(),
            spilled: BTreeSet::new(),
            blobs: None,
            clock: Arc::new(SystemClock),
            resident_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    /// Engine with the blob tier configured by `persist_dir`, if any.
    pub fn from_config(config: CacheConfig) -> Self {
        let persist_dir = config.persist_dir.clone();
        let engine = Self::new(config);
        match persist_dir {
            Some(dir) => engine.with_blob_store(Arc::new(FsBlobStore::new(dir))),
            None => engine,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(store);
        self
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_bytes(&self) -> usize {
        self.resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            resident_bytes: self.resident_bytes,
            ..self.stats.clone()
        }
    }

    pub fn dependencies_of(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.tracker.dependencies_of(key)
    }

    pub async fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_ms();

        if let Some(entry) = self.entries.get_mut(key) {
            if entry.metadata.is_expired(now) {
                debug!(key = %key, "Cache entry expired on read");
                self.expire(key).await;
                self.stats.misses += 1;
                return None;
            }
            entry.metadata.access_count += 1;
            entry.metadata.last_access = now;
            self.strategy.on_access(key, &entry.metadata);
            self.stats.hits += 1;
            return Some(entry.clone());
        }

        if let Some(mut entry) = self.load_blob(key).await {
            if entry.metadata.is_expired(now) {
                self.expire(key).await;
                self.stats.misses += 1;
                return None;
            }
            entry.metadata.access_count += 1;
            entry.metadata.last_access = now;
            debug!(key = %key, "Promoting cache entry from blob tier");
            self.stats.promotions += 1;
            self.stats.hits += 1;
            self.insert_memory(key, entry.clone());
            return Some(entry);
        }

        self.stats.misses += 1;
        None
    }

    /// Whether `key` is present in either tier, without touching counters.
    pub async fn contains(&mut self, key: &str) -> bool {
        let now = self.clock.now_ms();
        if let Some(entry) = self.entries.get(key) {
            return !entry.metadata.is_expired(now);
        }
        self.load_blob(key)
            .await
            .is_some_and(|entry| !entry.metadata.is_expired(now))
    }

    /// Store `value`. Returns false when the value alone exceeds the memory
    /// ceiling and was not stored.
    pub async fn set(&mut self, key: &str, value: CachedValue, opts: SetOptions) -> bool {
        let now = self.clock.now_ms();
        let size = value.size_estimate();
        if size > self.config.max_memory_bytes {
            warn!(key = %key, size, ceiling = self.config.max_memory_bytes, "Cache value exceeds memory ceiling; not stored");
            self.stats.rejected += 1;
            return false;
        }

        let entry = CacheEntry {
            value,
            metadata: EntryMetadata {
                created_at: now,
                ttl_ms: opts.ttl_ms.or(self.config.default_ttl_ms),
                access_count: 0,
                last_access: now,
                size_estimate: size,
                dependencies: opts.dependencies,
                scope: opts.scope,
            },
        };
        self.write_blob(key, &entry).await;
        self.insert_memory(key, entry);
        self.stats.sets += 1;
        true
    }

    pub async fn delete(&mut self, key: &str) -> bool {
        self.remove_everywhere(key).await
    }

    /// Remove every entry whose dependency set contains `dependency`.
    pub async fn invalidate_by_dependency(&mut self, dependency: &str) -> usize {
        let keys = self.tracker.keys_for(dependency);
        let mut removed = 0;
        for key in &keys {
            if self.remove_everywhere(key).await {
                removed += 1;
            }
        }
        self.stats.invalidations += removed as u64;
        if removed > 0 {
            info!(dependency = %dependency, removed, "Invalidated cache entries by dependency");
        }
        removed
    }

    pub async fn invalidate_by_pattern(&mut self, pattern: &Regex) -> usize {
        let mut keys: BTreeSet<String> = self
            .entries
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        keys.extend(
            self.tracker
                .keys()
                .filter(|k| pattern.is_match(k))
                .cloned(),
        );
        let mut removed = 0;
        for key in &keys {
            if self.remove_everywhere(key).await {
                removed += 1;
            }
        }
        self.stats.invalidations += removed as u64;
        info!(pattern = %pattern, removed, "Invalidated cache entries by pattern");
        removed
    }

    /// Drop expired entries from both tiers, then shed entries if memory
    /// use is above the trigger ratio of the ceiling.
    pub async fn gc(&mut self) -> GcReport {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.metadata.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.expire(key).await;
        }
        let expired_blobs = self.sweep_spilled(now).await;

        let mut evicted = 0;
        let trigger = (self.config.max_memory_bytes as f64 * self.config.gc_trigger_ratio) as usize;
        if self.resident_bytes > trigger {
            let share = self.entries.len() * self.config.gc_evict_percent as usize / 100;
            let victims = self.strategy.victims(&self.entries, share.max(1));
            for key in &victims {
                if self.evict(key) {
                    evicted += 1;
                }
            }
            evicted += self.enforce_limits(None);
        }

        let report = GcReport {
            expired: expired.len() + expired_blobs,
            evicted,
            resident_bytes: self.resident_bytes,
        };
        info!(
            expired = report.expired,
            evicted = report.evicted,
            resident_bytes = report.resident_bytes,
            entries = self.entries.len(),
            "Cache GC sweep"
        );
        report
    }

    /// Expire blob-only entries whose TTL has elapsed. Returns how many.
    async fn sweep_spilled(&mut self, now: Timestamp) -> usize {
        let keys: Vec<String> = self.spilled.iter().cloned().collect();
        let mut expired = 0;
        for key in &keys {
            match self.load_blob(key).await {
                Some(entry) if entry.metadata.is_expired(now) => {
                    self.expire(key).await;
                    expired += 1;
                }
                Some(_) => {}
                None => {
                    self.spilled.remove(key);
                    self.tracker.untrack(key);
                }
            }
        }
        expired
    }

    fn insert_memory(&mut self, key: &str, entry: CacheEntry) {
        self.spilled.remove(key);
        if let Some(old) = self.entries.remove(key) {
            self.resident_bytes -= old.metadata.size_estimate;
            self.strategy.on_remove(key);
        }
        self.tracker.track(key, &entry.metadata.dependencies);
        self.resident_bytes += entry.metadata.size_estimate;
        self.strategy.on_insert(key, &entry.metadata);
        self.entries.insert(key.to_string(), entry);
        self.enforce_limits(Some(key));
    }

    /// Evict until both limits hold. `keep` is never chosen as a victim.
    fn enforce_limits(&mut self, keep: Option<&str>) -> usize {
        let mut evicted = 0;
        while self.resident_bytes > self.config.max_memory_bytes
            || self.entries.len() > self.config.max_entries
        {
            let victim = self
                .strategy
                .victims(&self.entries, 2)
                .into_iter()
                .find(|k| Some(k.as_str()) != keep);
            match victim {
                Some(key) if self.evict(&key) => evicted += 1,
                _ => break,
            }
        }
        evicted
    }

    /// Drop the memory copy only.
    fn evict(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.resident_bytes -= entry.metadata.size_estimate;
        self.strategy.on_remove(key);
        if self.blobs.is_some() {
            self.spilled.insert(key.to_string());
        } else {
            self.tracker.untrack(key);
        }
        self.stats.evictions += 1;
        debug!(key = %key, size = entry.metadata.size_estimate, "Evicted cache entry");
        true
    }

    async fn expire(&mut self, key: &str) {
        if self.remove_everywhere(key).await {
            self.stats.expirations += 1;
        }
    }

    async fn remove_everywhere(&mut self, key: &str) -> bool {
        let mut removed = false;
        self.spilled.remove(key);
        if let Some(entry) = self.entries.remove(key) {
            self.resident_bytes -= entry.metadata.size_estimate;
            self.strategy.on_remove(key);
            removed = true;
        }
        let tracked = !self.tracker.untrack(key).is_empty();
        if let Some(store) = self.blobs.clone() {
            let name = blob_name(key);
            match store.delete(&name).await {
                Ok(deleted) => removed |= deleted,
                Err(source) => self.io_error(CacheIoError::Delete { name, source }),
            }
        }
        removed || tracked
    }

    async fn load_blob(&mut self, key: &str) -> Option<CacheEntry> {
        let store = self.blobs.clone()?;
        let name = blob_name(key);
        match store.get(&name).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => Some(entry),
                Err(source) => {
                    self.io_error(CacheIoError::Decode {
                        name: name.clone(),
                        source,
                    });
                    if let Err(source) = store.delete(&name).await {
                        self.io_error(CacheIoError::Delete { name, source });
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(source) => {
                self.io_error(CacheIoError::Read { name, source });
                None
            }
        }
    }

    async fn write_blob(&mut self, key: &str, entry: &CacheEntry) {
        let Some(store) = self.blobs.clone() else {
            return;
        };
        let name = blob_name(key);
        let bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.io_error(CacheIoError::Write {
                    name,
                    source: e.into(),
                });
                return;
            }
        };
        if let Err(source) = store.put(&name, &bytes).await {
            self.io_error(CacheIoError::Write { name, source });
        }
    }

    fn io_error(&mut self, err: CacheIoError) {
        self.stats.io_errors += 1;
        warn!(error = %err, "Cache blob I/O failed; treating as a miss");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blob::MemoryBlobStore;
    use crate::cache::clock::ManualClock;
    use crate::cache::entry::CacheScope;

    fn config(max_memory_bytes: usize) -> CacheConfig {
        CacheConfig {
            max_memory_bytes,
            ..CacheConfig::default()
        }
    }

    fn deps(items: &[&str]) -> SetOptions {
        SetOptions::scope(CacheScope::Rendered).with_dependencies(items.iter().copied())
    }

    #[tokio::test]
    async fn get_set_delete() {
        let mut cache = CacheEngine::new(config(1024));
        assert!(cache.get("k").await.is_none());
        assert!(cache.set("k", "hello".into(), SetOptions::default()).await);
        let entry = cache.get("k").await.unwrap();
        assert_eq!(entry.value.as_rendered(), Some("hello"));
        assert_eq!(entry.metadata.access_count, 1);
        assert_eq!(cache.resident_bytes(), 5);
        assert!(cache.delete("k").await);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.resident_bytes(), 0);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    }

    #[tokio::test]
    async fn ttl_expires_lazily_on_read() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = CacheEngine::new(config(1024)).with_clock(clock.clone());
        cache.set("k", "v".into(), SetOptions::default().with_ttl(100)).await;
        clock.advance(99);
        assert!(cache.get("k").await.is_some());
        clock.advance(1);
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn default_ttl_applies_when_unset() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = CacheEngine::new(CacheConfig {
            default_ttl_ms: Some(10),
            ..config(1024)
        })
        .with_clock(clock.clone());
        cache.set("k", "v".into(), SetOptions::default()).await;
        clock.advance(10);
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let mut cache = CacheEngine::new(config(4));
        assert!(!cache.set("k", "too long".into(), SetOptions::default()).await);
        assert_eq!(cache.stats().rejected, 1);
    }

    #[tokio::test]
    async fn set_evicts_to_stay_under_the_ceiling() {
        let mut cache = CacheEngine::new(config(10));
        cache.set("a", "aaaa".into(), SetOptions::default()).await;
        cache.set("b", "bbbb".into(), SetOptions::default()).await;
        cache.get("a").await;
        cache.set("c", "cccc".into(), SetOptions::default()).await;
        assert!(cache.resident_bytes() <= 10);
        // LRU: "b" was the least recently used.
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn dependency_invalidation_hits_only_dependents() {
        let mut cache = CacheEngine::new(config(1024));
        cache.set("child", "1".into(), deps(&["child.tpl", "base.tpl"])).await;
        cache.set("grandchild", "2".into(), deps(&["grandchild.tpl", "child.tpl", "base.tpl"])).await;
        cache.set("other", "3".into(), deps(&["other.tpl"])).await;

        assert_eq!(cache.invalidate_by_dependency("base.tpl").await, 2);
        assert!(cache.get("child").await.is_none());
        assert!(cache.get("grandchild").await.is_none());
        assert!(cache.get("other").await.is_some());
        assert_eq!(cache.invalidate_by_dependency("base.tpl").await, 0);
    }

    #[tokio::test]
    async fn pattern_invalidation() {
        let mut cache = CacheEngine::new(config(1024));
        cache.set("render:a", "1".into(), SetOptions::default()).await;
        cache.set("render:b", "2".into(), SetOptions::default()).await;
        cache.set("compiled:a", "3".into(), SetOptions::default()).await;
        let pattern = Regex::new("^render:").unwrap();
        assert_eq!(cache.invalidate_by_pattern(&pattern).await, 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evicted_entries_are_promoted_from_the_blob_tier() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let mut cache = CacheEngine::new(CacheConfig {
            max_entries: 1,
            ..config(1024)
        })
        .with_blob_store(blobs.clone());
        cache.set("a", "first".into(), deps(&["a.tpl"])).await;
        cache.set("b", "second".into(), SetOptions::default()).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(blobs.len().await, 2);

        let entry = cache.get("a").await.unwrap();
        assert_eq!(entry.value.as_rendered(), Some("first"));
        assert_eq!(cache.stats().promotions, 1);

        // Invalidation reaches the blob copy of an evicted entry too.
        cache.get("b").await;
        assert_eq!(cache.invalidate_by_dependency("a.tpl").await, 1);
        assert!(cache.get("a").await.is_none());
        assert_eq!(blobs.len().await, 1);
    }

    #[tokio::test]
    async fn corrupt_blobs_are_misses() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put(&blob_name("k"), b"not json").await.unwrap();
        let mut cache = CacheEngine::new(config(1024)).with_blob_store(blobs.clone());
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.stats().io_errors, 1);
        assert!(blobs.is_empty().await);
    }

    #[tokio::test]
    async fn gc_removes_expired_and_sheds_under_pressure() {
        let clock = Arc::new(ManualClock::new(0));
        let mut cache = CacheEngine::new(CacheConfig {
            gc_trigger_ratio: 0.5,
            gc_evict_percent: 25,
            ..config(100)
        })
        .with_clock(clock.clone());
        cache.set("old", "x".repeat(10).into(), SetOptions::default().with_ttl(5)).await;
        for i in 0..8 {
            cache.set(&format!("k{i}"), "y".repeat(10).into(), SetOptions::default()).await;
        }
        clock.advance(5);
        let report = cache.gc().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 2);
        assert_eq!(cache.resident_bytes(), 60);
        assert!(report.resident_bytes <= 100);
    }

    #[tokio::test]
    async fn gc_expires_entries_held_only_in_the_blob_tier() {
        let clock = Arc::new(ManualClock::new(0));
        let blobs = Arc::new(MemoryBlobStore::new());
        let mut cache = CacheEngine::new(CacheConfig {
            max_entries: 1,
            ..config(1024)
        })
        .with_clock(clock.clone())
        .with_blob_store(blobs.clone());
        cache.set("a", "short-lived".into(), SetOptions::default().with_ttl(10)).await;
        cache.set("b", "kept".into(), SetOptions::default()).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(blobs.len().await, 2);

        clock.advance(100);
        let report = cache.gc().await;
        assert_eq!(report.expired, 1);
        assert_eq!(blobs.len().await, 1);
        assert!(!cache.contains("a").await);
        assert!(cache.contains("b").await);
        assert_eq!(cache.stats().expirations, 1);
    }
}
