//! Eviction strategies.
//!
//! A strategy observes inserts, accesses and removals, and picks victims when
//! the engine must shed entries. Expiry is checked by the engine for every
//! strategy; [`TtlStrategy`] additionally evicts the entries closest to
//! expiring first.

use super::entry::{CacheEntry, EntryMetadata};
use super::StrategyKind;
use std::collections::{BTreeMap, HashMap};

pub trait EvictionStrategy: Send {
    fn kind(&self) -> StrategyKind;

    fn on_insert(&mut self, key: &str, meta: &EntryMetadata);

    fn on_access(&mut self, key: &str, meta: &EntryMetadata);

    fn on_remove(&mut self, key: &str);

    /// Up to `count` keys to evict, first victim first.
    fn victims(&mut self, entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String>;
}

pub fn strategy_for(kind: StrategyKind, adaptive_lfu_threshold: f64) -> Box<dyn EvictionStrategy> {
    match kind {
        StrategyKind::Lru => Box::new(LruStrategy::default()),
        StrategyKind::Lfu => Box::new(LfuStrategy::default()),
        StrategyKind::Fifo => Box::new(FifoStrategy::default()),
        StrategyKind::Ttl => Box::new(TtlStrategy::default()),
        StrategyKind::Adaptive => Box::new(AdaptiveStrategy::new(adaptive_lfu_threshold)),
    }
}

/// Keys ordered by a monotonically increasing tick.
#[derive(Debug, Default)]
struct TickOrder {
    tick: u64,
    by_tick: BTreeMap<u64, String>,
    ticks: HashMap<String, u64>,
}

impl TickOrder {
    /// Move `key` to the back.
    fn touch(&mut self, key: &str) {
        self.remove(key);
        self.tick += 1;
        self.by_tick.insert(self.tick, key.to_string());
        self.ticks.insert(key.to_string(), self.tick);
    }

    fn remove(&mut self, key: &str) {
        if let Some(tick) = self.ticks.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    fn front(&self, count: usize) -> Vec<String> {
        self.by_tick.values().take(count).cloned().collect()
    }

    fn position(&self, key: &str) -> u64 {
        self.ticks.get(key).copied().unwrap_or(0)
    }
}

/// Least recently used: accesses move a key to the back.
#[derive(Debug, Default)]
pub struct LruStrategy {
    order: TickOrder,
}

impl EvictionStrategy for LruStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lru
    }

    fn on_insert(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
    }

    fn on_access(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
    }

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn victims(&mut self, _entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String> {
        self.order.front(count)
    }
}

/// First in, first out: accesses do not reorder.
#[derive(Debug, Default)]
pub struct FifoStrategy {
    order: TickOrder,
}

impl EvictionStrategy for FifoStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fifo
    }

    fn on_insert(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
    }

    fn on_access(&mut self, _key: &str, _meta: &EntryMetadata) {}

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn victims(&mut self, _entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String> {
        self.order.front(count)
    }
}

/// Least frequently used; ties go to the least recently inserted.
#[derive(Debug, Default)]
pub struct LfuStrategy {
    order: TickOrder,
}

impl EvictionStrategy for LfuStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lfu
    }

    fn on_insert(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
    }

    fn on_access(&mut self, _key: &str, _meta: &EntryMetadata) {}

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn victims(&mut self, entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String> {
        let mut keys: Vec<(&String, u64, u64)> = entries
            .iter()
            .map(|(k, e)| (k, e.metadata.access_count, self.order.position(k)))
            .collect();
        keys.sort_by_key(|(_, hits, pos)| (*hits, *pos));
        keys.into_iter().take(count).map(|(k, _, _)| k.clone()).collect()
    }
}

/// Soonest expiry first; entries without a TTL go last, oldest first.
#[derive(Debug, Default)]
pub struct TtlStrategy {
    order: TickOrder,
}

impl EvictionStrategy for TtlStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Ttl
    }

    fn on_insert(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
    }

    fn on_access(&mut self, _key: &str, _meta: &EntryMetadata) {}

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn victims(&mut self, entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String> {
        let mut keys: Vec<(&String, i64, u64)> = entries
            .iter()
            .map(|(k, e)| {
                let expires = e.metadata.expires_at().unwrap_or(i64::MAX);
                (k, expires, self.order.position(k))
            })
            .collect();
        keys.sort_by_key(|(_, expires, pos)| (*expires, *pos));
        keys.into_iter().take(count).map(|(k, _, _)| k.clone()).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdaptiveMode {
    Recency,
    Frequency,
}

/// Tracks hits per key and orders by frequency once the average hit count
/// exceeds `lfu_threshold`, by recency otherwise.
#[derive(Debug)]
pub struct AdaptiveStrategy {
    lfu_threshold: f64,
    order: TickOrder,
    hits: HashMap<String, u64>,
    total_hits: u64,
}

impl AdaptiveStrategy {
    pub fn new(lfu_threshold: f64) -> Self {
        Self {
            lfu_threshold,
            order: TickOrder::default(),
            hits: HashMap::new(),
            total_hits: 0,
        }
    }

    pub fn average_hits(&self) -> f64 {
        if self.hits.is_empty() {
            0.0
        } else {
            self.total_hits as f64 / self.hits.len() as f64
        }
    }

    pub fn mode(&self) -> AdaptiveMode {
        if self.average_hits() > self.lfu_threshold {
            AdaptiveMode::Frequency
        } else {
            AdaptiveMode::Recency
        }
    }
}

impl EvictionStrategy for AdaptiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn on_insert(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
        if let Some(old) = self.hits.insert(key.to_string(), 0) {
            self.total_hits -= old;
        }
    }

    fn on_access(&mut self, key: &str, _meta: &EntryMetadata) {
        self.order.touch(key);
        *self.hits.entry(key.to_string()).or_insert(0) += 1;
        self.total_hits += 1;
    }

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
        if let Some(old) = self.hits.remove(key) {
            self.total_hits -= old;
        }
    }

    fn victims(&mut self, _entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String> {
        match self.mode() {
            AdaptiveMode::Recency => self.order.front(count),
            AdaptiveMode::Frequency => {
                let mut keys: Vec<(&String, u64, u64)> = self
                    .hits
                    .iter()
                    .map(|(k, h)| (k, *h, self.order.position(k)))
                    .collect();
                keys.sort_by_key(|(_, hits, pos)| (*hits, *pos));
                keys.into_iter().take(count).map(|(k, _, _)| k.clone()).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheScope, CachedValue};
    use std::collections::BTreeSet;

    fn meta(created_at: i64, ttl_ms: Option<u64>, access_count: u64) -> EntryMetadata {
        EntryMetadata {
            created_at,
            ttl_ms,
            access_count,
            last_access: created_at,
            size_estimate: 1,
            dependencies: BTreeSet::new(),
            scope: CacheScope::Rendered,
        }
    }

    fn entries(items: &[(&str, EntryMetadata)]) -> HashMap<String, CacheEntry> {
        items
            .iter()
            .map(|(k, m)| {
                (
                    k.to_string(),
                    CacheEntry {
                        value: CachedValue::from("v"),
                        metadata: m.clone(),
                    },
                )
            })
            .collect()
    }

    fn insert_all(s: &mut dyn EvictionStrategy, items: &[(&str, EntryMetadata)]) {
        for (k, m) in items {
            s.on_insert(k, m);
        }
    }

    #[test]
    fn lru_reorders_on_access() {
        let items = [("a", meta(0, None, 0)), ("b", meta(0, None, 0)), ("c", meta(0, None, 0))];
        let mut s = LruStrategy::default();
        insert_all(&mut s, &items);
        s.on_access("a", &items[0].1);
        assert_eq!(s.victims(&entries(&items), 2), vec!["b", "c"]);
    }

    #[test]
    fn fifo_ignores_access() {
        let items = [("a", meta(0, None, 0)), ("b", meta(0, None, 0))];
        let mut s = FifoStrategy::default();
        insert_all(&mut s, &items);
        s.on_access("a", &items[0].1);
        assert_eq!(s.victims(&entries(&items), 1), vec!["a"]);
        s.on_remove("a");
        assert_eq!(s.victims(&entries(&items[1..]), 1), vec!["b"]);
    }

    #[test]
    fn lfu_evicts_lowest_count() {
        let items = [("a", meta(0, None, 5)), ("b", meta(0, None, 1)), ("c", meta(0, None, 1))];
        let mut s = LfuStrategy::default();
        insert_all(&mut s, &items);
        assert_eq!(s.victims(&entries(&items), 2), vec!["b", "c"]);
    }

    #[test]
    fn ttl_evicts_soonest_expiry_first() {
        let items = [
            ("forever", meta(0, None, 0)),
            ("late", meta(0, Some(1_000), 0)),
            ("soon", meta(0, Some(10), 0)),
        ];
        let mut s = TtlStrategy::default();
        insert_all(&mut s, &items);
        assert_eq!(s.victims(&entries(&items), 3), vec!["soon", "late", "forever"]);
    }

    #[test]
    fn adaptive_switches_to_frequency() {
        let items = [("a", meta(0, None, 0)), ("b", meta(0, None, 0))];
        let mut s = AdaptiveStrategy::new(2.0);
        insert_all(&mut s, &items);
        s.on_access("b", &items[1].1);
        assert_eq!(s.mode(), AdaptiveMode::Recency);
        // Recency: "a" is the oldest.
        assert_eq!(s.victims(&entries(&items), 1), vec!["a"]);

        for _ in 0..5 {
            s.on_access("a", &items[0].1);
        }
        assert_eq!(s.mode(), AdaptiveMode::Frequency);
        // Frequency: "b" has one hit against five.
        assert_eq!(s.victims(&entries(&items), 1), vec!["b"]);

        s.on_remove("a");
        assert!((s.average_hits() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn factory_builds_each_kind() {
        for kind in [
            StrategyKind::Lru,
            StrategyKind::Lfu,
            StrategyKind::Fifo,
            StrategyKind::Ttl,
            StrategyKind::Adaptive,
        ] {
            assert_eq!(strategy_for(kind, 3.0).kind(), kind);
        }
    }
}
