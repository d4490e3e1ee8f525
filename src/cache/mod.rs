//! Memoization cache for compiled templates and rendered output.

mod actor;
mod blob;
mod clock;
mod engine;
mod entry;
mod strategy;
mod tracker;

pub use actor::{spawn_gc, CacheHandle};
pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{CacheEngine, CacheStats, GcReport};
pub use entry::{CacheEntry, CacheScope, CachedValue, EntryMetadata, SetOptions};
pub use strategy::{
    strategy_for, AdaptiveMode, AdaptiveStrategy, EvictionStrategy, FifoStrategy, LfuStrategy,
    LruStrategy, TtlStrategy,
};
pub use tracker::DependencyTracker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Lru,
    Lfu,
    Fifo,
    Ttl,
    Adaptive,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Lru => "lru",
            StrategyKind::Lfu => "lfu",
            StrategyKind::Fifo => "fifo",
            StrategyKind::Ttl => "ttl",
            StrategyKind::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(StrategyKind::Lru),
            "lfu" => Ok(StrategyKind::Lfu),
            "fifo" => Ok(StrategyKind::Fifo),
            "ttl" => Ok(StrategyKind::Ttl),
            "adaptive" => Ok(StrategyKind::Adaptive),
            other => Err(format!("unknown cache strategy '{other}'")),
        }
    }
}
