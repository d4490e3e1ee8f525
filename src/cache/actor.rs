//! Single-owner cache task.
//!
//! The [`CacheEngine`] lives inside one tokio task; every caller talks to it
//! through a cloneable [`CacheHandle`] that sends a request over `mpsc` and
//! awaits the reply on a `oneshot`. All mutations, including counter updates
//! on reads, are therefore serialized.

use super::engine::{CacheEngine, CacheStats, GcReport};
use super::entry::{CacheEntry, CachedValue, SetOptions};
use crate::cancel::CancelToken;
use regex::Regex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_BUFFER: usize = 256;

enum Request {
    Get {
        key: String,
        reply: oneshot::Sender<Option<CacheEntry>>,
    },
    Contains {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Set {
        key: String,
        value: CachedValue,
        opts: SetOptions,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    InvalidateDependency {
        dependency: String,
        reply: oneshot::Sender<usize>,
    },
    InvalidatePattern {
        pattern: Regex,
        reply: oneshot::Sender<usize>,
    },
    Gc {
        reply: oneshot::Sender<GcReport>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
}

#[derive(Clone, Debug)]
pub struct CacheHandle {
    tx: mpsc::Sender<Request>,
}

impl CacheHandle {
    /// Move `engine` into its own task.
    pub fn spawn(engine: CacheEngine) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let task = tokio::spawn(run(engine, rx));
        (Self { tx }, task)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(build(reply)).await.is_err() {
            warn!("Cache task has stopped; request dropped");
            return None;
        }
        rx.await.ok()
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let key = key.to_string();
        self.request(|reply| Request::Get { key, reply })
            .await
            .flatten()
    }

    pub async fn contains(&self, key: &str) -> bool {
        let key = key.to_string();
        self.request(|reply| Request::Contains { key, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn set(&self, key: &str, value: CachedValue, opts: SetOptions) -> bool {
        let key = key.to_string();
        self.request(|reply| Request::Set {
            key,
            value,
            opts,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn delete(&self, key: &str) -> bool {
        let key = key.to_string();
        self.request(|reply| Request::Delete { key, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn invalidate_by_dependency(&self, dependency: &str) -> usize {
        let dependency = dependency.to_string();
        self.request(|reply| Request::InvalidateDependency { dependency, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
        let pattern = pattern.clone();
        self.request(|reply| Request::InvalidatePattern { pattern, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn gc(&self) -> GcReport {
        self.request(|reply| Request::Gc { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> CacheStats {
        self.request(|reply| Request::Stats { reply })
            .await
            .unwrap_or_default()
    }
}

async fn run(mut engine: CacheEngine, mut rx: mpsc::Receiver<Request>) {
    debug!(strategy = %engine.strategy(), "Cache task started");
    while let Some(request) = rx.recv().await {
        // A dropped reply receiver means the caller gave up; nothing to do.
        match request {
            Request::Get { key, reply } => {
                let _ = reply.send(engine.get(&key).await);
            }
            Request::Contains { key, reply } => {
                let _ = reply.send(engine.contains(&key).await);
            }
            Request::Set {
                key,
                value,
                opts,
                reply,
            } => {
                let _ = reply.send(engine.set(&key, value, opts).await);
            }
            Request::Delete { key, reply } => {
                let _ = reply.send(engine.delete(&key).await);
            }
            Request::InvalidateDependency { dependency, reply } => {
                let _ = reply.send(engine.invalidate_by_dependency(&dependency).await);
            }
            Request::InvalidatePattern { pattern, reply } => {
                let _ = reply.send(engine.invalidate_by_pattern(&pattern).await);
            }
            Request::Gc { reply } => {
                let _ = reply.send(engine.gc().await);
            }
            Request::Stats { reply } => {
                let _ = reply.send(engine.stats());
            }
        }
    }
    debug!("Cache task stopped");
}

/// Run a GC sweep every `interval` until `shutdown` is cancelled.
pub fn spawn_gc(handle: CacheHandle, interval: Duration, shutdown: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(interval_ms = interval.as_millis() as u64, "Cache GC started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    handle.gc().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Cache GC stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::engine::CacheEngine;
    use crate::config::CacheConfig;

    #[tokio::test]
    async fn handle_round_trips_requests() {
        let (cache, _task) = CacheHandle::spawn(CacheEngine::new(CacheConfig::default()));
        assert!(cache.set("k", "v".into(), SetOptions::default().with_dependencies(["a.tpl"])).await);
        assert!(cache.contains("k").await);
        assert_eq!(cache.get("k").await.unwrap().value.as_rendered(), Some("v"));
        assert_eq!(cache.invalidate_by_dependency("a.tpl").await, 1);
        assert!(cache.get("k").await.is_none());
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.invalidations), (1, 1, 1));
    }

    #[tokio::test]
    async fn concurrent_readers_do_not_lose_counts() {
        let (cache, _task) = CacheHandle::spawn(CacheEngine::new(CacheConfig::default()));
        cache.set("k", "v".into(), SetOptions::default()).await;
        let readers: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("k").await })
            })
            .collect();
        for r in futures::future::join_all(readers).await {
            assert!(r.unwrap().is_some());
        }
        assert_eq!(cache.get("k").await.unwrap().metadata.access_count, 33);
    }

    #[tokio::test]
    async fn stopped_task_degrades_to_misses() {
        let (cache, task) = CacheHandle::spawn(CacheEngine::new(CacheConfig::default()));
        task.abort();
        let _ = task.await;
        assert!(cache.get("k").await.is_none());
        assert!(!cache.set("k", "v".into(), SetOptions::default()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_task_sweeps_until_shutdown() {
        let (cache, _task) = CacheHandle::spawn(CacheEngine::new(CacheConfig::default()));
        let shutdown = CancelToken::new();
        let gc = spawn_gc(cache.clone(), Duration::from_secs(60), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(61)).await;
        shutdown.cancel();
        gc.await.unwrap();
    }
}
