//! Engine notifications.
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Publishing never
//! blocks and never fails: with no subscribers the event is dropped, and a
//! slow subscriber sees `RecvError::Lagged` rather than stalling the engine.

use crate::incremental::{ImpactLevel, Priority};
use crate::types::OptimizationLevel;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TemplateCompiled {
        path: String,
        cache_key: String,
        level: OptimizationLevel,
        instructions: usize,
        /// Served from the cache rather than compiled.
        cached: bool,
    },
    CompileFailed {
        path: String,
        error: String,
    },
    CacheInvalidated {
        dependency: String,
        entries: usize,
    },
    ChangeScheduled {
        path: String,
        impact: ImpactLevel,
        priority: Priority,
        affected: usize,
    },
    JobSkipped {
        path: String,
    },
    BatchCompleted {
        batch_id: Uuid,
        compiled: usize,
        skipped: usize,
        failed: usize,
        cancelled: usize,
    },
    TemplatePromoted {
        path: String,
        cache_key: String,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::JobSkipped { path: "dropped.tpl".into() });

        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::JobSkipped { path: "a.tpl".into() });
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::JobSkipped { path: "a.tpl".into() }
        );
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(EngineEvent::CacheInvalidated {
            dependency: "base.tpl".into(),
            entries: 3,
        })
        .unwrap();
        assert_eq!(json["event"], "cache_invalidated");
        assert_eq!(json["entries"], 3);
    }
}
