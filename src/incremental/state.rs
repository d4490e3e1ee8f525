//! Persisted scheduler state.
//!
//! A single JSON document read on startup and written on checkpoint or
//! shutdown. Unknown fields are ignored so older binaries can read state
//! written by newer ones.

use crate::hash::ContentHash;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Lifetime counters for the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerStats {
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub batches: u64,
    pub last_batch_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    /// Content hash of each template as of its last successful job.
    pub content_hashes: BTreeMap<String, ContentHash>,
    /// Fingerprint of the bytecode that job produced.
    pub output_hashes: BTreeMap<String, ContentHash>,
    pub stats: SchedulerStats,
    pub saved_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    /// Whether `path` was last processed with exactly `hash`.
    pub fn is_current(&self, path: &str, hash: &ContentHash) -> bool {
        self.content_hashes.get(path) == Some(hash)
    }

    pub fn record_output(&mut self, path: &str, content: ContentHash, output: ContentHash) {
        self.content_hashes.insert(path.to_string(), content);
        self.output_hashes.insert(path.to_string(), output);
    }

    pub fn forget(&mut self, path: &str) {
        self.content_hashes.remove(path);
        self.output_hashes.remove(path);
    }

    /// Read state from `path`. A missing file yields empty state.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No scheduler state; starting empty");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        let state: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing scheduler state {}", path.display()))?;
        info!(
            path = %path.display(),
            templates = state.content_hashes.len(),
            "Loaded scheduler state"
        );
        Ok(state)
    }

    /// Write state to `path` through a sibling temp file and rename.
    pub async fn save(&mut self, path: &Path) -> Result<()> {
        self.saved_at = Some(Utc::now());
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing scheduler state")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "Saved scheduler state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;

    #[tokio::test]
    async fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = SchedulerState::load(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(state, SchedulerState::default());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        let mut state = SchedulerState::default();
        state.record_output("a.tpl", content_hash(b"a"), content_hash(b"out"));
        state.stats.skipped = 3;
        state.save(&path).await.unwrap();

        let loaded = SchedulerState::load(&path).await.unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.saved_at.is_some());
        assert!(loaded.is_current("a.tpl", &content_hash(b"a")));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let hash = content_hash(b"x").to_hex();
        let doc = format!(
            r#"{{"content_hashes": {{"x.tpl": "{hash}"}}, "stats": {{"skipped": 2, "future": 1}}, "schema": 9}}"#
        );
        std::fs::write(&path, doc).unwrap();
        let state = SchedulerState::load(&path).await.unwrap();
        assert_eq!(state.stats.skipped, 2);
        assert!(state.output_hashes.is_empty());
        assert!(state.is_current("x.tpl", &content_hash(b"x")));
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SchedulerState::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("parsing scheduler state"));
    }
}
