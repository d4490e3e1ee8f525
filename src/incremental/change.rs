//! Change classification.

use super::graph::DependencyGraph;
use crate::config::SchedulerConfig;
use crate::hash::{content_hash, ContentHash};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// One file-change event from the watcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub kind: ChangeKind,
    /// Hash of the new content; `None` for deletions.
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    fn with_content(path: impl Into<String>, kind: ChangeKind, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            kind,
            content_hash: Some(content_hash(content.as_bytes())),
            content: Some(content),
            timestamp: Utc::now(),
        }
    }

    pub fn added(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_content(path, ChangeKind::Added, content)
    }

    pub fn modified(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_content(path, ChangeKind::Modified, content)
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            content_hash: None,
            content: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Scheduling order; `Immediate` groups run first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Immediate,
    High,
    Normal,
    Low,
    /// Unchanged resubmissions; expected to be skipped.
    Batch,
}

impl From<ImpactLevel> for Priority {
    fn from(level: ImpactLevel) -> Self {
        match level {
            ImpactLevel::Critical => Priority::Immediate,
            ImpactLevel::High => Priority::High,
            ImpactLevel::Medium => Priority::Normal,
            ImpactLevel::Low => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Immediate => "immediate",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Batch => "batch",
        };
        f.write_str(s)
    }
}

/// Analyzer verdict for one change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeImpact {
    pub path: String,
    pub kind: ChangeKind,
    pub content_hash: Option<ContentHash>,
    /// Transitive dependents of `path`, bounded by the configured depth.
    pub dependents: BTreeSet<String>,
    /// The change touches inheritance or composition.
    pub structural: bool,
    pub impact: ImpactLevel,
    pub priority: Priority,
}

impl ChangeImpact {
    /// `{path} ∪ dependents`.
    pub fn affected(&self) -> BTreeSet<String> {
        let mut out = self.dependents.clone();
        out.insert(self.path.clone());
        out
    }
}

/// Statement openers that make a change structural.
static STRUCTURAL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{%-?\s*(extends|include|import|block)\b").ok());

/// Whether `source` contains inheritance or composition statements.
pub fn has_structural_markers(source: &str) -> bool {
    STRUCTURAL_RE.as_ref().is_some_and(|re| re.is_match(source))
}

#[derive(Clone, Debug)]
pub struct ChangeAnalyzer {
    max_depth: usize,
    high_fan_out: usize,
    critical_fan_out: usize,
}

impl Default for ChangeAnalyzer {
    fn default() -> Self {
        Self::new(&SchedulerConfig::default())
    }
}

impl ChangeAnalyzer {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_depth: config.max_dependent_depth,
            high_fan_out: config.high_fan_out,
            critical_fan_out: config.critical_fan_out,
        }
    }

    fn fan_out_level(&self, dependents: usize) -> ImpactLevel {
        if dependents == 0 {
            ImpactLevel::Low
        } else if dependents < self.high_fan_out {
            ImpactLevel::Medium
        } else if dependents < self.critical_fan_out {
            ImpactLevel::High
        } else {
            ImpactLevel::Critical
        }
    }

    pub fn analyze(&self, record: &ChangeRecord, graph: &DependencyGraph) -> ChangeImpact {
        let dependents = graph.transitive_dependents(&record.path, self.max_depth);
        let structural = match record.kind {
            ChangeKind::Added | ChangeKind::Deleted => true,
            ChangeKind::Modified => record.content.as_deref().is_some_and(has_structural_markers),
        };

        let mut impact = self.fan_out_level(dependents.len());
        if structural {
            impact = impact.max(ImpactLevel::High);
            if dependents.len() >= self.high_fan_out {
                impact = ImpactLevel::Critical;
            }
        }

        debug!(
            template = %record.path,
            kind = %record.kind,
            dependents = dependents.len(),
            structural,
            impact = ?impact,
            "Analyzed change"
        );

        ChangeImpact {
            path: record.path.clone(),
            kind: record.kind,
            content_hash: record.content_hash,
            dependents,
            structural,
            impact,
            priority: impact.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan(n: usize) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for i in 0..n {
            g.record_edge(&format!("page{i}.tpl"), "base.tpl").unwrap();
        }
        g
    }

    #[test]
    fn fan_out_thresholds() {
        let analyzer = ChangeAnalyzer::default();
        let plain = ChangeRecord::modified("base.tpl", "<p>{{ x }}</p>");
        for (n, level) in [
            (0, ImpactLevel::Low),
            (1, ImpactLevel::Medium),
            (4, ImpactLevel::Medium),
            (5, ImpactLevel::High),
            (19, ImpactLevel::High),
            (20, ImpactLevel::Critical),
        ] {
            let impact = analyzer.analyze(&plain, &fan(n));
            assert_eq!(impact.impact, level, "{n} dependents");
            assert_eq!(impact.priority, Priority::from(level));
        }
    }

    #[test]
    fn structural_changes_are_at_least_high() {
        let analyzer = ChangeAnalyzer::default();
        let g = fan(0);
        assert_eq!(
            analyzer.analyze(&ChangeRecord::added("new.tpl", "x"), &g).impact,
            ImpactLevel::High
        );
        assert_eq!(
            analyzer.analyze(&ChangeRecord::deleted("base.tpl"), &g).impact,
            ImpactLevel::High
        );
        let with_block = ChangeRecord::modified("base.tpl", "{% block body %}{% endblock %}");
        assert_eq!(analyzer.analyze(&with_block, &g).impact, ImpactLevel::High);
        assert_eq!(analyzer.analyze(&with_block, &fan(5)).impact, ImpactLevel::Critical);
    }

    #[test]
    fn affected_set_includes_the_changed_path() {
        let analyzer = ChangeAnalyzer::default();
        let impact = analyzer.analyze(&ChangeRecord::modified("base.tpl", "x"), &fan(2));
        assert_eq!(impact.affected().len(), 3);
        assert!(impact.affected().contains("base.tpl"));
    }

    #[test]
    fn markers_need_statement_syntax() {
        assert!(has_structural_markers("{%- include 'a.tpl' %}"));
        assert!(!has_structural_markers("include this text"));
        assert!(!has_structural_markers("{{ blocked }}"));
    }

    #[test]
    fn priority_orders_immediate_first() {
        let mut ps = vec![Priority::Batch, Priority::Low, Priority::Immediate, Priority::Normal];
        ps.sort();
        assert_eq!(ps, vec![Priority::Immediate, Priority::Normal, Priority::Low, Priority::Batch]);
    }
}
