//! Priority-grouped, bounded-concurrency recompilation.
//!
//! A batch of analyzed changes becomes one job per affected template. Jobs
//! are grouped by priority and the groups run one after another, highest
//! first. Inside a group a semaphore bounds how many jobs run at once;
//! permits are handed out in dispatch order.

use super::change::{ChangeImpact, ChangeKind, Priority};
use super::state::{SchedulerState, SchedulerStats};
use crate::cancel::CancelToken;
use crate::config::SchedulerConfig;
use crate::error::SchedulingError;
use crate::hash::ContentHash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Compile,
    Remove,
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    pub path: String,
    pub kind: JobKind,
    pub priority: Priority,
    /// Hash of the submitted content, when this path itself changed.
    pub content_hash: Option<ContentHash>,
    /// A dependency of this template changed in the same batch.
    pub invalidated: bool,
    pub cancel: CancelToken,
}

/// What a successful compile produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobOutput {
    pub content_hash: ContentHash,
    pub output_hash: ContentHash,
}

/// Performs the work behind a job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Whether the compiled artifact for `path` is still available.
    async fn artifact_exists(&self, path: &str) -> bool;

    /// Compile (returning the output) or remove (returning `None`).
    async fn run(&self, job: &Job) -> Result<Option<JobOutput>, String>;

    /// Order jobs within a priority group. Defaults to the given order.
    async fn dispatch_order(&self, paths: Vec<String>) -> Vec<String> {
        paths
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Compiled,
    Removed,
    Skipped,
    Failed(SchedulingError),
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub path: String,
    pub priority: Priority,
    /// Position in which the job acquired its permit, batch-wide.
    pub dispatch_seq: usize,
    pub outcome: JobOutcome,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Ordered by `dispatch_seq`.
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    fn count(&self, pred: impl Fn(&JobOutcome) -> bool) -> usize {
        self.jobs.iter().filter(|j| pred(&j.outcome)).count()
    }

    pub fn compiled(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Compiled))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Cancelled))
    }

    pub fn job(&self, path: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.path == path)
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

#[derive(Default)]
struct Planned {
    kind: Option<JobKind>,
    content_hash: Option<ContentHash>,
    invalidated: bool,
    priority: Option<Priority>,
}

impl Planned {
    fn raise(&mut self, priority: Priority) {
        self.priority = Some(self.priority.map_or(priority, |p| p.min(priority)));
    }
}

type InFlight = Arc<StdMutex<HashMap<String, (Uuid, CancelToken)>>>;

pub struct Scheduler {
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
    inflight: InFlight,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_state(config, SchedulerState::default())
    }

    pub fn with_state(config: SchedulerConfig, state: SchedulerState) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            inflight: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Build a scheduler from the configured state file.
    pub async fn load(config: SchedulerConfig) -> anyhow::Result<Self> {
        let state = SchedulerState::load(&config.state_file).await?;
        Ok(Self::with_state(config, state))
    }

    pub async fn save_state(&self, path: &Path) -> anyhow::Result<()> {
        self.state.lock().await.save(path).await
    }

    pub async fn state(&self) -> SchedulerState {
        self.state.lock().await.clone()
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.state.lock().await.stats.clone()
    }

    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Uuid, CancelToken)>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel the in-flight job for `path`, if any.
    pub fn cancel(&self, path: &str) -> bool {
        match self.inflight().remove(path) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.inflight().drain() {
            token.cancel();
        }
    }

    /// Register a fresh token for `path`, cancelling any job it supersedes.
    fn claim(&self, path: &str, id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        if let Some((old, previous)) = self.inflight().insert(path.to_string(), (id, token.clone())) {
            debug!(template = %path, superseded = %old, "Cancelling superseded job");
            previous.cancel();
        }
        token
    }

    async fn plan(&self, changes: &[ChangeImpact]) -> BTreeMap<String, Planned> {
        let mut planned: BTreeMap<String, Planned> = BTreeMap::new();
        for change in changes {
            let entry = planned.entry(change.path.clone()).or_default();
            entry.kind = Some(match change.kind {
                ChangeKind::Deleted => JobKind::Remove,
                ChangeKind::Added | ChangeKind::Modified => JobKind::Compile,
            });
            entry.content_hash = change.content_hash;
            entry.raise(change.priority);
            for dependent in &change.dependents {
                let entry = planned.entry(dependent.clone()).or_default();
                entry.invalidated = true;
                entry.raise(change.priority);
            }
        }

        let state = self.state.lock().await;
        for (path, p) in planned.iter_mut() {
            let unchanged = !p.invalidated
                && p.kind == Some(JobKind::Compile)
                && p.content_hash.is_some_and(|h| state.is_current(path, &h));
            if unchanged {
                p.priority = Some(Priority::Batch);
            }
        }
        planned
    }

    /// Run every job implied by `changes`. Individual failures are reported
    /// per job and never abort the batch.
    pub async fn run_batch(&self, changes: Vec<ChangeImpact>, runner: Arc<dyn JobRunner>) -> BatchReport {
        let batch_id = Uuid::now_v7();
        let started_at = Utc::now();
        let started = Instant::now();
        let planned = self.plan(&changes).await;

        let mut groups: BTreeMap<Priority, Vec<Job>> = BTreeMap::new();
        for (path, p) in planned {
            let id = Uuid::now_v7();
            let priority = p.priority.unwrap_or(Priority::Normal);
            let job = Job {
                id,
                cancel: self.claim(&path, id),
                path,
                kind: p.kind.unwrap_or(JobKind::Compile),
                priority,
                content_hash: p.content_hash,
                invalidated: p.invalidated,
            };
            groups.entry(priority).or_default().push(job);
        }

        info!(
            batch = %batch_id,
            changes = changes.len(),
            jobs = groups.values().map(Vec::len).sum::<usize>(),
            groups = groups.len(),
            "Scheduling batch"
        );

        let limit = if self.config.parallel {
            self.config.concurrency_limit.max(1)
        } else {
            1
        };
        let mut reports = Vec::new();
        let mut seq = 0usize;

        for (priority, jobs) in groups {
            let order = runner
                .dispatch_order(jobs.iter().map(|j| j.path.clone()).collect())
                .await;
            let mut by_path: HashMap<String, Job> =
                jobs.into_iter().map(|j| (j.path.clone(), j)).collect();
            let mut ordered: Vec<Job> = order.iter().filter_map(|p| by_path.remove(p)).collect();
            let mut rest: Vec<Job> = by_path.into_values().collect();
            rest.sort_by(|a, b| a.path.cmp(&b.path));
            ordered.extend(rest);

            debug!(batch = %batch_id, priority = %priority, jobs = ordered.len(), "Dispatching group");
            let semaphore = Arc::new(Semaphore::new(limit));
            let mut handles = Vec::with_capacity(ordered.len());
            for job in ordered {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let meta = (job.id, job.path.clone(), job.priority, seq);
                let task = tokio::spawn(execute(
                    job,
                    runner.clone(),
                    self.state.clone(),
                    self.inflight.clone(),
                    permit,
                ));
                handles.push((meta, task));
                seq += 1;
            }
            for ((job_id, path, priority, dispatch_seq), task) in handles {
                let (outcome, elapsed_ms) = match task.await {
                    Ok(done) => done,
                    Err(e) => {
                        warn!(template = %path, error = %e, "Job task aborted");
                        let failure = SchedulingError::JobFailed {
                            path: path.clone(),
                            message: e.to_string(),
                        };
                        self.state.lock().await.forget(&path);
                        (JobOutcome::Failed(failure), 0)
                    }
                };
                reports.push(JobReport {
                    job_id,
                    path,
                    priority,
                    dispatch_seq,
                    outcome,
                    elapsed_ms,
                });
            }
        }

        let report = BatchReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            jobs: reports,
        };

        let mut state = self.state.lock().await;
        let stats = &mut state.stats;
        stats.batches += 1;
        stats.processed += (report.compiled() + report.count(|o| matches!(o, JobOutcome::Removed))) as u64;
        stats.skipped += report.skipped() as u64;
        stats.failed += report.failed() as u64;
        stats.cancelled += report.cancelled() as u64;
        stats.last_batch_ms = started.elapsed().as_millis() as u64;

        info!(
            batch = %batch_id,
            compiled = report.compiled(),
            skipped = report.skipped(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            elapsed_ms = stats.last_batch_ms,
            "Batch complete"
        );
        report
    }
}

async fn execute(
    job: Job,
    runner: Arc<dyn JobRunner>,
    state: Arc<Mutex<SchedulerState>>,
    inflight: InFlight,
    permit: OwnedSemaphorePermit,
) -> (JobOutcome, u64) {
    let started = Instant::now();
    let outcome = run_job(&job, runner.as_ref(), &state).await;
    drop(permit);

    {
        let mut inflight = inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inflight.get(&job.path).is_some_and(|(id, _)| *id == job.id) {
            inflight.remove(&job.path);
        }
    }
    (outcome, started.elapsed().as_millis() as u64)
}

async fn run_job(job: &Job, runner: &dyn JobRunner, state: &Mutex<SchedulerState>) -> JobOutcome {
    if job.cancel.is_cancelled() {
        return JobOutcome::Cancelled;
    }

    if job.kind == JobKind::Compile && !job.invalidated {
        if let Some(hash) = job.content_hash {
            let current = state.lock().await.is_current(&job.path, &hash);
            if current && runner.artifact_exists(&job.path).await {
                debug!(template = %job.path, "Unchanged; skipping");
                return JobOutcome::Skipped;
            }
        }
    }

    let result = tokio::select! {
        result = runner.run(job) => result,
        _ = job.cancel.cancelled() => {
            debug!(template = %job.path, job = %job.id, "Job cancelled");
            return JobOutcome::Cancelled;
        }
    };

    let mut state = state.lock().await;
    match result {
        Ok(Some(output)) => {
            state.record_output(&job.path, output.content_hash, output.output_hash);
            JobOutcome::Compiled
        }
        Ok(None) => {
            state.forget(&job.path);
            JobOutcome::Removed
        }
        Err(message) => {
            warn!(template = %job.path, error = %message, "Job failed");
            state.forget(&job.path);
            JobOutcome::Failed(SchedulingError::JobFailed {
                path: job.path.clone(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use crate::incremental::change::ImpactLevel;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MockRunner {
        calls: StdMutex<Vec<String>>,
        artifacts: StdMutex<BTreeSet<String>>,
        fail: BTreeSet<String>,
        slow: BTreeSet<String>,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobRunner for MockRunner {
        async fn artifact_exists(&self, path: &str) -> bool {
            self.artifacts.lock().unwrap().contains(path)
        }

        async fn run(&self, job: &Job) -> Result<Option<JobOutput>, String> {
            self.calls.lock().unwrap().push(job.path.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if self.slow.contains(&job.path) {
                Duration::from_secs(3600)
            } else {
                self.delay
            };
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail.contains(&job.path) {
                return Err(format!("cannot compile {}", job.path));
            }
            if job.kind == JobKind::Remove {
                self.artifacts.lock().unwrap().remove(&job.path);
                return Ok(None);
            }
            self.artifacts.lock().unwrap().insert(job.path.clone());
            Ok(Some(JobOutput {
                content_hash: job.content_hash.unwrap_or_else(|| content_hash(job.path.as_bytes())),
                output_hash: content_hash(b"bytecode"),
            }))
        }
    }

    fn change(path: &str, content: &str, impact: ImpactLevel, dependents: &[&str]) -> ChangeImpact {
        ChangeImpact {
            path: path.to_string(),
            kind: ChangeKind::Modified,
            content_hash: Some(content_hash(content.as_bytes())),
            dependents: dependents.iter().map(|s| s.to_string()).collect(),
            structural: false,
            impact,
            priority: impact.into(),
        }
    }

    #[tokio::test]
    async fn critical_changes_dispatch_before_low() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner::default());
        let report = scheduler
            .run_batch(
                vec![
                    change("low.tpl", "l", ImpactLevel::Low, &[]),
                    change("hot.tpl", "h", ImpactLevel::Critical, &[]),
                ],
                runner.clone(),
            )
            .await;
        let hot = report.job("hot.tpl").unwrap();
        let low = report.job("low.tpl").unwrap();
        assert_eq!(hot.priority, Priority::Immediate);
        assert!(hot.dispatch_seq < low.dispatch_seq);
        assert_eq!(runner.calls(), vec!["hot.tpl", "low.tpl"]);
    }

    #[tokio::test]
    async fn unchanged_resubmission_is_skipped() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner::default());
        let c = change("a.tpl", "same", ImpactLevel::Low, &[]);

        let first = scheduler.run_batch(vec![c.clone()], runner.clone()).await;
        assert_eq!(first.compiled(), 1);
        let second = scheduler.run_batch(vec![c], runner.clone()).await;
        assert_eq!(second.skipped(), 1);
        assert_eq!(second.job("a.tpl").unwrap().priority, Priority::Batch);
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(scheduler.stats().await.skipped, 1);
    }

    #[tokio::test]
    async fn missing_artifact_defeats_the_skip() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner::default());
        let c = change("a.tpl", "same", ImpactLevel::Low, &[]);
        scheduler.run_batch(vec![c.clone()], runner.clone()).await;
        runner.artifacts.lock().unwrap().clear();
        let report = scheduler.run_batch(vec![c], runner.clone()).await;
        assert_eq!(report.compiled(), 1);
    }

    #[tokio::test]
    async fn dependency_changes_defeat_the_skip() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner::default());
        let page = change("page.tpl", "p", ImpactLevel::Low, &[]);
        scheduler.run_batch(vec![page.clone()], runner.clone()).await;

        let base = change("base.tpl", "b2", ImpactLevel::Medium, &["page.tpl"]);
        let report = scheduler.run_batch(vec![page, base], runner.clone()).await;
        assert_eq!(report.skipped(), 0);
        assert_eq!(report.compiled(), 2);
        assert_eq!(report.job("page.tpl").unwrap().priority, Priority::Normal);
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner {
            fail: ["bad.tpl".to_string()].into(),
            ..Default::default()
        });
        let report = scheduler
            .run_batch(
                vec![
                    change("bad.tpl", "x", ImpactLevel::Low, &[]),
                    change("good.tpl", "y", ImpactLevel::Low, &["user.tpl"]),
                ],
                runner.clone(),
            )
            .await;
        assert_eq!(report.failed(), 1);
        assert_eq!(report.compiled(), 2);
        assert!(!report.is_clean());
        assert!(matches!(
            &report.job("bad.tpl").unwrap().outcome,
            JobOutcome::Failed(SchedulingError::JobFailed { path, .. }) if path == "bad.tpl"
        ));
        let state = scheduler.state().await;
        assert!(!state.content_hashes.contains_key("bad.tpl"));
        assert!(state.content_hashes.contains_key("good.tpl"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let config = SchedulerConfig {
            concurrency_limit: 2,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config);
        let runner = Arc::new(MockRunner {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let changes = (0..6)
            .map(|i| change(&format!("t{i}.tpl"), "x", ImpactLevel::Low, &[]))
            .collect();
        let report = scheduler.run_batch(changes, runner.clone()).await;
        assert_eq!(report.compiled(), 6);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_mode_runs_one_at_a_time() {
        let config = SchedulerConfig {
            parallel: false,
            ..Default::default()
        };
        let scheduler = Scheduler::new(config);
        let runner = Arc::new(MockRunner {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let changes = (0..4)
            .map(|i| change(&format!("t{i}.tpl"), "x", ImpactLevel::Low, &[]))
            .collect();
        scheduler.run_batch(changes, runner.clone()).await;
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(runner.calls(), vec!["t0.tpl", "t1.tpl", "t2.tpl", "t3.tpl"]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseding_change_cancels_stale_job() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner {
            slow: ["a.tpl".to_string()].into(),
            ..Default::default()
        });
        let stale = scheduler.run_batch(vec![change("a.tpl", "v1", ImpactLevel::Low, &[])], runner.clone());
        let fresh = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            scheduler.cancel("a.tpl")
        };
        let (stale, cancelled) = tokio::join!(stale, fresh);
        assert!(cancelled);
        assert_eq!(stale.cancelled(), 1);
        assert_eq!(scheduler.stats().await.cancelled, 1);
        assert!(!scheduler.state().await.content_hashes.contains_key("a.tpl"));
    }

    #[tokio::test]
    async fn claiming_a_path_cancels_the_previous_token() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let first = scheduler.claim("a.tpl", Uuid::now_v7());
        let second = scheduler.claim("a.tpl", Uuid::now_v7());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn deletions_become_removals() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let runner = Arc::new(MockRunner::default());
        scheduler
            .run_batch(vec![change("a.tpl", "x", ImpactLevel::Low, &[])], runner.clone())
            .await;
        let mut gone = change("a.tpl", "", ImpactLevel::High, &[]);
        gone.kind = ChangeKind::Deleted;
        gone.content_hash = None;
        let report = scheduler.run_batch(vec![gone], runner.clone()).await;
        assert_eq!(report.job("a.tpl").unwrap().outcome, JobOutcome::Removed);
        assert!(scheduler.state().await.content_hashes.is_empty());
    }
}
