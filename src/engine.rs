//! The engine: one owner for every piece of compile, cache and scheduling
//! state.
//!
//! Construct it once per process (inside a tokio runtime) and share it by
//! reference. Template sources live in an in-memory registry; the dependency
//! graph is rebuilt edge by edge as templates register, and change batches
//! from a file watcher flow through [`Engine::apply_changes`].

use crate::cache::{
    spawn_gc, CacheEngine, CacheHandle, CacheScope, CacheStats, CachedValue, SetOptions,
};
use crate::cancel::CancelToken;
use crate::compiler::{build, Ast, AstProvider, BytecodeProgram, CompileEnv, CompiledTemplate, TemplateCompiler};
use crate::config::EngineConfig;
use crate::error::{ParseError, StencilError};
use crate::events::{EngineEvent, EventBus};
use crate::hash::{content_hash, context_hash, CacheKey, ContentHash};
use crate::incremental::{
    BatchReport, ChangeAnalyzer, ChangeKind, ChangeRecord, DependencyGraph, Job, JobKind,
    JobOutcome, JobOutput, JobRunner, Scheduler, SchedulerStats,
};
use crate::value::RenderContext;
use crate::vm::{Tier, TieringCompiler};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A registered template source, parsed once on registration.
struct SourceEntry {
    source: Arc<str>,
    hash: ContentHash,
    ast: Result<Arc<Ast>, ParseError>,
    /// Templates referenced through `extends`, `include` or `import`.
    references: BTreeSet<String>,
}

impl SourceEntry {
    fn parse(path: &str, source: &str) -> Self {
        let (ast, references) = match build(path, source) {
            Ok((ast, analysis)) => (Ok(Arc::new(ast)), analysis.dependencies()),
            Err(e) => (Err(e), BTreeSet::new()),
        };
        Self {
            source: Arc::from(source),
            hash: content_hash(source.as_bytes()),
            ast,
            references,
        }
    }
}

/// Snapshot of the registry handed to the compiler.
struct Registry(BTreeMap<String, Arc<SourceEntry>>);

impl AstProvider for Registry {
    fn ast(&self, path: &str) -> Result<Option<Arc<Ast>>, ParseError> {
        match self.0.get(path) {
            Some(entry) => entry.ast.clone().map(Some),
            None => Ok(None),
        }
    }
}

struct Inner {
    config: EngineConfig,
    compiler: TemplateCompiler,
    sources: RwLock<BTreeMap<String, Arc<SourceEntry>>>,
    graph: RwLock<DependencyGraph>,
    /// Templates whose last compile hit a dependency cycle.
    cyclic: RwLock<BTreeSet<String>>,
    /// Latest compiled cache key per template.
    compiled: RwLock<HashMap<String, CacheKey>>,
    cache: CacheHandle,
    tiering: TieringCompiler,
    scheduler: Scheduler,
    analyzer: ChangeAnalyzer,
    events: EventBus,
}

pub struct Engine {
    inner: Arc<Inner>,
    cache_task: JoinHandle<()>,
    gc_task: JoinHandle<()>,
    shutdown: CancelToken,
}

impl Engine {
    /// Validate `config`, load scheduler state and start the cache tasks.
    pub async fn new(config: EngineConfig) -> Result<Self, StencilError> {
        let cache = CacheEngine::from_config(config.cache.clone());
        Self::with_cache(config, cache).await
    }

    /// Like [`Engine::new`] with a preconfigured cache engine.
    pub async fn with_cache(config: EngineConfig, cache: CacheEngine) -> Result<Self, StencilError> {
        config.validate()?;
        let scheduler = Scheduler::load(config.scheduler.clone())
            .await
            .map_err(StencilError::State)?;
        let (handle, cache_task) = CacheHandle::spawn(cache);
        let shutdown = CancelToken::new();
        let gc_task = spawn_gc(
            handle.clone(),
            Duration::from_millis(config.cache.gc_interval_ms),
            shutdown.clone(),
        );

        info!(
            level = %config.compiler.optimization_level,
            strategy = %config.cache.strategy,
            concurrency = config.scheduler.concurrency_limit,
            "Engine started"
        );

        let inner = Inner {
            compiler: TemplateCompiler::new(config.compiler.clone()),
            tiering: TieringCompiler::new(
                config.compiler.tiering_threshold,
                config.compiler.max_include_depth,
            ),
            analyzer: ChangeAnalyzer::new(&config.scheduler),
            scheduler,
            config,
            sources: RwLock::new(BTreeMap::new()),
            graph: RwLock::new(DependencyGraph::new()),
            cyclic: RwLock::new(BTreeSet::new()),
            compiled: RwLock::new(HashMap::new()),
            cache: handle,
            events: EventBus::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
            cache_task,
            gc_task,
            shutdown,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Add or replace a template source without compiling it.
    pub async fn register(&self, path: &str, source: &str) -> ContentHash {
        self.inner.register(path, source).await
    }

    /// Read `path` under the templates root, then every template it
    /// references, registering each. Unreadable references are left for
    /// the compiler to report.
    pub async fn load_template(&self, path: &str) -> Result<(), StencilError> {
        let mut pending = vec![path.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(next) = pending.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let source = match self.inner.read_source(&next).await {
                Ok(source) => source,
                Err(e) if next == path => return Err(StencilError::Source(e)),
                Err(e) => {
                    debug!(template = %next, error = %e, "Referenced template not loaded");
                    continue;
                }
            };
            self.inner.register(&next, &source).await;
            if let Some(entry) = self.inner.sources.read().await.get(&next) {
                pending.extend(entry.references.iter().cloned());
            }
        }
        Ok(())
    }

    /// Register `source` under `path` and compile it.
    pub async fn compile(&self, path: &str, source: &str) -> Result<Arc<CompiledTemplate>, StencilError> {
        self.inner.register(path, source).await;
        self.inner.compile_registered(path).await
    }

    /// Current compiled artifact for a registered template.
    pub async fn compiled(&self, path: &str) -> Result<Arc<CompiledTemplate>, StencilError> {
        self.inner.ensure_compiled(path).await
    }

    /// Render a registered template, compiling it first if needed.
    pub async fn render(&self, path: &str, context: &RenderContext) -> Result<String, StencilError> {
        self.inner.render(path, context).await
    }

    /// Feed a batch of file changes through analysis and the scheduler.
    pub async fn apply_changes(&self, records: Vec<ChangeRecord>) -> BatchReport {
        let inner = &self.inner;
        let mut impacts = Vec::with_capacity(records.len());

        for mut record in records {
            if record.kind != ChangeKind::Deleted {
                let source = match &record.content {
                    Some(content) => content.clone(),
                    None => match inner.read_source(&record.path).await {
                        Ok(source) => source,
                        Err(e) => {
                            warn!(template = %record.path, error = %e, "Cannot read changed template");
                            inner.events.publish(EngineEvent::CompileFailed {
                                path: record.path.clone(),
                                error: e.to_string(),
                            });
                            continue;
                        }
                    },
                };
                inner.register(&record.path, &source).await;
                // Structural analysis looks at the content as read.
                record.content = Some(source);
            }

            let impact = inner.analyzer.analyze(&record, &*inner.graph.read().await);
            inner.events.publish(EngineEvent::ChangeScheduled {
                path: impact.path.clone(),
                impact: impact.impact,
                priority: impact.priority,
                affected: impact.dependents.len() + 1,
            });

            if record.kind == ChangeKind::Deleted {
                inner.unregister(&record.path).await;
            }
            impacts.push(impact);
        }

        let runner: Arc<dyn JobRunner> = inner.clone();
        let report = inner.scheduler.run_batch(impacts, runner).await;

        for job in &report.jobs {
            if job.outcome == JobOutcome::Skipped {
                inner.events.publish(EngineEvent::JobSkipped {
                    path: job.path.clone(),
                });
            }
        }
        inner.events.publish(EngineEvent::BatchCompleted {
            batch_id: report.batch_id,
            compiled: report.compiled(),
            skipped: report.skipped(),
            failed: report.failed(),
            cancelled: report.cancelled(),
        });
        report
    }

    /// Persist scheduler state to the configured state file.
    pub async fn checkpoint(&self) -> Result<(), StencilError> {
        self.inner
            .scheduler
            .save_state(&self.inner.config.scheduler.state_file)
            .await
            .map_err(StencilError::State)
    }

    /// Checkpoint, cancel in-flight jobs and stop the background tasks.
    pub async fn shutdown(self) -> Result<(), StencilError> {
        let saved = self.checkpoint().await;
        self.inner.scheduler.cancel_all();
        self.shutdown.cancel();
        if let Err(e) = self.gc_task.await {
            warn!(error = %e, "Cache GC task ended abnormally");
        }
        self.cache_task.abort();
        info!("Engine stopped");
        saved
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    pub async fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats().await
    }

    /// Run one cache GC sweep now.
    pub async fn collect_garbage(&self) -> crate::cache::GcReport {
        self.inner.cache.gc().await
    }

    pub async fn dependents(&self, path: &str) -> BTreeSet<String> {
        self.inner.graph.read().await.dependents(path)
    }

    pub async fn dependencies(&self, path: &str) -> BTreeSet<String> {
        self.inner.graph.read().await.dependencies(path)
    }

    /// Execution tier of the template's current compiled program.
    pub async fn tier(&self, path: &str) -> Tier {
        match self.inner.compiled.read().await.get(path) {
            Some(key) => self.inner.tiering.tier(key.as_str()),
            None => Tier::Interpreted,
        }
    }
}

impl Inner {
    async fn read_source(&self, path: &str) -> anyhow::Result<String> {
        use anyhow::Context;
        let full = self.config.templates_root.join(path);
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("reading template {}", full.display()))
    }

    async fn register(&self, path: &str, source: &str) -> ContentHash {
        let entry = Arc::new(SourceEntry::parse(path, source));
        let hash = entry.hash;
        // Cycles are reported when the template compiles.
        if let Err(cycle) = self
            .graph
            .write()
            .await
            .replace_dependencies(path, &entry.references)
        {
            debug!(template = %path, chain = ?cycle.chain, "Reference closes a cycle");
        }
        let previous = self.sources.write().await.insert(path.to_string(), entry);
        if let Some(previous) = previous.filter(|p| p.hash != hash) {
            debug!(template = %path, old = %previous.hash, new = %hash, "Template source changed");
            self.invalidate(path).await;
        }
        hash
    }

    async fn unregister(&self, path: &str) {
        self.sources.write().await.remove(path);
        self.invalidate(path).await;
        self.graph.write().await.remove_template(path);
        self.cyclic.write().await.remove(path);
        if let Some(key) = self.compiled.write().await.remove(path) {
            self.tiering.invalidate(key.as_str());
        }
    }

    /// Drop every cache entry that depends on `path`.
    async fn invalidate(&self, path: &str) {
        let entries = self.cache.invalidate_by_dependency(path).await;
        if entries > 0 {
            self.events.publish(EngineEvent::CacheInvalidated {
                dependency: path.to_string(),
                entries,
            });
        }
    }

    fn fail(&self, path: &str, err: StencilError) -> StencilError {
        warn!(template = %path, error = %err, "Compile failed");
        self.events.publish(EngineEvent::CompileFailed {
            path: path.to_string(),
            error: err.to_string(),
        });
        err
    }

    async fn compile_registered(&self, path: &str) -> Result<Arc<CompiledTemplate>, StencilError> {
        let entry = self
            .sources
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StencilError::UnknownTemplate(path.to_string()))?;
        if let Err(e) = &entry.ast {
            return Err(self.fail(path, e.clone().into()));
        }

        let edges = self.graph.write().await.replace_dependencies(path, &entry.references);
        if let Err(cycle) = edges {
            self.cyclic.write().await.extend(cycle.chain.iter().cloned());
            return Err(self.fail(path, cycle.into()));
        }
        self.cyclic.write().await.remove(path);

        let upstream = self.graph.read().await.transitive_dependencies(path);
        let (registry, dep_hashes) = {
            let sources = self.sources.read().await;
            let dep_hashes: BTreeMap<String, ContentHash> = upstream
                .iter()
                .filter_map(|d| sources.get(d).map(|e| (d.clone(), e.hash)))
                .collect();
            (Registry(sources.clone()), dep_hashes)
        };

        let key = self
            .compiler
            .cache_key(path, &entry.source, &dep_hashes)
            .map_err(|e| self.fail(path, e.into()))?;

        if let Some(hit) = self.cache.get(key.as_str()).await {
            if let Some(compiled) = hit.value.as_compiled() {
                self.remember(path, &key).await;
                self.events.publish(EngineEvent::TemplateCompiled {
                    path: path.to_string(),
                    cache_key: key.to_string(),
                    level: compiled.metadata.effective_level,
                    instructions: compiled.bytecode.instructions.len(),
                    cached: true,
                });
                return Ok(compiled.clone());
            }
        }

        let excluded = self.cyclic.read().await.clone();
        let compiled = {
            let env = CompileEnv {
                provider: &registry,
                excluded: &excluded,
                dependencies: &dep_hashes,
            };
            self.compiler.compile(path, &entry.source, &env)
        };
        let compiled = Arc::new(compiled.map_err(|e| self.fail(path, e.into()))?);

        let mut dependencies = upstream;
        dependencies.insert(path.to_string());
        let opts = SetOptions::scope(CacheScope::Compiled).with_dependencies(dependencies);
        if !self
            .cache
            .set(key.as_str(), CachedValue::Compiled(compiled.clone()), opts)
            .await
        {
            debug!(template = %path, "Compiled template not cached");
        }
        self.remember(path, &key).await;

        self.events.publish(EngineEvent::TemplateCompiled {
            path: path.to_string(),
            cache_key: key.to_string(),
            level: compiled.metadata.effective_level,
            instructions: compiled.bytecode.instructions.len(),
            cached: false,
        });
        Ok(compiled)
    }

    async fn remember(&self, path: &str, key: &CacheKey) {
        let previous = self
            .compiled
            .write()
            .await
            .insert(path.to_string(), key.clone());
        if let Some(previous) = previous.filter(|p| p != key) {
            self.tiering.invalidate(previous.as_str());
        }
    }

    /// Current compiled artifact, recompiling when the cached one is gone.
    async fn ensure_compiled(&self, path: &str) -> Result<Arc<CompiledTemplate>, StencilError> {
        let key = self.compiled.read().await.get(path).cloned();
        if let Some(key) = key {
            if let Some(hit) = self.cache.get(key.as_str()).await {
                if let Some(compiled) = hit.value.as_compiled() {
                    return Ok(compiled.clone());
                }
            }
        }
        self.compile_registered(path).await
    }

    async fn render(&self, path: &str, context: &RenderContext) -> Result<String, StencilError> {
        let compiled = self.ensure_compiled(path).await?;
        let compiled_key = &compiled.metadata.cache_key;
        let render_key = CacheKey::for_render(compiled_key, &context_hash(context));
        if let Some(hit) = self.cache.get(render_key.as_str()).await {
            if let Some(output) = hit.value.as_rendered() {
                return Ok(output.to_string());
            }
        }

        // Includes and imports resolve at render time; gather their programs.
        let mut programs: HashMap<String, Arc<BytecodeProgram>> = HashMap::new();
        let mut pending = compiled.bytecode.referenced_templates();
        while let Some(target) = pending.pop() {
            if programs.contains_key(&target) {
                continue;
            }
            match self.ensure_compiled(&target).await {
                Ok(dep) => {
                    pending.extend(dep.bytecode.referenced_templates());
                    programs.insert(target, dep.bytecode.clone());
                }
                Err(e) => debug!(template = %path, target = %target, error = %e, "Runtime reference unavailable"),
            }
        }

        let execution = self
            .tiering
            .execute(compiled_key.as_str(), &compiled.bytecode, context, &programs)
            .map_err(|source| StencilError::Render {
                path: path.to_string(),
                source,
            })?;
        if execution.promoted {
            self.events.publish(EngineEvent::TemplatePromoted {
                path: path.to_string(),
                cache_key: compiled_key.to_string(),
            });
        }

        let mut dependencies = self.graph.read().await.transitive_dependencies(path);
        dependencies.insert(path.to_string());
        let opts = SetOptions::scope(CacheScope::Rendered).with_dependencies(dependencies);
        self.cache
            .set(render_key.as_str(), CachedValue::from(execution.output.as_str()), opts)
            .await;
        Ok(execution.output)
    }
}

#[async_trait]
impl JobRunner for Inner {
    async fn artifact_exists(&self, path: &str) -> bool {
        let key = self.compiled.read().await.get(path).cloned();
        match key {
            Some(key) => self.cache.contains(key.as_str()).await,
            None => false,
        }
    }

    async fn run(&self, job: &Job) -> Result<Option<JobOutput>, String> {
        match job.kind {
            JobKind::Remove => Ok(None),
            JobKind::Compile => {
                let compiled = self
                    .compile_registered(&job.path)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Some(JobOutput {
                    content_hash: compiled.metadata.content_hash,
                    output_hash: compiled.metadata.bytecode_fingerprint,
                }))
            }
        }
    }

    async fn dispatch_order(&self, paths: Vec<String>) -> Vec<String> {
        self.graph.read().await.dependency_order(&paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::CacheConfig;
    use crate::error::CompileError;
    use crate::incremental::Priority;
    use crate::types::OptimizationLevel;

    fn config(dir: &tempfile::TempDir) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.templates_root = dir.path().join("templates");
        config.scheduler.state_file = dir.path().join("state.json");
        config
    }

    async fn engine(dir: &tempfile::TempDir) -> Engine {
        Engine::new(config(dir)).await.unwrap()
    }

    fn ctx() -> RenderContext {
        RenderContext::new().with("name", "ada")
    }

    #[tokio::test]
    async fn compile_and_render() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let compiled = engine.compile("hello.tpl", "Hello {{ name | upper }}!").await.unwrap();
        assert_eq!(compiled.metadata.template_path, "hello.tpl");
        assert_eq!(engine.render("hello.tpl", &ctx()).await.unwrap(), "Hello ADA!");
    }

    #[tokio::test]
    async fn second_render_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        engine.compile("a.tpl", "{{ name }}").await.unwrap();
        engine.render("a.tpl", &ctx()).await.unwrap();
        let before = engine.cache_stats().await.hits;
        assert_eq!(engine.render("a.tpl", &ctx()).await.unwrap(), "ada");
        assert!(engine.cache_stats().await.hits > before);
    }

    #[tokio::test]
    async fn unknown_template_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let err = engine.render("nope.tpl", &ctx()).await.unwrap_err();
        assert!(matches!(err, StencilError::UnknownTemplate(p) if p == "nope.tpl"));
    }

    #[tokio::test]
    async fn inheritance_and_includes_record_edges() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        engine.register("base.tpl", "<main>{% block content %}A{% endblock %}</main>").await;
        engine.register("nav.tpl", "<nav>{{ name }}</nav>").await;
        engine
            .compile(
                "child.tpl",
                r#"{% extends "base.tpl" %}{% block content %}{% include "nav.tpl" %}B{% endblock %}"#,
            )
            .await
            .unwrap();
        assert_eq!(
            engine.render("child.tpl", &ctx()).await.unwrap(),
            "<main><nav>ada</nav>B</main>"
        );
        assert_eq!(
            engine.dependencies("child.tpl").await,
            BTreeSet::from(["base.tpl".to_string(), "nav.tpl".to_string()])
        );
        assert!(engine.dependents("base.tpl").await.contains("child.tpl"));
    }

    #[tokio::test]
    async fn editing_a_parent_invalidates_child_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        engine.register("base.tpl", "[{% block b %}A{% endblock %}]").await;
        engine.compile("child.tpl", r#"{% extends "base.tpl" %}"#).await.unwrap();
        assert_eq!(engine.render("child.tpl", &ctx()).await.unwrap(), "[A]");

        let mut events = engine.subscribe();
        let report = engine
            .apply_changes(vec![ChangeRecord::modified("base.tpl", "({% block b %}A{% endblock %})")])
            .await;
        assert!(report.is_clean());
        assert_eq!(report.compiled(), 2);
        assert_eq!(engine.render("child.tpl", &ctx()).await.unwrap(), "(A)");

        let mut saw_invalidation = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::CacheInvalidated { dependency, .. } = event {
                saw_invalidation |= dependency == "base.tpl";
            }
        }
        assert!(saw_invalidation);
    }

    #[tokio::test]
    async fn unchanged_resubmission_skips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let record = ChangeRecord::added("a.tpl", "{{ name }}");
        assert_eq!(engine.apply_changes(vec![record.clone()]).await.compiled(), 1);

        let mut again = record;
        again.kind = ChangeKind::Modified;
        let report = engine.apply_changes(vec![again]).await;
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.jobs[0].priority, Priority::Batch);
        assert_eq!(engine.scheduler_stats().await.skipped, 1);
    }

    #[tokio::test]
    async fn broken_template_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let report = engine
            .apply_changes(vec![
                ChangeRecord::added("bad.tpl", "{% if x %}never closed"),
                ChangeRecord::added("good.tpl", "ok"),
            ])
            .await;
        assert_eq!(report.failed(), 1);
        assert_eq!(report.compiled(), 1);
        assert_eq!(engine.render("good.tpl", &ctx()).await.unwrap(), "ok");
        assert!(matches!(
            engine.render("bad.tpl", &ctx()).await.unwrap_err(),
            StencilError::Compile(CompileError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn include_cycles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        engine.compile("a.tpl", r#"{% include "b.tpl" %}"#).await.unwrap();
        let err = engine.compile("b.tpl", r#"{% include "a.tpl" %}"#).await.unwrap_err();
        assert!(matches!(err, StencilError::Compile(CompileError::Cycle(_))));
    }

    #[tokio::test]
    async fn deleting_a_template_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        engine.compile("a.tpl", "x").await.unwrap();
        let report = engine.apply_changes(vec![ChangeRecord::deleted("a.tpl")]).await;
        assert_eq!(report.job("a.tpl").unwrap().outcome, JobOutcome::Removed);
        assert!(matches!(
            engine.render("a.tpl", &ctx()).await.unwrap_err(),
            StencilError::UnknownTemplate(_)
        ));
    }

    #[tokio::test]
    async fn changes_without_content_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let root = dir.path().join("templates");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("disk.tpl"), "from disk").unwrap();
        let mut record = ChangeRecord::added("disk.tpl", "");
        record.content = None;
        let report = engine.apply_changes(vec![record]).await;
        assert_eq!(report.compiled(), 1);
        assert_eq!(engine.render("disk.tpl", &ctx()).await.unwrap(), "from disk");
    }

    #[tokio::test]
    async fn structural_markers_read_from_disk_raise_priority() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let root = dir.path().join("templates");
        std::fs::create_dir_all(&root).unwrap();
        let page = r#"{% extends "base.tpl" %}{% block b %}x{% endblock %}"#;
        std::fs::write(root.join("page.tpl"), page).unwrap();
        engine.register("base.tpl", "[{% block b %}{% endblock %}]").await;
        engine
            .compile("page.tpl", r#"{% extends "base.tpl" %}{% block b %}old{% endblock %}"#)
            .await
            .unwrap();

        let mut record = ChangeRecord::modified("page.tpl", page);
        record.content = None;
        let report = engine.apply_changes(vec![record]).await;
        let job = report.job("page.tpl").unwrap();
        assert!(job.priority <= Priority::High, "got {:?}", job.priority);
    }

    #[tokio::test]
    async fn load_template_follows_references() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        let root = dir.path().join("templates");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("base.tpl"), "<{% block x %}{% endblock %}>").unwrap();
        std::fs::write(root.join("page.tpl"), r#"{% extends "base.tpl" %}{% block x %}p{% endblock %}"#)
            .unwrap();
        engine.load_template("page.tpl").await.unwrap();
        assert_eq!(engine.render("page.tpl", &ctx()).await.unwrap(), "<p>");
        assert!(engine.load_template("missing.tpl").await.is_err());
    }

    #[tokio::test]
    async fn hot_templates_are_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.compiler.tiering_threshold = 2;
        let engine = Engine::new(config).await.unwrap();
        let mut events = engine.subscribe();
        engine.compile("a.tpl", "{{ name }}").await.unwrap();
        for i in 0..3 {
            let ctx = RenderContext::new().with("name", i as i64);
            engine.render("a.tpl", &ctx).await.unwrap();
        }
        assert_eq!(engine.tier("a.tpl").await, Tier::Specialized);
        let mut promoted = false;
        while let Ok(event) = events.try_recv() {
            promoted |= matches!(event, EngineEvent::TemplatePromoted { .. });
        }
        assert!(promoted);
    }

    #[tokio::test]
    async fn checkpoint_round_trips_through_restart() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir).await;
        engine.apply_changes(vec![ChangeRecord::added("a.tpl", "x")]).await;
        engine.shutdown().await.unwrap();

        let restarted = Engine::new(config(&dir)).await.unwrap();
        let stats = restarted.scheduler_stats().await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test]
    async fn optimization_level_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.compiler.optimization_level = OptimizationLevel::None;
        let cache = CacheEngine::new(CacheConfig::default()).with_clock(Arc::new(ManualClock::new(0)));
        let engine = Engine::with_cache(config, cache).await.unwrap();
        let compiled = engine.compile("a.tpl", "{{ name }}").await.unwrap();
        assert_eq!(compiled.metadata.optimization_level, OptimizationLevel::None);
    }
}
