//! Template compiler: parse, analyse, optimize, generate bytecode.

pub mod analysis;
pub mod ast;
pub mod codegen;
pub mod filters;
pub mod flatten;
mod lexer;
pub mod parser;
pub mod passes;

pub use analysis::StaticAnalysis;
pub use ast::{Ast, NodeId, NodeKind};
pub use codegen::{BytecodeProgram, Instruction};
pub use flatten::{flatten, AstProvider};
pub use passes::{OptimizationPass, PassContext, PassPipeline, PassRecord};

use crate::config::CompilerConfig;
use crate::error::{CompileError, ParseError};
use crate::hash::{content_hash, CacheKey, ContentHash};
use crate::types::OptimizationLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Parse `source` and analyse the resulting tree.
pub fn build(path: &str, source: &str) -> Result<(Ast, StaticAnalysis), ParseError> {
    let ast = parser::parse(path, source)?;
    let analysis = StaticAnalysis::analyze(&ast);
    Ok((ast, analysis))
}

/// Compiled artifact handed to renderers and stored in the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub bytecode: Arc<BytecodeProgram>,
    pub analysis: StaticAnalysis,
    pub metadata: TemplateMetadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub template_path: String,
    pub cache_key: CacheKey,
    pub compiled_at: DateTime<Utc>,
    pub optimization_level: OptimizationLevel,
    /// Level after the complexity cap.
    pub effective_level: OptimizationLevel,
    pub content_hash: ContentHash,
    pub bytecode_fingerprint: ContentHash,
    pub passes_applied: Vec<PassRecord>,
}

/// What a compilation may see beyond the template's own source.
pub struct CompileEnv<'a> {
    pub provider: &'a dyn AstProvider,
    /// Templates on a dependency cycle; never inlined.
    pub excluded: &'a BTreeSet<String>,
    /// Content hashes of every template this one depends on, folded into
    /// the cache key so a dependency edit yields a new key.
    pub dependencies: &'a BTreeMap<String, ContentHash>,
}

#[derive(Serialize)]
struct KeyOptions<'a> {
    compiler: &'a CompilerConfig,
    dependencies: &'a BTreeMap<String, ContentHash>,
}

pub struct TemplateCompiler {
    config: CompilerConfig,
    pipeline: PassPipeline,
}

impl TemplateCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        let pipeline = PassPipeline::for_level(config.optimization_level);
        Self { config, pipeline }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn cache_key(
        &self,
        path: &str,
        source: &str,
        dependencies: &BTreeMap<String, ContentHash>,
    ) -> Result<CacheKey, CompileError> {
        let options = KeyOptions {
            compiler: &self.config,
            dependencies,
        };
        CacheKey::derive(path, source.as_bytes(), &options).map_err(|e| CompileError::PassFailed {
            path: path.to_string(),
            pass: "cache-key",
            message: e.to_string(),
        })
    }

    pub fn compile(
        &self,
        path: &str,
        source: &str,
        env: &CompileEnv<'_>,
    ) -> Result<CompiledTemplate, CompileError> {
        let started = Instant::now();
        let ast = parser::parse(path, source)?;
        let ast = flatten(path, &ast, env.provider)?;

        let ctx = PassContext {
            path,
            config: &self.config,
            provider: env.provider,
            excluded: env.excluded,
        };
        let optimized = self.pipeline.run(ast, &ctx)?;
        let bytecode = codegen::generate(path, &optimized.ast, &self.config.globals)?;

        let metadata = TemplateMetadata {
            template_path: path.to_string(),
            cache_key: self.cache_key(path, source, env.dependencies)?,
            compiled_at: Utc::now(),
            optimization_level: self.config.optimization_level,
            effective_level: optimized.effective_level,
            content_hash: content_hash(source.as_bytes()),
            bytecode_fingerprint: bytecode.fingerprint(),
            passes_applied: optimized.passes,
        };

        info!(
            template = %path,
            level = %metadata.effective_level,
            passes = metadata.passes_applied.len(),
            instructions = bytecode.instructions.len(),
            complexity = optimized.analysis.complexity,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Compiled template"
        );

        Ok(CompiledTemplate {
            bytecode: Arc::new(bytecode),
            analysis: optimized.analysis,
            metadata,
        })
    }

    /// Compile a template that references no other templates.
    pub fn compile_standalone(&self, path: &str, source: &str) -> Result<CompiledTemplate, CompileError> {
        let provider: BTreeMap<String, Arc<Ast>> = BTreeMap::new();
        self.compile(
            path,
            source,
            &CompileEnv {
                provider: &provider,
                excluded: &BTreeSet::new(),
                dependencies: &BTreeMap::new(),
            },
        )
    }
}
