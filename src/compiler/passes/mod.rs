//! Optimization pass pipeline.
//!
//! Passes are pure tree-to-tree rewrites run in a fixed order. Each pass
//! declares the lowest optimization level it belongs to, so higher levels
//! always run a superset of the passes of lower levels.

mod constant_fold;
mod cse;
mod dead_code;
mod filter_fusion;
mod inline;
mod tagging;
mod unroll;

pub use constant_fold::{eval_condition, eval_constant, ConstantFolding};
pub use cse::CommonSubexpressionElimination;
pub use dead_code::DeadCodeElimination;
pub use filter_fusion::FilterChainFusion;
pub use inline::TemplateInlining;
pub use tagging::{HotPathTagging, ShapeSpecialization, VectorizationHints};
pub use unroll::LoopUnrolling;

use super::analysis::StaticAnalysis;
use super::ast::Ast;
use super::flatten::AstProvider;
use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::types::OptimizationLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::debug;

/// Inputs a pass may consult besides the tree itself.
pub struct PassContext<'a> {
    pub path: &'a str,
    pub config: &'a CompilerConfig,
    /// Parsed trees of other templates, for inlining.
    pub provider: &'a dyn AstProvider,
    /// Templates known to sit on a dependency cycle.
    pub excluded: &'a BTreeSet<String>,
}

pub trait OptimizationPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn min_level(&self) -> OptimizationLevel;

    fn run(
        &self,
        ast: &Ast,
        analysis: &StaticAnalysis,
        ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassRecord {
    pub name: String,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub elapsed_us: u64,
}

/// Result of running the pipeline over one template.
#[derive(Debug)]
pub struct PipelineOutput {
    pub ast: Ast,
    /// Analysis of the final tree.
    pub analysis: StaticAnalysis,
    /// Level the passes actually ran at, after the complexity cap.
    pub effective_level: OptimizationLevel,
    pub passes: Vec<PassRecord>,
}

pub struct PassPipeline {
    passes: Vec<Box<dyn OptimizationPass>>,
    level: OptimizationLevel,
}

impl PassPipeline {
    /// Every builtin pass in execution order.
    fn all() -> Vec<Box<dyn OptimizationPass>> {
        vec![
            Box::new(ConstantFolding),
            Box::new(DeadCodeElimination),
            Box::new(CommonSubexpressionElimination),
            Box::new(LoopUnrolling),
            Box::new(FilterChainFusion),
            Box::new(TemplateInlining::standard()),
            Box::new(HotPathTagging),
            Box::new(TemplateInlining::aggressive()),
            Box::new(VectorizationHints),
            Box::new(ShapeSpecialization),
        ]
    }

    pub fn for_level(level: OptimizationLevel) -> Self {
        let passes = Self::all()
            .into_iter()
            .filter(|p| p.min_level() <= level)
            .collect();
        Self { passes, level }
    }

    pub fn level(&self) -> OptimizationLevel {
        self.level
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run the passes, re-analysing after each one. Templates cheaper than
    /// the configured complexity floor only get `Basic` passes.
    pub fn run(&self, ast: Ast, ctx: &PassContext<'_>) -> Result<PipelineOutput, CompileError> {
        let mut ast = ast;
        let mut analysis = StaticAnalysis::analyze(&ast);

        let effective_level = if analysis.complexity < ctx.config.advanced_complexity_floor {
            self.level.min(OptimizationLevel::Basic)
        } else {
            self.level
        };

        let mut records = Vec::new();
        for pass in &self.passes {
            if pass.min_level() > effective_level {
                continue;
            }
            let started = Instant::now();
            let nodes_before = ast.size();
            let next = pass.run(&ast, &analysis, ctx)?;
            ast = next;
            analysis = StaticAnalysis::analyze(&ast);
            let record = PassRecord {
                name: pass.name().to_string(),
                nodes_before,
                nodes_after: ast.size(),
                elapsed_us: started.elapsed().as_micros() as u64,
            };
            debug!(
                template = %ctx.path,
                pass = pass.name(),
                nodes_before = record.nodes_before,
                nodes_after = record.nodes_after,
                "Pass applied"
            );
            records.push(record);
        }

        Ok(PipelineOutput {
            ast,
            analysis,
            effective_level,
            passes: records,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::Fixture;
    use super::*;
    use crate::compiler::parser::parse;

    #[test]
    fn levels_are_strict_supersets() {
        let none = PassPipeline::for_level(OptimizationLevel::None).names();
        let basic = PassPipeline::for_level(OptimizationLevel::Basic).names();
        let advanced = PassPipeline::for_level(OptimizationLevel::Advanced).names();
        let maximum = PassPipeline::for_level(OptimizationLevel::Maximum).names();

        assert!(none.is_empty());
        assert_eq!(basic, vec!["constant-folding", "dead-code", "cse"]);
        assert!(basic.iter().all(|p| advanced.contains(p)));
        assert!(advanced.iter().all(|p| maximum.contains(p)));
        assert!(advanced.len() > basic.len());
        assert!(maximum.len() > advanced.len());
    }

    #[test]
    fn cheap_templates_are_capped_at_basic() {
        let fixture = Fixture::new();
        let ast = parse("t.tpl", "{% for i in range(2) %}{{ i }}{% endfor %}").unwrap();
        let out = PassPipeline::for_level(OptimizationLevel::Maximum)
            .run(ast.clone(), &fixture.ctx())
            .unwrap();
        // complexity 1 + 5 + 1 = 7, below the default floor of 8
        assert_eq!(out.effective_level, OptimizationLevel::Basic);
        assert!(out.passes.iter().all(|p| p.name != "loop-unroll"));

        let mut fixture = Fixture::new();
        fixture.config.advanced_complexity_floor = 0;
        let out = PassPipeline::for_level(OptimizationLevel::Maximum)
            .run(ast, &fixture.ctx())
            .unwrap();
        assert_eq!(out.effective_level, OptimizationLevel::Maximum);
        assert!(out.passes.iter().any(|p| p.name == "loop-unroll"));
    }
}
