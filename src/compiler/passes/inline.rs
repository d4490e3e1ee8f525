use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::error::CompileError;
use crate::types::OptimizationLevel;
use tracing::{debug, warn};

/// Nested includes are inlined at most this deep.
const MAX_INLINE_DEPTH: usize = 4;

/// Replaces `include` nodes with the included template's tree when it is
/// small enough and self-contained.
///
/// A target qualifies when it has no `extends`, defines or calls no macros,
/// has no `stop` (which would end the including template instead), is not
/// on a dependency cycle, and is not already being inlined.
pub struct TemplateInlining {
    aggressive: bool,
}

impl TemplateInlining {
    pub fn standard() -> Self {
        Self { aggressive: false }
    }

    /// Raised threshold, run at `Maximum`.
    pub fn aggressive() -> Self {
        Self { aggressive: true }
    }
}

impl OptimizationPass for TemplateInlining {
    fn name(&self) -> &'static str {
        if self.aggressive {
            "aggressive-inline"
        } else {
            "inline"
        }
    }

    fn min_level(&self) -> OptimizationLevel {
        if self.aggressive {
            OptimizationLevel::Maximum
        } else {
            OptimizationLevel::Advanced
        }
    }

    fn run(
        &self,
        ast: &Ast,
        _analysis: &StaticAnalysis,
        ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        let threshold = if self.aggressive {
            ctx.config.inline_threshold * ctx.config.aggressive_inline_multiplier
        } else {
            ctx.config.inline_threshold
        };
        apply(
            &mut Inliner {
                ctx,
                threshold,
                stack: vec![ctx.path.to_string()],
            },
            ast,
        )
    }
}

struct Inliner<'a, 'c> {
    ctx: &'a PassContext<'c>,
    threshold: usize,
    /// Templates currently being inlined, outermost first.
    stack: Vec<String>,
}

impl Inliner<'_, '_> {
    fn candidate(&self, target: &str) -> Option<std::sync::Arc<Ast>> {
        if self.ctx.excluded.contains(target)
            || self.stack.iter().any(|p| p == target)
            || self.stack.len() > MAX_INLINE_DEPTH
        {
            return None;
        }
        let tree = match self.ctx.provider.ast(target) {
            Ok(Some(tree)) => tree,
            Ok(None) => return None,
            Err(e) => {
                warn!(template = %self.ctx.path, target = %target, error = %e, "Include target does not parse; left as runtime include");
                return None;
            }
        };
        let self_contained = tree.extends.is_none()
            && tree.shared.is_empty()
            && !tree.any_node(|n| {
                matches!(
                    n.kind,
                    NodeKind::Macro { .. }
                        | NodeKind::Import { .. }
                        | NodeKind::Call { .. }
                        | NodeKind::Stop
                )
            });
        (self_contained && tree.size() <= self.threshold).then_some(tree)
    }
}

impl Transform for Inliner<'_, '_> {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        let NodeKind::Include { target } = &src.node(id).kind else {
            return Ok(vec![copy_node(self, src, out, id)?]);
        };
        let Some(tree) = self.candidate(target) else {
            return Ok(vec![copy_node(self, src, out, id)?]);
        };

        debug!(template = %self.ctx.path, target = %target, nodes = tree.size(), "Inlining include");
        self.stack.push(target.clone());
        let inlined = self.sequence(&tree, out, &tree.root);
        self.stack.pop();
        inlined
    }
}
