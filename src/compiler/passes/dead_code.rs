use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::error::CompileError;
use crate::types::OptimizationLevel;

/// Drops nodes in the dead-code set, then control flow left with nothing
/// to render.
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Basic
    }

    fn run(
        &self,
        ast: &Ast,
        analysis: &StaticAnalysis,
        _ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        apply(&mut Eliminator { analysis }, ast)
    }
}

struct Eliminator<'a> {
    analysis: &'a StaticAnalysis,
}

impl Transform for Eliminator<'_> {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        if self.analysis.is_dead(id) {
            return Ok(Vec::new());
        }
        let new = copy_node(self, src, out, id)?;
        let empty = match &out.node(new).kind {
            NodeKind::Conditional {
                branches,
                otherwise,
            } => otherwise.is_empty() && branches.iter().all(|b| b.body.is_empty()),
            NodeKind::Loop { body, .. } => body.is_empty(),
            _ => false,
        };
        Ok(if empty { Vec::new() } else { vec![new] })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;

    #[test]
    fn removes_code_after_stop() {
        let ast = Fixture::new().run(&DeadCodeElimination, "a{% stop %}b{{ c }}");
        let labels: Vec<&str> = ast.root.iter().map(|id| ast.node(*id).kind.label()).collect();
        assert_eq!(labels, vec!["literal", "stop"]);
    }

    #[test]
    fn removes_empty_loops_and_conditionals() {
        let ast = Fixture::new().run(
            &DeadCodeElimination,
            "{% for i in range(0) %}x{% endfor %}{% if a %}{% endif %}{% for x in xs %}{% endfor %}{% if b %}B{% endif %}",
        );
        let labels: Vec<&str> = ast.root.iter().map(|id| ast.node(*id).kind.label()).collect();
        assert_eq!(labels, vec!["if"]);
    }

    #[test]
    fn stop_inside_a_branch_only_kills_its_siblings() {
        let ast = Fixture::new().run(
            &DeadCodeElimination,
            "{% if a %}{% stop %}gone{% endif %}kept",
        );
        assert_eq!(ast.size(), 3);
    }
}
