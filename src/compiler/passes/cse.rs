use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::error::CompileError;
use crate::types::OptimizationLevel;
use std::collections::HashMap;

/// Hoists filter expressions that occur at least twice into shared slots
/// evaluated once per render.
///
/// Only expressions over context variables qualify: anything reading a loop
/// binding or macro parameter changes value per iteration or call, and
/// macro bodies are skipped entirely because imported macros run without
/// the importing program's prologue.
pub struct CommonSubexpressionElimination;

impl OptimizationPass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Basic
    }

    fn run(
        &self,
        ast: &Ast,
        _analysis: &StaticAnalysis,
        _ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        let mut counter = Counter::default();
        counter.walk(ast, &ast.root, &mut Vec::new(), false);

        let base = ast.shared.len() as u32;
        let mut slots = HashMap::new();
        let mut hoisted = Vec::new();
        for (key, expr, filters) in counter.order {
            if counter.counts.get(&key).copied().unwrap_or(0) >= 2 {
                slots.insert(key, base + hoisted.len() as u32);
                hoisted.push(SharedExpr { expr, filters });
            }
        }
        if hoisted.is_empty() {
            return Ok(ast.clone());
        }

        let mut out = apply(
            &mut Rewriter {
                slots: &slots,
                scope: Vec::new(),
                in_macro: false,
            },
            ast,
        )?;
        out.shared.extend(hoisted);
        Ok(out)
    }
}

fn eligible(expr: &Expr, filters: &[FilterCall], scope: &[String], in_macro: bool) -> bool {
    !in_macro
        && !filters.is_empty()
        && !expr.is_constant()
        && expr.vars().all(|p| !scope.contains(&p.root))
}

#[derive(Default)]
struct Counter {
    counts: HashMap<String, usize>,
    /// First occurrence of each key, in tree order.
    order: Vec<(String, Expr, Vec<FilterCall>)>,
}

impl Counter {
    fn walk(&mut self, ast: &Ast, seq: &[NodeId], scope: &mut Vec<String>, in_macro: bool) {
        for &id in seq {
            let node = ast.node(id);
            match &node.kind {
                NodeKind::FilterApplication { expr, filters }
                    if eligible(expr, filters, scope, in_macro) =>
                {
                    let key = expression_key(expr, filters);
                    let count = self.counts.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        self.order.push((key, expr.clone(), filters.clone()));
                    }
                }
                NodeKind::Loop { binding, body, .. } => {
                    scope.push(binding.clone());
                    self.walk(ast, body, scope, in_macro);
                    scope.pop();
                }
                NodeKind::Macro { body, .. } => self.walk(ast, body, scope, true),
                other => {
                    for child in other.child_sequences() {
                        self.walk(ast, child, scope, in_macro);
                    }
                }
            }
        }
    }
}

struct Rewriter<'a> {
    slots: &'a HashMap<String, u32>,
    scope: Vec<String>,
    in_macro: bool,
}

impl Transform for Rewriter<'_> {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        let node = src.node(id);
        match &node.kind {
            NodeKind::FilterApplication { expr, filters }
                if eligible(expr, filters, &self.scope, self.in_macro) =>
            {
                if let Some(&slot) = self.slots.get(&expression_key(expr, filters)) {
                    return Ok(vec![out.push(Node {
                        kind: NodeKind::Shared { slot },
                        span: node.span,
                        tags: node.tags,
                    })]);
                }
                Ok(vec![copy_node(self, src, out, id)?])
            }
            NodeKind::Loop { binding, .. } => {
                self.scope.push(binding.clone());
                let new = copy_node(self, src, out, id);
                self.scope.pop();
                Ok(vec![new?])
            }
            NodeKind::Macro { .. } => {
                let was = std::mem::replace(&mut self.in_macro, true);
                let new = copy_node(self, src, out, id);
                self.in_macro = was;
                Ok(vec![new?])
            }
            _ => Ok(vec![copy_node(self, src, out, id)?]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;

    fn shared_count(ast: &Ast) -> usize {
        ast.preorder()
            .into_iter()
            .filter(|id| matches!(ast.node(*id).kind, NodeKind::Shared { .. }))
            .count()
    }

    #[test]
    fn repeated_expressions_share_one_slot() {
        let ast = Fixture::new().run(
            &CommonSubexpressionElimination,
            "{{ user.name | upper }} and {{ user.name | upper }} but {{ user.name | lower }}",
        );
        assert_eq!(ast.shared.len(), 1);
        assert_eq!(shared_count(&ast), 2);
    }

    #[test]
    fn loop_bound_expressions_are_not_shared() {
        let ast = Fixture::new().run(
            &CommonSubexpressionElimination,
            "{% for x in xs %}{{ x | upper }}{{ x | upper }}{% endfor %}",
        );
        assert!(ast.shared.is_empty());
    }

    #[test]
    fn context_expressions_inside_loops_are_shared() {
        let ast = Fixture::new().run(
            &CommonSubexpressionElimination,
            "{{ title | trim }}{% for x in xs %}{{ title | trim }}{% endfor %}",
        );
        assert_eq!(ast.shared.len(), 1);
        assert_eq!(shared_count(&ast), 2);
    }

    #[test]
    fn macro_bodies_are_skipped() {
        let ast = Fixture::new().run(
            &CommonSubexpressionElimination,
            "{% macro m() %}{{ a | upper }}{% endmacro %}{{ a | upper }}",
        );
        assert!(ast.shared.is_empty());
    }

    #[test]
    fn spans_do_not_affect_identity() {
        let ast = Fixture::new().run(
            &CommonSubexpressionElimination,
            "{{a|trim}}   {{  a  |  trim  }}",
        );
        assert_eq!(ast.shared.len(), 1);
    }
}
