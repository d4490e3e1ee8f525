use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::error::CompileError;
use crate::types::OptimizationLevel;

/// Expands range loops with a known bound no larger than
/// `max_unroll_iterations`, substituting the loop variable with each index.
///
/// Loops whose body includes other templates, calls or defines macros, or
/// iterates over the loop variable are left intact: those constructs can
/// observe the binding in ways a substituted literal cannot reproduce.
pub struct LoopUnrolling;

impl OptimizationPass for LoopUnrolling {
    fn name(&self) -> &'static str {
        "loop-unroll"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Advanced
    }

    fn run(
        &self,
        ast: &Ast,
        analysis: &StaticAnalysis,
        ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        apply(
            &mut Unroller {
                analysis,
                max_iterations: ctx.config.max_unroll_iterations,
                bindings: Vec::new(),
            },
            ast,
        )
    }
}

struct Unroller<'a> {
    analysis: &'a StaticAnalysis,
    max_iterations: u64,
    /// Innermost last. `None` marks a binding shadowed by a kept loop.
    bindings: Vec<(String, Option<i64>)>,
}

impl Unroller<'_> {
    fn lookup(&self, name: &str) -> Option<i64> {
        self.bindings
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| *v)
    }

    fn unrollable(&self, src: &Ast, id: NodeId, binding: &str, body: &[NodeId]) -> bool {
        match self.analysis.loop_bound(id) {
            Some(n) if n > 0 && n <= self.max_iterations => {}
            _ => return false,
        }
        !body.iter().any(|child| {
            subtree_any(src, *child, &mut |node| match &node.kind {
                NodeKind::Include { .. }
                | NodeKind::Call { .. }
                | NodeKind::Macro { .. }
                | NodeKind::Import { .. } => true,
                NodeKind::Loop {
                    iterable: Iterable::Var(path),
                    ..
                } => path.root == binding,
                _ => false,
            })
        })
    }

    fn atom(&self, atom: &Atom) -> Atom {
        match atom {
            Atom::Var(path) => match self.lookup(&path.root) {
                Some(i) if path.attrs.is_empty() => Atom::Lit(Literal::Int(i)),
                Some(_) => Atom::Lit(Literal::Null),
                None => atom.clone(),
            },
            Atom::Lit(_) => atom.clone(),
        }
    }

    fn expr(&self, expr: &Expr) -> Expr {
        Expr {
            atoms: expr.atoms.iter().map(|a| self.atom(a)).collect(),
        }
    }

    fn condition(&self, cond: &Condition) -> Condition {
        Condition {
            negate: cond.negate,
            lhs: self.expr(&cond.lhs),
            cmp: cond.cmp.as_ref().map(|(op, rhs)| (*op, self.expr(rhs))),
        }
    }

    /// Rewrite the node's own expressions; children are handled by the caller.
    fn substitute(&self, kind: NodeKind) -> NodeKind {
        if self.bindings.iter().all(|(_, v)| v.is_none()) {
            return kind;
        }
        match kind {
            NodeKind::VariableRef { path } => match self.lookup(&path.root) {
                Some(_) => NodeKind::FilterApplication {
                    expr: self.expr(&Expr::var(path)),
                    filters: Vec::new(),
                },
                None => NodeKind::VariableRef { path },
            },
            NodeKind::FilterApplication { expr, filters } => NodeKind::FilterApplication {
                expr: self.expr(&expr),
                filters,
            },
            NodeKind::Conditional {
                branches,
                otherwise,
            } => NodeKind::Conditional {
                branches: branches
                    .into_iter()
                    .map(|b| Branch {
                        condition: self.condition(&b.condition),
                        body: b.body,
                    })
                    .collect(),
                otherwise,
            },
            other => other,
        }
    }
}

fn subtree_any(ast: &Ast, id: NodeId, pred: &mut impl FnMut(&Node) -> bool) -> bool {
    let node = ast.node(id);
    pred(node)
        || node
            .kind
            .child_sequences()
            .iter()
            .flat_map(|seq| seq.iter())
            .any(|child| subtree_any(ast, *child, &mut *pred))
}

impl Transform for Unroller<'_> {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        let node = src.node(id);

        if let NodeKind::Loop {
            binding,
            iterable,
            body,
        } = &node.kind
        {
            if let Iterable::Range { start, end } = iterable {
                if self.unrollable(src, id, binding, body) {
                    let mut ids = Vec::new();
                    for i in *start..*end {
                        self.bindings.push((binding.clone(), Some(i)));
                        let copied = self.sequence(src, out, body);
                        self.bindings.pop();
                        ids.extend(copied?);
                    }
                    return Ok(ids);
                }
            }
            self.bindings.push((binding.clone(), None));
            let copied = copy_node(self, src, out, id);
            self.bindings.pop();
            return Ok(vec![copied?]);
        }

        let new = copy_node(self, src, out, id)?;
        let copied = out.node(new).kind.clone();
        out.node_mut(new).kind = self.substitute(copied);
        Ok(vec![new])
    }
}
