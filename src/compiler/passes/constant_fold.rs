use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::compiler::codegen::global_value;
use crate::compiler::filters;
use crate::error::CompileError;
use crate::types::OptimizationLevel;
use crate::value::Value;
use std::collections::BTreeMap;

type Globals = BTreeMap<String, serde_json::Value>;

/// Replaces constant output nodes with the literal text they render to and
/// splices conditionals with constant conditions down to the taken branch.
/// Adjacent literals are merged afterwards.
pub struct ConstantFolding;

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Basic
    }

    fn run(
        &self,
        ast: &Ast,
        analysis: &StaticAnalysis,
        ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        apply(
            &mut Folder {
                analysis,
                globals: &ctx.config.globals,
            },
            ast,
        )
    }
}

/// Value of a constant expression with its filter chain applied, or `None`
/// if it reads the render context or names an unknown filter.
pub fn eval_constant(expr: &Expr, chain: &[FilterCall], globals: &Globals) -> Option<Value> {
    let mut value = eval_expr(expr, globals)?;
    for f in chain {
        let args: Vec<Value> = f.args.iter().map(Literal::to_value).collect();
        value = filters::apply(&f.name, &value, &args)?;
    }
    Some(value)
}

pub fn eval_condition(cond: &Condition, globals: &Globals) -> Option<bool> {
    let lhs = eval_expr(&cond.lhs, globals)?;
    let result = match &cond.cmp {
        Some((op, rhs)) => {
            let equal = lhs.loose_eq(&eval_expr(rhs, globals)?);
            match op {
                CmpOp::Eq => equal,
                CmpOp::Ne => !equal,
            }
        }
        None => lhs.is_truthy(),
    };
    Some(result != cond.negate)
}

fn eval_expr(expr: &Expr, globals: &Globals) -> Option<Value> {
    let parts = expr
        .atoms
        .iter()
        .map(|atom| match atom {
            Atom::Lit(lit) => Some(lit.to_value()),
            Atom::Var(path) if path.is_private() => Some(global_value(globals, path)),
            Atom::Var(_) => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Value::concat(&parts))
}

struct Folder<'a> {
    analysis: &'a StaticAnalysis,
    globals: &'a Globals,
}

impl Folder<'_> {
    fn literal(out: &mut Ast, node: &Node, text: String) -> NodeId {
        out.push(Node {
            kind: NodeKind::Literal { text },
            span: node.span,
            tags: node.tags,
        })
    }
}

impl Transform for Folder<'_> {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        let node = src.node(id);
        if !self.analysis.is_constant(id) {
            return Ok(vec![copy_node(self, src, out, id)?]);
        }

        match &node.kind {
            NodeKind::VariableRef { path } => {
                let text = global_value(self.globals, path).to_output();
                Ok(vec![Self::literal(out, node, text)])
            }
            NodeKind::FilterApplication { expr, filters } => {
                match eval_constant(expr, filters, self.globals) {
                    Some(value) => Ok(vec![Self::literal(out, node, value.to_output())]),
                    None => Ok(vec![copy_node(self, src, out, id)?]),
                }
            }
            NodeKind::Conditional {
                branches,
                otherwise,
            } => {
                for branch in branches {
                    match eval_condition(&branch.condition, self.globals) {
                        Some(true) => return self.sequence(src, out, &branch.body),
                        Some(false) => continue,
                        None => return Ok(vec![copy_node(self, src, out, id)?]),
                    }
                }
                self.sequence(src, out, otherwise)
            }
            _ => Ok(vec![copy_node(self, src, out, id)?]),
        }
    }

    fn sequence(
        &mut self,
        src: &Ast,
        out: &mut Ast,
        seq: &[NodeId],
    ) -> Result<Vec<NodeId>, CompileError> {
        let mut ids: Vec<NodeId> = Vec::with_capacity(seq.len());
        for id in seq {
            for new in self.node(src, out, *id)? {
                let merged = match (ids.last().map(|last| &out.node(*last).kind), &out.node(new).kind) {
                    (Some(NodeKind::Literal { text: a }), NodeKind::Literal { text: b })
                        if !out.node(new).tags.hot =>
                    {
                        Some(format!("{a}{b}"))
                    }
                    _ => None,
                };
                match (merged, ids.last().copied()) {
                    (Some(text), Some(last)) => {
                        let span = out.node(last).span.join(out.node(new).span);
                        let node = out.node_mut(last);
                        node.kind = NodeKind::Literal { text };
                        node.span = span;
                    }
                    _ => ids.push(new),
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use serde_json::json;

    fn root_texts(ast: &Ast) -> Vec<String> {
        ast.root
            .iter()
            .map(|id| match &ast.node(*id).kind {
                NodeKind::Literal { text } => text.clone(),
                other => format!("<{}>", other.label()),
            })
            .collect()
    }

    #[test]
    fn folds_private_globals_and_filters() {
        let mut fixture = Fixture::new();
        fixture.config.globals.insert("_site".into(), json!("<Acme>"));
        let ast = fixture.run(
            &ConstantFolding,
            "[{{ _site | upper }}]{{ name }}{{ \"a\" ~ 1 }}",
        );
        assert_eq!(root_texts(&ast), vec!["[&lt;ACME&gt;]", "<variable>", "a1"]);
    }

    #[test]
    fn undefined_globals_fold_to_empty() {
        let ast = Fixture::new().run(&ConstantFolding, "a{{ _missing }}b");
        assert_eq!(root_texts(&ast), vec!["ab"]);
    }

    #[test]
    fn constant_conditionals_keep_the_taken_branch() {
        let mut fixture = Fixture::new();
        fixture.config.globals.insert("_mode".into(), json!("prod"));
        let ast = fixture.run(
            &ConstantFolding,
            "{% if _mode == \"dev\" %}D{% elif _mode == \"prod\" %}P{{ x }}{% else %}E{% endif %}",
        );
        assert_eq!(root_texts(&ast), vec!["P", "<variable>"]);

        let ast = fixture.run(&ConstantFolding, "{% if not _mode %}A{% else %}B{% endif %}");
        assert_eq!(root_texts(&ast), vec!["B"]);
    }

    #[test]
    fn dynamic_conditionals_are_left_alone() {
        let ast = Fixture::new().run(&ConstantFolding, "{% if x %}A{% endif %}");
        assert_eq!(root_texts(&ast), vec!["<if>"]);
    }

    #[test]
    fn eval_condition_matches_runtime_semantics() {
        let globals = Globals::new();
        let cond = |src: &str| {
            let ast = crate::compiler::parser::parse("c.tpl", &format!("{{% if {src} %}}{{% endif %}}"))
                .unwrap();
            match &ast.node(ast.root[0]).kind {
                NodeKind::Conditional { branches, .. } => branches[0].condition.clone(),
                _ => unreachable!(),
            }
        };
        assert_eq!(eval_condition(&cond("1 == 1"), &globals), Some(true));
        assert_eq!(eval_condition(&cond("\"a\" != \"a\""), &globals), Some(false));
        assert_eq!(eval_condition(&cond("not \"\""), &globals), Some(true));
        assert_eq!(eval_condition(&cond("x"), &globals), None);
    }
}
