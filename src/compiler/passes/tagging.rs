//! Annotation passes. These never change what a tree renders; they only set
//! [`NodeTags`] for the code generator and the tiering fast path.

use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::error::CompileError;
use crate::types::OptimizationLevel;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Shapes smaller than this (in nodes) are not worth specializing.
const MIN_SHAPE_NODES: usize = 3;

/// Marks the analyzer's hot paths.
pub struct HotPathTagging;

impl OptimizationPass for HotPathTagging {
    fn name(&self) -> &'static str {
        "hot-path-tagging"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Advanced
    }

    fn run(
        &self,
        ast: &Ast,
        analysis: &StaticAnalysis,
        _ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        let hot: HashSet<NodeId> = analysis.hot_paths.iter().copied().collect();
        apply(
            &mut Tagger(|id: NodeId, _: &Ast, tags: &mut NodeTags| {
                if hot.contains(&id) {
                    tags.hot = true;
                }
            }),
            ast,
        )
    }
}

/// Marks loops over a context list whose body is straight-line output.
pub struct VectorizationHints;

impl OptimizationPass for VectorizationHints {
    fn name(&self) -> &'static str {
        "vectorize-hints"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Maximum
    }

    fn run(
        &self,
        ast: &Ast,
        _analysis: &StaticAnalysis,
        _ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        apply(
            &mut Tagger(|id: NodeId, src: &Ast, tags: &mut NodeTags| {
                if let NodeKind::Loop {
                    iterable: Iterable::Var(_),
                    body,
                    ..
                } = &src.node(id).kind
                {
                    let straight_line = !body.is_empty()
                        && body.iter().all(|child| {
                            matches!(
                                src.node(*child).kind,
                                NodeKind::Literal { .. }
                                    | NodeKind::VariableRef { .. }
                                    | NodeKind::FilterApplication { .. }
                                    | NodeKind::Shared { .. }
                            )
                        });
                    tags.vectorizable = straight_line;
                }
            }),
            ast,
        )
    }
}

/// Tags subtrees whose structure recurs in the template with a shared
/// shape id, so the fast path can reuse one specialization for all of them.
pub struct ShapeSpecialization;

impl OptimizationPass for ShapeSpecialization {
    fn name(&self) -> &'static str {
        "shape-specialization"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Maximum
    }

    fn run(
        &self,
        ast: &Ast,
        _analysis: &StaticAnalysis,
        _ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        let mut signatures: HashMap<NodeId, String> = HashMap::new();
        let mut occurrences: HashMap<String, usize> = HashMap::new();
        for id in ast.preorder() {
            if ast.subtree_size(id) < MIN_SHAPE_NODES {
                continue;
            }
            let sig = signature(ast, id);
            *occurrences.entry(sig.clone()).or_insert(0) += 1;
            signatures.insert(id, sig);
        }

        apply(
            &mut Tagger(|id: NodeId, _: &Ast, tags: &mut NodeTags| {
                if let Some(sig) = signatures.get(&id) {
                    if occurrences.get(sig).copied().unwrap_or(0) >= 2 {
                        tags.shape = Some(shape_id(sig));
                    }
                }
            }),
            ast,
        )
    }
}

/// Structure of a subtree, ignoring text, names, and spans.
fn signature(ast: &Ast, id: NodeId) -> String {
    let node = ast.node(id);
    let mut sig = node.kind.label().to_string();
    if let NodeKind::FilterApplication { expr, filters } = &node.kind {
        sig.push_str(&format!("/{}", expr.atoms.len()));
        for f in filters {
            sig.push(':');
            sig.push_str(&f.name);
        }
    }
    let children = node.kind.child_sequences();
    if !children.is_empty() {
        sig.push('(');
        for (i, seq) in children.iter().enumerate() {
            if i > 0 {
                sig.push(';');
            }
            let parts: Vec<String> = seq.iter().map(|c| signature(ast, *c)).collect();
            sig.push_str(&parts.join(","));
        }
        sig.push(')');
    }
    sig
}

fn shape_id(signature: &str) -> u64 {
    let digest = Sha256::digest(signature.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Copies the tree, letting `F` adjust each node's tags.
struct Tagger<F>(F);

impl<F: FnMut(NodeId, &Ast, &mut NodeTags)> Transform for Tagger<F> {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        let new = copy_node(self, src, out, id)?;
        let mut tags = out.node(new).tags;
        (self.0)(id, src, &mut tags);
        out.node_mut(new).tags = tags;
        Ok(vec![new])
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;

    fn tags_of(ast: &Ast) -> Vec<(&'static str, NodeTags)> {
        ast.preorder()
            .into_iter()
            .map(|id| (ast.node(id).kind.label(), ast.node(id).tags))
            .collect()
    }

    #[test]
    fn tags_hot_loops_and_long_chains() {
        let ast = Fixture::new().run(
            &HotPathTagging,
            "{% for x in xs %}{{ x }}{% endfor %}{{ a | trim | upper | lower | reverse }}{{ b | trim }}",
        );
        let hot: Vec<&str> = tags_of(&ast)
            .into_iter()
            .filter(|(_, t)| t.hot)
            .map(|(label, _)| label)
            .collect();
        assert_eq!(hot, vec!["for", "filter"]);
    }

    #[test]
    fn vectorizes_straight_line_list_loops() {
        let ast = Fixture::new().run(
            &VectorizationHints,
            "{% for x in xs %}<li>{{ x | upper }}</li>{% endfor %}{% for y in ys %}{% if y %}y{% endif %}{% endfor %}{% for i in range(3) %}{{ i }}{% endfor %}",
        );
        let loops: Vec<bool> = tags_of(&ast)
            .into_iter()
            .filter(|(label, _)| *label == "for")
            .map(|(_, t)| t.vectorizable)
            .collect();
        assert_eq!(loops, vec![true, false, false]);
    }

    #[test]
    fn recurring_shapes_share_an_id() {
        let ast = Fixture::new().run(
            &ShapeSpecialization,
            "{% if a %}<b>{{ a }}</b>{% endif %}{% if c %}<i>{{ c }}</i>{% endif %}{% for x in xs %}{{ x }}{% endfor %}",
        );
        let shapes: Vec<Option<u64>> = ast.root.iter().map(|id| ast.node(*id).tags.shape).collect();
        assert!(shapes[0].is_some());
        assert_eq!(shapes[0], shapes[1]);
        assert_eq!(shapes[2], None);
    }

    #[test]
    fn tagging_preserves_structure() {
        let src = "{% for x in xs %}{{ x | trim | upper | lower | title }}{% endfor %}";
        let fixture = Fixture::new();
        let before = crate::compiler::parser::parse("t.tpl", src).unwrap();
        let after = fixture.run(&HotPathTagging, src);
        assert_eq!(before.outline(), after.outline());
    }
}
