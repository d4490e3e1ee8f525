//! Inheritance flattening.
//!
//! Resolves a template's `extends` chain into one self-contained tree: the
//! root-most ancestor supplies the document, each block is taken from the
//! most-derived template that defines it, and macro definitions and imports
//! declared at the top level of derived templates are kept in front.

use super::ast::*;
use crate::error::{CompileError, CycleError, ParseError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Supplies parsed trees for referenced templates.
pub trait AstProvider {
    /// `Ok(None)` when no template is registered under `path`.
    fn ast(&self, path: &str) -> Result<Option<Arc<Ast>>, ParseError>;
}

impl AstProvider for BTreeMap<String, Arc<Ast>> {
    fn ast(&self, path: &str) -> Result<Option<Arc<Ast>>, ParseError> {
        Ok(self.get(path).cloned())
    }
}

/// Flatten `ast` (parsed from `path`). Trees without `extends` are returned
/// unchanged.
pub fn flatten(path: &str, ast: &Ast, provider: &dyn AstProvider) -> Result<Ast, CompileError> {
    if ast.extends.is_none() {
        return Ok(ast.clone());
    }

    let mut chain = vec![path.to_string()];
    let mut parents: Vec<Arc<Ast>> = Vec::new();
    let mut next = ast.extends.clone();

    while let Some(reference) = next {
        if chain.contains(&reference.target) {
            chain.push(reference.target);
            return Err(CycleError { chain }.into());
        }
        let parent = provider
            .ast(&reference.target)?
            .ok_or_else(|| CompileError::MissingTemplate {
                path: chain.last().cloned().unwrap_or_default(),
                target: reference.target.clone(),
            })?;
        chain.push(reference.target);
        next = parent.extends.clone();
        parents.push(parent);
    }

    let levels: Vec<&Ast> = std::iter::once(ast)
        .chain(parents.iter().map(|p| p.as_ref()))
        .collect();

    let mut overrides: HashMap<String, (usize, NodeId)> = HashMap::new();
    for (level, tree) in levels.iter().enumerate() {
        for (name, id) in tree.blocks() {
            overrides.entry(name).or_insert((level, id));
        }
    }

    let flattener = Flattener {
        levels: &levels,
        overrides,
    };
    let base = levels.len() - 1;
    let mut out = Ast::new();
    let mut root = Vec::new();

    for level in (0..base).rev() {
        for &id in &levels[level].root {
            if matches!(
                levels[level].node(id).kind,
                NodeKind::Macro { .. } | NodeKind::Import { .. }
            ) {
                root.push(flattener.copy(&mut out, level, id));
            }
        }
    }
    for &id in &levels[base].root {
        root.push(flattener.copy(&mut out, base, id));
    }
    out.root = root;

    tracing::debug!(
        template = %path,
        chain = %chain.join(" -> "),
        nodes = out.size(),
        "Flattened inheritance chain"
    );
    Ok(out)
}

struct Flattener<'a> {
    /// Index 0 is the template being flattened, the last entry its root ancestor.
    levels: &'a [&'a Ast],
    overrides: HashMap<String, (usize, NodeId)>,
}

impl Flattener<'_> {
    fn copy(&self, out: &mut Ast, level: usize, id: NodeId) -> NodeId {
        let node = self.levels[level].node(id);
        if let NodeKind::Block { name, .. } = &node.kind {
            if let Some(&(o_level, o_id)) = self.overrides.get(name) {
                if (o_level, o_id) != (level, id) {
                    return self.copy(out, o_level, o_id);
                }
            }
        }
        let kind = map_children(&node.kind, |seq| {
            seq.iter().map(|child| self.copy(out, level, *child)).collect()
        });
        out.push(Node {
            kind,
            span: node.span,
            tags: node.tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;

    fn registry(templates: &[(&str, &str)]) -> BTreeMap<String, Arc<Ast>> {
        templates
            .iter()
            .map(|(path, src)| (path.to_string(), Arc::new(parse(path, src).unwrap())))
            .collect()
    }

    fn texts(ast: &Ast) -> Vec<String> {
        ast.preorder()
            .into_iter()
            .filter_map(|id| match &ast.node(id).kind {
                NodeKind::Literal { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn child_block_overrides_parent() {
        let reg = registry(&[
            ("base.tpl", "<main>{% block content %}A{% endblock %}</main>"),
            ("child.tpl", "{% extends \"base.tpl\" %}{% block content %}B{% endblock %}"),
        ]);
        let flat = flatten("child.tpl", &reg["child.tpl"], &reg).unwrap();
        assert!(flat.extends.is_none());
        assert_eq!(texts(&flat), vec!["<main>", "B", "</main>"]);
    }

    #[test]
    fn most_derived_block_wins_across_levels() {
        let reg = registry(&[
            ("base.tpl", "{% block a %}base-a{% endblock %}|{% block b %}base-b{% endblock %}"),
            ("mid.tpl", "{% extends \"base.tpl\" %}{% block a %}mid-a{% endblock %}{% block b %}mid-b{% endblock %}"),
            ("leaf.tpl", "{% extends \"mid.tpl\" %}{% block b %}leaf-b{% endblock %}"),
        ]);
        let flat = flatten("leaf.tpl", &reg["leaf.tpl"], &reg).unwrap();
        assert_eq!(texts(&flat), vec!["mid-a", "|", "leaf-b"]);
    }

    #[test]
    fn nested_blocks_resolve_inside_overrides() {
        let reg = registry(&[
            ("base.tpl", "{% block outer %}[{% block inner %}x{% endblock %}]{% endblock %}"),
            ("child.tpl", "{% extends \"base.tpl\" %}{% block inner %}y{% endblock %}"),
        ]);
        let flat = flatten("child.tpl", &reg["child.tpl"], &reg).unwrap();
        assert_eq!(texts(&flat), vec!["[", "y", "]"]);
    }

    #[test]
    fn child_macros_and_imports_are_kept() {
        let reg = registry(&[
            ("base.tpl", "{% block body %}{% endblock %}"),
            ("child.tpl", "{% extends \"base.tpl\" %}{% import \"forms.tpl\" as f %}{% macro m() %}M{% endmacro %}{% block body %}{% call m() %}{% endblock %}"),
        ]);
        let flat = flatten("child.tpl", &reg["child.tpl"], &reg).unwrap();
        let labels: Vec<&str> = flat.root.iter().map(|id| flat.node(*id).kind.label()).collect();
        assert_eq!(labels, vec!["import", "macro", "block"]);
    }

    #[test]
    fn cycles_are_reported_with_the_chain() {
        let reg = registry(&[
            ("a.tpl", "{% extends \"b.tpl\" %}"),
            ("b.tpl", "{% extends \"a.tpl\" %}"),
        ]);
        match flatten("a.tpl", &reg["a.tpl"], &reg) {
            Err(CompileError::Cycle(err)) => {
                assert_eq!(err.chain, vec!["a.tpl", "b.tpl", "a.tpl"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn missing_parent_is_reported() {
        let reg = registry(&[("child.tpl", "{% extends \"nope.tpl\" %}")]);
        let err = flatten("child.tpl", &reg["child.tpl"], &reg).unwrap_err();
        assert!(matches!(err, CompileError::MissingTemplate { ref target, .. } if target == "nope.tpl"));
    }

    #[test]
    fn templates_without_extends_pass_through() {
        let reg = registry(&[("plain.tpl", "hello {{ name }}")]);
        let flat = flatten("plain.tpl", &reg["plain.tpl"], &reg).unwrap();
        assert_eq!(flat, *reg["plain.tpl"]);
    }
}
