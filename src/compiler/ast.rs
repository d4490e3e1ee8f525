//! Index-arena template AST.
//!
//! Nodes live in a flat `Vec` and reference their children by [`NodeId`].
//! Trees are immutable once built: optimization passes copy the reachable
//! nodes into a fresh arena (see [`Transform`]) instead of mutating in place.

use crate::error::CompileError;
use crate::types::Span;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── Expressions ──────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("none"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Dotted variable path such as `user.address.city`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarPath {
    pub root: String,
    pub attrs: Vec<String>,
}

impl VarPath {
    pub fn simple(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            attrs: Vec::new(),
        }
    }

    /// Private variables are compile-time globals, never read from the context.
    pub fn is_private(&self) -> bool {
        self.root.starts_with('_')
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for attr in &self.attrs {
            write!(f, ".{attr}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Atom {
    Lit(Literal),
    Var(VarPath),
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Lit(lit) => write!(f, "{lit}"),
            Atom::Var(path) => write!(f, "{path}"),
        }
    }
}

/// One or more atoms joined by `~` (string concatenation).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub atoms: Vec<Atom>,
}

impl Expr {
    pub fn var(path: VarPath) -> Self {
        Self {
            atoms: vec![Atom::Var(path)],
        }
    }

    pub fn lit(lit: Literal) -> Self {
        Self {
            atoms: vec![Atom::Lit(lit)],
        }
    }

    pub fn vars(&self) -> impl Iterator<Item = &VarPath> {
        self.atoms.iter().filter_map(|a| match a {
            Atom::Var(p) => Some(p),
            Atom::Lit(_) => None,
        })
    }

    /// True when every atom is a literal or a private (compile-time) variable.
    pub fn is_constant(&self) -> bool {
        self.atoms.iter().all(|a| match a {
            Atom::Lit(_) => true,
            Atom::Var(p) => p.is_private(),
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, atom) in self.atoms.iter().enumerate() {
            if i > 0 {
                f.write_str(" ~ ")?;
            }
            write!(f, "{atom}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Literal>,
    pub span: Span,
}

impl FilterCall {
    pub fn named(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            span,
        }
    }
}

impl fmt::Display for FilterCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

/// Span-insensitive identity of an expression plus filter chain.
pub fn expression_key(expr: &Expr, filters: &[FilterCall]) -> String {
    let mut key = expr.to_string();
    for filter in filters {
        key.push_str(" | ");
        key.push_str(&filter.to_string());
    }
    key
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub negate: bool,
    pub lhs: Expr,
    pub cmp: Option<(CmpOp, Expr)>,
}

impl Condition {
    pub fn exprs(&self) -> impl Iterator<Item = &Expr> {
        std::iter::once(&self.lhs).chain(self.cmp.as_ref().map(|(_, rhs)| rhs))
    }

    pub fn is_constant(&self) -> bool {
        self.exprs().all(Expr::is_constant)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Iterable {
    Var(VarPath),
    Range { start: i64, end: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: Condition,
    pub body: Vec<NodeId>,
}

// ─── Nodes ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Raw template text, emitted unescaped.
    Literal { text: String },
    /// `{{ path }}` without filters.
    VariableRef { path: VarPath },
    /// `{{ expr | f | g(x) }}`, or any output that is not a bare variable.
    FilterApplication {
        expr: Expr,
        filters: Vec<FilterCall>,
    },
    Conditional {
        branches: Vec<Branch>,
        otherwise: Vec<NodeId>,
    },
    Loop {
        binding: String,
        iterable: Iterable,
        body: Vec<NodeId>,
    },
    Include { target: String },
    Import { target: String, alias: String },
    Macro {
        name: String,
        params: Vec<String>,
        body: Vec<NodeId>,
    },
    Call {
        namespace: Option<String>,
        name: String,
        args: Vec<Expr>,
    },
    Block { name: String, body: Vec<NodeId> },
    /// `{% stop %}`: ends rendering of the current template.
    Stop,
    /// Read of a hoisted common subexpression.
    Shared { slot: u32 },
}

impl NodeKind {
    /// Every child sequence owned by this node, in source order.
    pub fn child_sequences(&self) -> Vec<&[NodeId]> {
        match self {
            NodeKind::Conditional {
                branches,
                otherwise,
            } => branches
                .iter()
                .map(|b| b.body.as_slice())
                .chain(std::iter::once(otherwise.as_slice()))
                .collect(),
            NodeKind::Loop { body, .. }
            | NodeKind::Macro { body, .. }
            | NodeKind::Block { body, .. } => vec![body.as_slice()],
            _ => Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Literal { .. } => "literal",
            NodeKind::VariableRef { .. } => "variable",
            NodeKind::FilterApplication { .. } => "filter",
            NodeKind::Conditional { .. } => "if",
            NodeKind::Loop { .. } => "for",
            NodeKind::Include { .. } => "include",
            NodeKind::Import { .. } => "import",
            NodeKind::Macro { .. } => "macro",
            NodeKind::Call { .. } => "call",
            NodeKind::Block { .. } => "block",
            NodeKind::Stop => "stop",
            NodeKind::Shared { .. } => "shared",
        }
    }
}

/// Optimizer annotations that travel with a node through later passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTags {
    pub hot: bool,
    pub vectorizable: bool,
    /// Structural shape shared with at least one other subtree.
    pub shape: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    pub tags: NodeTags,
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self {
            kind,
            span,
            tags: NodeTags::default(),
        }
    }
}

/// Reference to another template made by `extends`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub target: String,
    pub span: Span,
}

/// Expression evaluated once in the program prologue and read by
/// [`NodeKind::Shared`] nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedExpr {
    pub expr: Expr,
    pub filters: Vec<FilterCall>,
}

// ─── Arena ────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
    pub root: Vec<NodeId>,
    pub extends: Option<Reference>,
    pub shared: Vec<SharedExpr>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty arena carrying over the template-level fields of `other`.
    pub fn empty_like(other: &Ast) -> Self {
        Self {
            nodes: Vec::with_capacity(other.nodes.len()),
            root: Vec::new(),
            extends: other.extends.clone(),
            shared: other.shared.clone(),
        }
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Arena length, including nodes no longer reachable from the root.
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    /// Reachable nodes in pre-order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.root.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            for seq in self.node(id).kind.child_sequences().into_iter().rev() {
                stack.extend(seq.iter().rev().copied());
            }
        }
        out
    }

    /// Number of reachable nodes.
    pub fn size(&self) -> usize {
        self.preorder().len()
    }

    pub fn subtree_size(&self, id: NodeId) -> usize {
        1 + self
            .node(id)
            .kind
            .child_sequences()
            .iter()
            .flat_map(|seq| seq.iter())
            .map(|child| self.subtree_size(*child))
            .sum::<usize>()
    }

    pub fn any_node(&self, mut pred: impl FnMut(&Node) -> bool) -> bool {
        self.preorder().into_iter().any(|id| pred(self.node(id)))
    }

    /// Deep-copy the subtree `id` of `src` into this arena.
    pub fn graft(&mut self, src: &Ast, id: NodeId) -> NodeId {
        let node = src.node(id);
        let kind = map_children(&node.kind, |seq| {
            seq.iter().map(|child| self.graft(src, *child)).collect()
        });
        self.push(Node {
            kind,
            span: node.span,
            tags: node.tags,
        })
    }

    /// Blocks defined anywhere in the tree, by name.
    pub fn blocks(&self) -> Vec<(String, NodeId)> {
        self.preorder()
            .into_iter()
            .filter_map(|id| match &self.node(id).kind {
                NodeKind::Block { name, .. } => Some((name.clone(), id)),
                _ => None,
            })
            .collect()
    }

    /// Debug outline, one node per line.
    pub fn outline(&self) -> String {
        fn walk(ast: &Ast, seq: &[NodeId], depth: usize, out: &mut String) {
            for id in seq {
                let node = ast.node(*id);
                let detail = match &node.kind {
                    NodeKind::Literal { text } => format!("{text:?}"),
                    NodeKind::VariableRef { path } => path.to_string(),
                    NodeKind::FilterApplication { expr, filters } => expression_key(expr, filters),
                    NodeKind::Loop {
                        binding, iterable, ..
                    } => format!("{binding} in {iterable:?}"),
                    NodeKind::Include { target } => target.clone(),
                    NodeKind::Import { target, alias } => format!("{target} as {alias}"),
                    NodeKind::Macro { name, params, .. } => format!("{name}({})", params.join(", ")),
                    NodeKind::Call {
                        namespace, name, ..
                    } => match namespace {
                        Some(ns) => format!("{ns}.{name}"),
                        None => name.clone(),
                    },
                    NodeKind::Block { name, .. } => name.clone(),
                    NodeKind::Shared { slot } => format!("slot {slot}"),
                    NodeKind::Conditional { .. } | NodeKind::Stop => String::new(),
                };
                out.push_str(&"  ".repeat(depth));
                out.push_str(node.kind.label());
                if !detail.is_empty() {
                    out.push(' ');
                    out.push_str(&detail);
                }
                out.push('\n');
                for child in node.kind.child_sequences() {
                    walk(ast, child, depth + 1, out);
                }
            }
        }
        let mut out = String::new();
        walk(self, &self.root, 0, &mut out);
        out
    }
}

/// Rebuild `kind` with each child sequence replaced by `f(sequence)`.
pub(crate) fn map_children(
    kind: &NodeKind,
    mut f: impl FnMut(&[NodeId]) -> Vec<NodeId>,
) -> NodeKind {
    match kind {
        NodeKind::Conditional {
            branches,
            otherwise,
        } => NodeKind::Conditional {
            branches: branches
                .iter()
                .map(|b| Branch {
                    condition: b.condition.clone(),
                    body: f(&b.body),
                })
                .collect(),
            otherwise: f(otherwise),
        },
        NodeKind::Loop {
            binding,
            iterable,
            body,
        } => NodeKind::Loop {
            binding: binding.clone(),
            iterable: iterable.clone(),
            body: f(body),
        },
        NodeKind::Macro { name, params, body } => NodeKind::Macro {
            name: name.clone(),
            params: params.clone(),
            body: f(body),
        },
        NodeKind::Block { name, body } => NodeKind::Block {
            name: name.clone(),
            body: f(body),
        },
        other => other.clone(),
    }
}

// ─── Tree-to-tree transforms ──────────────────────────────────

/// A pass-style rewrite from one arena into a new one.
///
/// The default `node` copies the node and recursively rewrites its
/// children; implementors override it for the node kinds they change and
/// fall back to [`copy_node`] otherwise. Returning an empty `Vec` drops the
/// node, returning several ids splices them in its place.
pub(crate) trait Transform {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        Ok(vec![copy_node(self, src, out, id)?])
    }

    fn sequence(
        &mut self,
        src: &Ast,
        out: &mut Ast,
        seq: &[NodeId],
    ) -> Result<Vec<NodeId>, CompileError> {
        let mut ids = Vec::with_capacity(seq.len());
        for id in seq {
            ids.extend(self.node(src, out, *id)?);
        }
        Ok(ids)
    }
}

/// Copy one node, rewriting its children through `t`.
pub(crate) fn copy_node<T: Transform + ?Sized>(
    t: &mut T,
    src: &Ast,
    out: &mut Ast,
    id: NodeId,
) -> Result<NodeId, CompileError> {
    let node = src.node(id);
    let mut failure = None;
    let kind = map_children(&node.kind, |seq| match t.sequence(src, out, seq) {
        Ok(ids) => ids,
        Err(e) => {
            failure.get_or_insert(e);
            Vec::new()
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(out.push(Node {
        kind,
        span: node.span,
        tags: node.tags,
    }))
}

/// Run `t` over the whole tree, producing a new arena.
pub(crate) fn apply<T: Transform>(t: &mut T, src: &Ast) -> Result<Ast, CompileError> {
    let mut out = Ast::empty_like(src);
    let root = t.sequence(src, &mut out, &src.root)?;
    out.root = root;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(ast: &mut Ast, text: &str) -> NodeId {
        ast.push(Node::new(
            NodeKind::Literal {
                text: text.to_string(),
            },
            Span::default(),
        ))
    }

    fn sample() -> Ast {
        let mut ast = Ast::new();
        let a = lit(&mut ast, "a");
        let b = lit(&mut ast, "b");
        let block = ast.push(Node::new(
            NodeKind::Block {
                name: "content".into(),
                body: vec![a, b],
            },
            Span::default(),
        ));
        let c = lit(&mut ast, "c");
        ast.root = vec![block, c];
        ast
    }

    #[test]
    fn preorder_visits_parents_first() {
        let ast = sample();
        let labels: Vec<&str> = ast
            .preorder()
            .into_iter()
            .map(|id| ast.node(id).kind.label())
            .collect();
        assert_eq!(labels, vec!["block", "literal", "literal", "literal"]);
        assert_eq!(ast.size(), 4);
        assert_eq!(ast.subtree_size(ast.root[0]), 3);
    }

    #[test]
    fn graft_copies_between_arenas() {
        let src = sample();
        let mut dst = Ast::new();
        let id = dst.graft(&src, src.root[0]);
        dst.root = vec![id];
        assert_eq!(dst.size(), 3);
        assert_eq!(dst.blocks().len(), 1);
    }

    struct DropLiteral(&'static str);

    impl Transform for DropLiteral {
        fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
            match &src.node(id).kind {
                NodeKind::Literal { text } if text == self.0 => Ok(Vec::new()),
                _ => Ok(vec![copy_node(self, src, out, id)?]),
            }
        }
    }

    #[test]
    fn transform_builds_new_arena_without_touching_source() {
        let src = sample();
        let out = apply(&mut DropLiteral("b"), &src).unwrap();
        assert_eq!(src.size(), 4);
        assert_eq!(out.size(), 3);
        assert!(out.outline().contains("literal \"a\""));
        assert!(!out.outline().contains("literal \"b\""));
    }

    #[test]
    fn expression_key_ignores_spans() {
        let expr = Expr::var(VarPath::simple("title"));
        let a = vec![FilterCall::named("upper", Span::new(0, 5))];
        let b = vec![FilterCall::named("upper", Span::new(40, 45))];
        assert_eq!(expression_key(&expr, &a), expression_key(&expr, &b));
        assert_eq!(expression_key(&expr, &a), "title | upper");
    }
}
