//! Static analysis over a template AST.
//!
//! The analysis is read-only and derived: every pass re-runs it on the tree
//! it produced, so annotations always describe the current arena.

use super::ast::*;
use super::filters::is_known as is_known_filter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Filter chains longer than this are hot paths.
const HOT_FILTER_CHAIN: usize = 3;

const LOOP_WEIGHT: u32 = 5;
const CONDITIONAL_WEIGHT: u32 = 2;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticAnalysis {
    /// Root names read from the render context.
    pub free_variables: BTreeSet<String>,
    pub filters: BTreeSet<String>,
    pub includes: BTreeSet<String>,
    pub imports: BTreeSet<String>,
    pub extends: Option<String>,
    pub macros: BTreeSet<String>,
    pub complexity: u32,
    pub hot_paths: Vec<NodeId>,
    /// Nodes whose output does not depend on the render context.
    pub constants: BTreeSet<NodeId>,
    /// Nodes that can never produce output.
    pub dead_code: BTreeSet<NodeId>,
    #[serde(with = "node_map")]
    pub loop_bounds: BTreeMap<NodeId, Option<u64>>,
}

impl StaticAnalysis {
    pub fn analyze(ast: &Ast) -> Self {
        let mut out = StaticAnalysis {
            extends: ast.extends.as_ref().map(|r| r.target.clone()),
            ..Default::default()
        };
        let mut scope = Vec::new();
        out.walk(ast, &ast.root, &mut scope);

        for shared in &ast.shared {
            out.note_expr(&shared.expr, &scope);
            out.filters
                .extend(shared.filters.iter().map(|f| f.name.clone()));
        }
        out
    }

    /// Every template referenced through `extends`, `include` or `import`.
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.includes
            .iter()
            .chain(self.imports.iter())
            .chain(self.extends.iter())
            .cloned()
            .collect()
    }

    pub fn is_constant(&self, id: NodeId) -> bool {
        self.constants.contains(&id)
    }

    pub fn is_dead(&self, id: NodeId) -> bool {
        self.dead_code.contains(&id)
    }

    /// Estimated iteration count; `None` when the loop is not bounded
    /// statically or `id` is not a loop.
    pub fn loop_bound(&self, id: NodeId) -> Option<u64> {
        self.loop_bounds.get(&id).copied().flatten()
    }

    fn walk(&mut self, ast: &Ast, seq: &[NodeId], scope: &mut Vec<String>) {
        let mut terminated = false;
        for &id in seq {
            if terminated {
                self.dead_code.insert(id);
                continue;
            }
            self.visit(ast, id, scope);
            if matches!(ast.node(id).kind, NodeKind::Stop) {
                terminated = true;
            }
        }
    }

    fn visit(&mut self, ast: &Ast, id: NodeId, scope: &mut Vec<String>) {
        let node = ast.node(id);
        self.complexity += 1;

        match &node.kind {
            NodeKind::Literal { text } => {
                if text.is_empty() {
                    self.dead_code.insert(id);
                } else {
                    self.constants.insert(id);
                }
            }
            NodeKind::VariableRef { path } => {
                self.note_path(path, scope);
                if path.is_private() {
                    self.constants.insert(id);
                }
            }
            NodeKind::FilterApplication { expr, filters } => {
                self.note_expr(expr, scope);
                self.complexity += filters.len() as u32;
                self.filters.extend(filters.iter().map(|f| f.name.clone()));
                if filters.len() > HOT_FILTER_CHAIN {
                    self.hot_paths.push(id);
                }
                if expr.is_constant() && filters.iter().all(|f| is_known_filter(&f.name)) {
                    self.constants.insert(id);
                }
            }
            NodeKind::Conditional {
                branches,
                otherwise,
            } => {
                self.complexity += CONDITIONAL_WEIGHT;
                for branch in branches {
                    for expr in branch.condition.exprs() {
                        self.note_expr(expr, scope);
                    }
                }
                if branches.iter().all(|b| b.condition.is_constant()) {
                    self.constants.insert(id);
                }
                for branch in branches {
                    self.walk(ast, &branch.body, scope);
                }
                self.walk(ast, otherwise, scope);
            }
            NodeKind::Loop {
                binding,
                iterable,
                body,
            } => {
                self.complexity += LOOP_WEIGHT;
                self.hot_paths.push(id);
                let bound = match iterable {
                    Iterable::Range { start, end } => Some(end.saturating_sub(*start).max(0) as u64),
                    Iterable::Var(path) => {
                        self.note_path(path, scope);
                        None
                    }
                };
                self.loop_bounds.insert(id, bound);
                if bound == Some(0) {
                    self.dead_code.insert(id);
                    return;
                }
                scope.push(binding.clone());
                self.walk(ast, body, scope);
                scope.pop();
            }
            NodeKind::Include { target } => {
                self.includes.insert(target.clone());
            }
            NodeKind::Import { target, .. } => {
                self.imports.insert(target.clone());
            }
            NodeKind::Macro { name, params, body } => {
                self.macros.insert(name.clone());
                let depth = scope.len();
                scope.extend(params.iter().cloned());
                self.walk(ast, body, scope);
                scope.truncate(depth);
            }
            NodeKind::Call { args, .. } => {
                for arg in args {
                    self.note_expr(arg, scope);
                }
            }
            NodeKind::Block { body, .. } => self.walk(ast, body, scope),
            NodeKind::Stop | NodeKind::Shared { .. } => {}
        }
    }

    fn note_expr(&mut self, expr: &Expr, scope: &[String]) {
        for path in expr.vars() {
            self.note_path(path, scope);
        }
    }

    fn note_path(&mut self, path: &VarPath, scope: &[String]) {
        if !path.is_private() && !scope.iter().any(|b| *b == path.root) {
            self.free_variables.insert(path.root.clone());
        }
    }
}

/// Serialize node-keyed maps as pairs so the encoding does not depend on
/// map-key support for newtypes.
mod node_map {
    use super::NodeId;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<NodeId, Option<u64>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(NodeId, Option<u64>)> = map.iter().map(|(k, v)| (*k, *v)).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<NodeId, Option<u64>>, D::Error> {
        let pairs: Vec<(NodeId, Option<u64>)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
