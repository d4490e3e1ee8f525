use super::{OptimizationPass, PassContext};
use crate::compiler::analysis::StaticAnalysis;
use crate::compiler::ast::*;
use crate::compiler::filters;
use crate::error::CompileError;
use crate::types::OptimizationLevel;

/// Combines adjacent argument-less filter pairs that have a fused builtin.
pub struct FilterChainFusion;

impl OptimizationPass for FilterChainFusion {
    fn name(&self) -> &'static str {
        "filter-fusion"
    }

    fn min_level(&self) -> OptimizationLevel {
        OptimizationLevel::Advanced
    }

    fn run(
        &self,
        ast: &Ast,
        _analysis: &StaticAnalysis,
        _ctx: &PassContext<'_>,
    ) -> Result<Ast, CompileError> {
        let mut out = apply(&mut Fuser, ast)?;
        for shared in &mut out.shared {
            shared.filters = fuse(&shared.filters);
        }
        Ok(out)
    }
}

/// Greedy left-to-right fusion.
pub(crate) fn fuse(chain: &[FilterCall]) -> Vec<FilterCall> {
    let mut out: Vec<FilterCall> = Vec::with_capacity(chain.len());
    let mut i = 0;
    while i < chain.len() {
        let current = &chain[i];
        if let Some(next) = chain.get(i + 1) {
            if current.args.is_empty() && next.args.is_empty() {
                if let Some(name) = filters::fused(&current.name, &next.name) {
                    out.push(FilterCall::named(name, current.span.join(next.span)));
                    i += 2;
                    continue;
                }
            }
        }
        out.push(current.clone());
        i += 1;
    }
    out
}

struct Fuser;

impl Transform for Fuser {
    fn node(&mut self, src: &Ast, out: &mut Ast, id: NodeId) -> Result<Vec<NodeId>, CompileError> {
        let new = copy_node(self, src, out, id)?;
        if let NodeKind::FilterApplication { filters, .. } = &mut out.node_mut(new).kind {
            if filters.len() > 1 {
                *filters = fuse(filters);
            }
        }
        Ok(vec![new])
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;

    fn chain_names(ast: &Ast) -> Vec<Vec<String>> {
        ast.root
            .iter()
            .filter_map(|id| match &ast.node(*id).kind {
                NodeKind::FilterApplication { filters, .. } => {
                    Some(filters.iter().map(|f| f.name.clone()).collect())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fuses_known_pairs() {
        let ast = Fixture::new().run(
            &FilterChainFusion,
            "{{ a | trim | upper }}{{ b | lower | trim | length }}{{ c | upper | lower }}",
        );
        assert_eq!(
            chain_names(&ast),
            vec![
                vec!["trim_upper".to_string()],
                vec!["lower_trim".to_string(), "length".to_string()],
                vec!["upper".to_string(), "lower".to_string()],
            ]
        );
    }

    #[test]
    fn filters_with_arguments_are_not_fused() {
        let ast = Fixture::new().run(&FilterChainFusion, "{{ a | trim | replace(\"a\", \"b\") }}");
        assert_eq!(
            chain_names(&ast),
            vec![vec!["trim".to_string(), "replace".to_string()]]
        );
    }
}
