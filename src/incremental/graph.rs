//! Template dependency graph.
//!
//! An edge `child -> parent` means `child` references `parent` through
//! `extends`, `include` or `import`. The graph is kept acyclic: self-loops
//! and edges that would close a cycle are rejected with a [`CycleError`].

use crate::error::CycleError;
use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    graph: StableDiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn template_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn node(&mut self, path: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(path) {
            return *idx;
        }
        let idx = self.graph.add_node(path.to_string());
        self.index.insert(path.to_string(), idx);
        idx
    }

    /// Add `child -> parent`. Returns false if the edge already existed.
    pub fn record_edge(&mut self, child: &str, parent: &str) -> Result<bool, CycleError> {
        if child == parent {
            return Err(CycleError {
                chain: vec![child.to_string(), child.to_string()],
            });
        }
        if let Some(path) = self.path_between(parent, child) {
            let mut chain = vec![child.to_string()];
            chain.extend(path);
            return Err(CycleError { chain });
        }
        let c = self.node(child);
        let p = self.node(parent);
        if self.graph.find_edge(c, p).is_some() {
            return Ok(false);
        }
        self.graph.add_edge(c, p, ());
        Ok(true)
    }

    pub fn remove_edge(&mut self, child: &str, parent: &str) -> bool {
        let (Some(&c), Some(&p)) = (self.index.get(child), self.index.get(parent)) else {
            return false;
        };
        match self.graph.find_edge(c, p) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    /// Make `parents` the exact dependency set of `child`. Edges that would
    /// close a cycle are skipped and the first such cycle is returned after
    /// all other edges are in place.
    pub fn replace_dependencies(
        &mut self,
        child: &str,
        parents: &BTreeSet<String>,
    ) -> Result<(), CycleError> {
        for old in self.dependencies(child) {
            if !parents.contains(&old) {
                self.remove_edge(child, &old);
            }
        }
        self.node(child);
        let mut first_cycle = None;
        for parent in parents {
            if let Err(cycle) = self.record_edge(child, parent) {
                first_cycle.get_or_insert(cycle);
            }
        }
        match first_cycle {
            Some(cycle) => Err(cycle),
            None => Ok(()),
        }
    }

    /// Drop the template's own dependency edges. The node itself stays
    /// while other templates still reference it.
    pub fn remove_template(&mut self, path: &str) {
        let Some(&idx) = self.index.get(path) else {
            return;
        };
        for parent in self.dependencies(path) {
            self.remove_edge(path, &parent);
        }
        let referenced = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .next()
            .is_some();
        if !referenced {
            self.graph.remove_node(idx);
            self.index.remove(path);
        }
    }

    fn neighbors(&self, path: &str, dir: Direction) -> BTreeSet<String> {
        let Some(&idx) = self.index.get(path) else {
            return BTreeSet::new();
        };
        self.graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Templates that directly reference `path`.
    pub fn dependents(&self, path: &str) -> BTreeSet<String> {
        self.neighbors(path, Direction::Incoming)
    }

    /// Templates `path` directly references.
    pub fn dependencies(&self, path: &str) -> BTreeSet<String> {
        self.neighbors(path, Direction::Outgoing)
    }

    fn reachable(&self, path: &str, dir: Direction, max_depth: usize) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(path) else {
            return seen;
        };
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((idx, depth)) = queue.pop_front() {
            if depth == max_depth {
                continue;
            }
            for next in self.graph.neighbors_directed(idx, dir) {
                if next != start && seen.insert(self.graph[next].clone()) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        seen
    }

    /// Everything that depends on `path`, following at most `max_depth` edges.
    pub fn transitive_dependents(&self, path: &str, max_depth: usize) -> BTreeSet<String> {
        self.reachable(path, Direction::Incoming, max_depth)
    }

    pub fn transitive_dependencies(&self, path: &str) -> BTreeSet<String> {
        self.reachable(path, Direction::Outgoing, usize::MAX)
    }

    /// Shortest dependency path `from -> ... -> to`, both ends included.
    fn path_between(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let (&start, &goal) = (self.index.get(from)?, self.index.get(to)?);
        if !has_path_connecting(&self.graph, start, goal, None) {
            return None;
        }
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            if idx == goal {
                break;
            }
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if next != start && !prev.contains_key(&next) {
                    prev.insert(next, idx);
                    queue.push_back(next);
                }
            }
        }
        let mut chain = vec![self.graph[goal].clone()];
        let mut cur = goal;
        while let Some(&p) = prev.get(&cur) {
            chain.push(self.graph[p].clone());
            cur = p;
        }
        chain.reverse();
        Some(chain)
    }

    /// A cycle, if the graph has one. Edges are checked on insertion, so
    /// this only finds cycles in graphs built some other way.
    pub fn find_cycle(&self) -> Option<CycleError> {
        tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| scc.len() > 1)
            .map(|scc| {
                let mut chain: Vec<String> = scc.iter().rev().map(|n| self.graph[*n].clone()).collect();
                if let Some(first) = chain.first().cloned() {
                    chain.push(first);
                }
                CycleError { chain }
            })
    }

    /// `paths` ordered so every template comes after the templates it
    /// depends on. Ties keep lexical order.
    pub fn dependency_order<'a>(&self, paths: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let wanted: BTreeSet<&String> = paths.into_iter().collect();
        let mut ordered: Vec<String> = match toposort(&self.graph, None) {
            Ok(order) => order
                .into_iter()
                .rev()
                .map(|n| self.graph[n].clone())
                .filter(|p| wanted.contains(p))
                .collect(),
            Err(_) => Vec::new(),
        };
        for p in wanted {
            if !ordered.contains(p) {
                ordered.push(p.clone());
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn chain() -> DependencyGraph {
        // page -> layout -> base, page -> nav
        let mut g = DependencyGraph::new();
        g.record_edge("layout.tpl", "base.tpl").unwrap();
        g.record_edge("page.tpl", "layout.tpl").unwrap();
        g.record_edge("page.tpl", "nav.tpl").unwrap();
        g
    }

    #[test]
    fn edges_are_bidirectional() {
        let g = chain();
        assert_eq!(g.dependents("base.tpl"), set(&["layout.tpl"]));
        assert_eq!(g.dependencies("page.tpl"), set(&["layout.tpl", "nav.tpl"]));
        assert_eq!(g.transitive_dependents("base.tpl", 16), set(&["layout.tpl", "page.tpl"]));
        assert_eq!(g.transitive_dependents("base.tpl", 1), set(&["layout.tpl"]));
        assert_eq!(
            g.transitive_dependencies("page.tpl"),
            set(&["layout.tpl", "base.tpl", "nav.tpl"])
        );
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let mut g = chain();
        assert_eq!(g.record_edge("page.tpl", "nav.tpl"), Ok(false));
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn self_loops_and_cycles_are_rejected() {
        let mut g = chain();
        let err = g.record_edge("a.tpl", "a.tpl").unwrap_err();
        assert_eq!(err.chain, vec!["a.tpl", "a.tpl"]);

        let err = g.record_edge("base.tpl", "page.tpl").unwrap_err();
        assert_eq!(err.chain, vec!["base.tpl", "page.tpl", "layout.tpl", "base.tpl"]);
        assert!(g.find_cycle().is_none());
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn replace_dependencies_diffs_edges() {
        let mut g = chain();
        g.replace_dependencies("page.tpl", &set(&["nav.tpl", "footer.tpl"]))
            .unwrap();
        assert_eq!(g.dependencies("page.tpl"), set(&["footer.tpl", "nav.tpl"]));
        assert!(g.dependents("layout.tpl").is_empty());

        let err = g
            .replace_dependencies("base.tpl", &set(&["layout.tpl", "x.tpl"]))
            .unwrap_err();
        assert!(err.involves("layout.tpl"));
        assert_eq!(g.dependencies("base.tpl"), set(&["x.tpl"]));
    }

    #[test]
    fn removing_a_template_keeps_referenced_nodes() {
        let mut g = chain();
        g.remove_template("layout.tpl");
        assert!(g.dependencies("layout.tpl").is_empty());
        assert!(g.contains("layout.tpl"));
        assert_eq!(g.dependents("layout.tpl"), set(&["page.tpl"]));

        g.remove_template("page.tpl");
        assert!(!g.contains("page.tpl"));
    }

    #[test]
    fn dependency_order_puts_parents_first() {
        let g = chain();
        let paths = set(&["page.tpl", "base.tpl", "layout.tpl", "unknown.tpl"]);
        let order = g.dependency_order(&paths);
        let pos = |p: &str| order.iter().position(|x| x == p).unwrap();
        assert!(pos("base.tpl") < pos("layout.tpl"));
        assert!(pos("layout.tpl") < pos("page.tpl"));
        assert_eq!(order.len(), 4);
    }
}
