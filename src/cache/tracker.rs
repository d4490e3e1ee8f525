use std::collections::{BTreeMap, BTreeSet};

/// `key -> dependencies` and its inverse `dependency -> keys`.
///
/// Both maps are updated together, so for every key `k` and dependency `d`,
/// `d ∈ deps(k)` iff `k ∈ keys(d)`.
#[derive(Debug, Default, Clone)]
pub struct DependencyTracker {
    by_key: BTreeMap<String, BTreeSet<String>>,
    by_dependency: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependency set of `key`.
    pub fn track(&mut self, key: &str, dependencies: &BTreeSet<String>) {
        self.untrack(key);
        if dependencies.is_empty() {
            return;
        }
        for dep in dependencies {
            self.by_dependency
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.by_key.insert(key.to_string(), dependencies.clone());
    }

    /// Forget `key`; returns the dependencies it had.
    pub fn untrack(&mut self, key: &str) -> BTreeSet<String> {
        let Some(deps) = self.by_key.remove(key) else {
            return BTreeSet::new();
        };
        for dep in &deps {
            if let Some(keys) = self.by_dependency.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_dependency.remove(dep);
                }
            }
        }
        deps
    }

    pub fn keys_for(&self, dependency: &str) -> Vec<String> {
        self.by_dependency
            .get(dependency)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependencies_of(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.by_key.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.by_key.keys()
    }

    pub fn tracked_keys(&self) -> usize {
        self.by_key.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn inverse_map_follows_tracking() {
        let mut t = DependencyTracker::new();
        t.track("k1", &set(&["base.tpl", "nav.tpl"]));
        t.track("k2", &set(&["base.tpl"]));
        assert_eq!(t.keys_for("base.tpl"), vec!["k1", "k2"]);
        assert_eq!(t.keys_for("nav.tpl"), vec!["k1"]);

        t.track("k1", &set(&["footer.tpl"]));
        assert_eq!(t.keys_for("base.tpl"), vec!["k2"]);
        assert!(t.keys_for("nav.tpl").is_empty());

        assert_eq!(t.untrack("k2"), set(&["base.tpl"]));
        assert!(t.keys_for("base.tpl").is_empty());
        assert_eq!(t.tracked_keys(), 1);
    }
}
