use pkgbuilderd_common::errors::*;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Lazily emits package names in dependency order.
///
/// Every name is yielded only after all of its dependencies have been
/// yielded. If a full pass over the pending entries makes no progress the
/// iterator stops and keeps the rest in [`DependencySorter::unresolved`].
#[derive(Debug)]
pub struct DependencySorter {
    pending: Vec<(String, BTreeSet<String>)>,
    emitted: HashSet<String>,
    ready: VecDeque<String>,
    unresolved: Vec<String>,
}

impl DependencySorter {
    pub fn new<I>(pkgs: I) -> DependencySorter
    where
        I: IntoIterator<Item = (String, BTreeSet<String>)>,
    {
        DependencySorter {
            pending: pkgs.into_iter().collect(),
            emitted: HashSet::new(),
            ready: VecDeque::new(),
            unresolved: Vec::new(),
        }
    }

    /// Names left over because of a cycle or a dependency outside the batch,
    /// in their original order. Only meaningful once the iterator is drained.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    fn scan(&mut self) -> bool {
        let mut progress = false;
        let mut i = 0;
        while i < self.pending.len() {
            let blocked = self.pending[i].1.iter()
                .any(|dep| !self.emitted.contains(dep));

            if blocked {
                i += 1;
            } else {
                let (name, _) = self.pending.remove(i);
                self.emitted.insert(name.clone());
                self.ready.push_back(name);
                progress = true;
            }
        }
        progress
    }
}

impl Iterator for DependencySorter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(name) = self.ready.pop_front() {
                return Some(name);
            }

            if self.pending.is_empty() {
                return None;
            }

            if !self.scan() {
                let names = self.pending.drain(..)
                    .map(|(name, _)| name)
                    .collect::<Vec<_>>();
                error!("Unable to resolve build order, cyclic or missing dependencies: {:?}", names);
                self.unresolved = names;
                return None;
            }
        }
    }
}

/// Full build order for a batch: the sorted names followed by whatever could
/// not be ordered, in input order.
pub fn build_order<I>(pkgs: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = (String, BTreeSet<String>)>,
{
    let mut sorter = DependencySorter::new(pkgs);
    let mut order = sorter.by_ref().collect::<Vec<_>>();
    let unresolved = sorter.unresolved().to_vec();
    order.extend(unresolved.iter().cloned());
    (order, unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, deps: &[&str]) -> (String, BTreeSet<String>) {
        (name.to_string(), deps.iter().map(|d| d.to_string()).collect())
    }

    /// Every in-batch dependency precedes its dependent.
    fn assert_ordered(order: &[String], pkgs: &[(String, BTreeSet<String>)]) {
        let idx = |name: &str| order.iter().position(|x| x == name);
        for (name, deps) in pkgs {
            let pos = idx(name).unwrap_or_else(|| panic!("{:?} is missing from {:?}", name, order));
            for dep in deps {
                if let Some(dep_pos) = idx(dep) {
                    assert!(dep_pos < pos, "{:?} is ordered before its dependency {:?}", name, dep);
                }
            }
        }
    }

    #[test]
    fn test_simple_order() {
        let pkgs = vec![pkg("b", &["a"]), pkg("a", &[])];
        let order = DependencySorter::new(pkgs).collect::<Vec<_>>();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_chain_order() {
        let pkgs = vec![
            pkg("d", &["c", "a"]),
            pkg("c", &["b"]),
            pkg("b", &["a"]),
            pkg("a", &[]),
            pkg("e", &[]),
        ];
        let (order, unresolved) = build_order(pkgs.clone());
        assert!(unresolved.is_empty());
        assert_eq!(order.len(), 5);
        assert_ordered(&order, &pkgs);
    }

    #[test]
    fn test_diamond_order() {
        let pkgs = vec![
            pkg("top", &["left", "right"]),
            pkg("left", &["base"]),
            pkg("right", &["base"]),
            pkg("base", &[]),
        ];
        let (order, _) = build_order(pkgs.clone());
        assert_ordered(&order, &pkgs);
        assert_eq!(order[0], "base");
        assert_eq!(order[3], "top");
    }

    #[test]
    fn test_cycle_terminates() {
        let pkgs = vec![pkg("x", &[]), pkg("a", &["b"]), pkg("b", &["a"])];
        let mut sorter = DependencySorter::new(pkgs);
        let order = sorter.by_ref().collect::<Vec<_>>();
        assert_eq!(order, vec!["x"]);
        assert_eq!(sorter.unresolved(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_cycle_remainder_appended() {
        let pkgs = vec![pkg("a", &["b"]), pkg("b", &["a"]), pkg("c", &["a"])];
        let (order, unresolved) = build_order(pkgs);
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(unresolved, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_dependency() {
        let (order, unresolved) = build_order(vec![pkg("a", &["a"])]);
        assert_eq!(order, vec!["a"]);
        assert_eq!(unresolved, vec!["a"]);
    }

    #[test]
    fn test_missing_dependency_is_unresolved() {
        let (order, unresolved) = build_order(vec![pkg("a", &["glibc"]), pkg("b", &[])]);
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(unresolved, vec!["a"]);
    }

    #[test]
    fn test_empty() {
        let (order, unresolved) = build_order(Vec::new());
        assert!(order.is_empty());
        assert!(unresolved.is_empty());
    }
}
