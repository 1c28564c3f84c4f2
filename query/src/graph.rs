use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Adjacency map over table aliases.
pub type Adjacency = BTreeMap<String, BTreeSet<String>>;

pub fn build_adjacency(nodes: &[String], edges: &[(String, String)]) -> Adjacency {
    let mut adjacency: Adjacency = BTreeMap::new();
    for node in nodes {
        adjacency.entry(node.clone()).or_default();
    }
    for (a, b) in edges {
        if a == b {
            continue;
        }
        adjacency.entry(a.clone()).or_default().insert(b.clone());
        adjacency.entry(b.clone()).or_default().insert(a.clone());
    }
    adjacency
}

fn expand(
    adjacency: &[BTreeSet<usize>],
    current: &mut Vec<usize>,
    possible: &BTreeSet<usize>,
    excluded: &BTreeSet<usize>,
    max_size: usize,
    results: &mut Vec<Vec<usize>>,
) {
    results.push(current.clone());
    if current.len() == max_size {
        return;
    }
    let mut excluded = excluded.clone();
    for &next in possible {
        if excluded.contains(&next) {
            continue;
        }
        excluded.insert(next);
        let mut new_possible: BTreeSet<usize> = possible
            .union(&adjacency[next])
            .copied()
            .filter(|n| !excluded.contains(n))
            .collect();
        new_possible.remove(&next);
        current.push(next);
        expand(adjacency, current, &new_possible, &excluded, max_size, results);
        current.pop();
    }
}

/// Enumerate every connected subgraph with a size in `[min_size, max_size]`.
/// Isolated nodes count as connected subgraphs of size one. Each subset is
/// returned once, sorted by node position in `nodes`.
pub fn connected_subgraphs(
    nodes: &[String],
    edges: &[(String, String)],
    min_size: usize,
    max_size: usize,
) -> Vec<Vec<String>> {
    let index: BTreeMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let mut adjacency: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
    for (a, b) in edges {
        if let (Some(&ia), Some(&ib)) = (index.get(a.as_str()), index.get(b.as_str())) {
            if ia != ib {
                adjacency[ia].insert(ib);
                adjacency[ib].insert(ia);
            }
        }
    }

    let mut results: Vec<Vec<usize>> = vec![];
    let mut excluded: BTreeSet<usize> = BTreeSet::new();
    for root in 0..nodes.len() {
        excluded.insert(root);
        let possible: BTreeSet<usize> = adjacency[root]
            .iter()
            .copied()
            .filter(|n| !excluded.contains(n))
            .collect();
        let mut current = vec![root];
        expand(&adjacency, &mut current, &possible, &excluded, max_size, &mut results);
    }

    results
        .into_iter()
        .filter(|subset| subset.len() >= min_size && subset.len() <= max_size)
        .map(|mut subset| {
            subset.sort_unstable();
            subset.into_iter().map(|i| nodes[i].clone()).collect()
        })
        .collect()
}

/// Every combination of nodes within the size window, connectivity ignored.
pub fn all_combinations(nodes: &[String], min_size: usize, max_size: usize) -> Vec<Vec<String>> {
    let upper = max_size.min(nodes.len());
    let mut results = vec![];
    for size in min_size..=upper {
        for combo in nodes.iter().cloned().combinations(size) {
            results.push(combo);
        }
    }
    results
}

/// BFS reachability from `start` over the adjacency map.
pub fn connected_component(start: &str, adjacency: &Adjacency) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    if !adjacency.contains_key(start) {
        seen.insert(start.to_string());
        return seen;
    }
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(start.to_string());
    seen.insert(start.to_string());
    while let Some(node) = queue.pop_front() {
        if let Some(neighbors) = adjacency.get(&node) {
            for neighbor in neighbors {
                if seen.insert(neighbor.clone()) {
                    queue.push_back(neighbor.clone());
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn enumerates_connected_subgraphs_once() {
        let nodes = names(&["a", "b", "c"]);
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
        ];
        let mut subgraphs = connected_subgraphs(&nodes, &edges, 1, 3);
        subgraphs.sort();
        assert_eq!(
            subgraphs,
            vec![
                names(&["a"]),
                names(&["a", "b"]),
                names(&["a", "b", "c"]),
                names(&["b"]),
                names(&["b", "c"]),
                names(&["c"]),
            ]
        );
    }

    #[test]
    fn isolated_nodes_are_size_one_subgraphs() {
        let nodes = names(&["a", "b"]);
        let subgraphs = connected_subgraphs(&nodes, &[], 1, 2);
        assert_eq!(subgraphs, vec![names(&["a"]), names(&["b"])]);
    }

    #[test]
    fn complete_graph_yields_all_nonempty_subsets() {
        let nodes = names(&["a", "b", "c"]);
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
            ("a".to_string(), "c".to_string()),
        ];
        // every non-empty subset of K3 is connected: 2^3 - 1 = 7
        assert_eq!(connected_subgraphs(&nodes, &edges, 1, 3).len(), 7);
        // the size window filters
        assert_eq!(connected_subgraphs(&nodes, &edges, 2, 2).len(), 3);
    }

    #[test]
    fn combinations_ignore_connectivity() {
        let nodes = names(&["a", "b", "c"]);
        assert_eq!(all_combinations(&nodes, 1, 3).len(), 7);
        assert_eq!(all_combinations(&nodes, 2, 2).len(), 3);
    }

    #[test]
    fn component_reachability() {
        let adjacency = build_adjacency(
            &names(&["a", "b", "c"]),
            &[("a".to_string(), "b".to_string())],
        );
        let component = connected_component("a", &adjacency);
        assert!(component.contains("b"));
        assert!(!component.contains("c"));
    }
}
