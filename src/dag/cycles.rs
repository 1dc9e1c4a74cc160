// src/dag/cycles.rs

//! Strongly-connected-component based cycle detection.

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

/// Find every cyclic group in the graph described by `edges` (`dep -> node`).
///
/// A group is either a strongly connected component with more than one
/// member, or a single node with an edge to itself. Ids inside a group and
/// the groups themselves are sorted so the output is deterministic.
pub fn find_cycles<'a, N, E>(nodes: N, edges: E) -> Vec<Vec<String>>
where
    N: IntoIterator<Item = &'a str>,
    E: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for node in nodes {
        graph.add_node(node);
    }
    for (from, to) in edges {
        graph.add_edge(from, to, ());
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut group: Vec<String> = scc.into_iter().map(str::to_string).collect();
            group.sort();
            group
        })
        .collect();

    cycles.sort();
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let cycles = find_cycles(["a", "b", "c"], [("a", "b"), ("b", "c"), ("a", "c")]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn finds_two_node_cycle_and_self_loop() {
        let cycles = find_cycles(
            ["a", "b", "c", "d"],
            [("a", "b"), ("b", "a"), ("c", "c"), ("b", "d")],
        );
        assert_eq!(
            cycles,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }
}
