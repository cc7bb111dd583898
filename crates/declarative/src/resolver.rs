//! Dependency resolver - topological ordering with cycle detection
//!
//! Independent nodes keep their declaration order, so the same configuration
//! always produces the same plan.

use std::collections::BTreeSet;

use crate::error::ValidationError;
use crate::graph::ResourceGraph;
use crate::types::ResourceId;

/// Order the graph so every node comes after the nodes it references
pub fn resolve(graph: &ResourceGraph) -> Result<Vec<ResourceId>, ValidationError> {
    let id_of = |i: usize| graph.nodes()[i].id.clone();

    let order = topological_order(graph.dependency_indices()).map_err(|cycle| {
        ValidationError::Cycle {
            path: cycle.into_iter().map(id_of).collect(),
        }
    })?;

    Ok(order.into_iter().map(id_of).collect())
}

/// Kahn's algorithm over index-based dependency lists.
///
/// `deps[i]` lists the indices that must come before `i`. Among ready
/// entries the lowest index goes first. On failure returns one cycle as a
/// path of indices whose first and last entries are equal.
pub fn topological_order(deps: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = deps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents = vec![Vec::new(); n];

    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let mut done = vec![false; n];
    for &i in &order {
        done[i] = true;
    }
    Err(find_cycle(deps, &done))
}

/// Walk unresolved dependencies until a node repeats.
///
/// Every node left over by Kahn's algorithm still has at least one
/// unresolved dependency, so the walk always closes a loop.
fn find_cycle(deps: &[Vec<usize>], done: &[bool]) -> Vec<usize> {
    let Some(start) = (0..deps.len()).find(|&i| !done[i]) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position = vec![None; deps.len()];
    position[start] = Some(0);
    let mut current = start;

    loop {
        let Some(next) = deps[current].iter().copied().filter(|&d| !done[d]).min() else {
            return path;
        };
        if let Some(pos) = position[next] {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        position[next] = Some(path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceNode;
    use crate::types::Reference;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("test", name)
    }

    fn node(name: &str, refs: &[&str]) -> ResourceNode {
        refs.iter().fold(ResourceNode::new(id(name)), |n, r| {
            n.with(format!("ref_{r}"), Reference::new(id(r), "id"))
        })
    }

    #[test]
    fn test_producers_before_consumers() {
        let graph = ResourceGraph::new(vec![
            node("b", &["a"]),
            node("a", &[]),
            node("c", &["b", "a"]),
        ])
        .unwrap();

        assert_eq!(resolve(&graph).unwrap(), vec![id("a"), id("b"), id("c")]);
    }

    #[test]
    fn test_independent_nodes_keep_declaration_order() {
        let graph = ResourceGraph::new(vec![
            node("z", &[]),
            node("y", &[]),
            node("x", &["z"]),
            node("w", &[]),
        ])
        .unwrap();

        assert_eq!(
            resolve(&graph).unwrap(),
            vec![id("z"), id("y"), id("x"), id("w")]
        );
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let graph = ResourceGraph::new(vec![
            node("root", &[]),
            node("a", &["c", "root"]),
            node("b", &["a"]),
            node("c", &["b"]),
        ])
        .unwrap();

        let err = resolve(&graph).unwrap_err();
        assert_eq!(
            err,
            ValidationError::Cycle {
                path: vec![id("a"), id("c"), id("b"), id("a")]
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let graph = ResourceGraph::new(vec![node("a", &["a"])]).unwrap();
        assert_eq!(
            resolve(&graph).unwrap_err(),
            ValidationError::Cycle {
                path: vec![id("a"), id("a")]
            }
        );
    }

    #[test]
    fn test_every_edge_respected_on_generated_dags() {
        // Deterministic pseudo-random DAGs: edges only point to lower indices
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..50 {
            let size = (next() % 20 + 1) as usize;
            let names: Vec<String> = (0..size).map(|i| format!("n{i}")).collect();
            let mut nodes = Vec::new();
            for i in 0..size {
                let refs: Vec<&str> = (0..i)
                    .filter(|_| next() % 3 == 0)
                    .map(|j| names[j].as_str())
                    .collect();
                nodes.push(node(&names[i], &refs));
            }
            // Shuffle declaration order so edges point both ways in the list
            nodes.reverse();

            let graph = ResourceGraph::new(nodes).unwrap();
            let order = resolve(&graph).unwrap();
            let pos = |id: &ResourceId| order.iter().position(|o| o == id).unwrap();
            for edge in graph.edges() {
                assert!(pos(&edge.to) < pos(&edge.from), "{edge:?} out of order");
            }
        }
    }

    #[test]
    fn test_topological_order_on_indices() {
        assert_eq!(topological_order(&[vec![1], vec![], vec![0]]), Ok(vec![1, 0, 2]));
        assert_eq!(
            topological_order(&[vec![1], vec![0]]),
            Err(vec![0, 1, 0])
        );
    }
}
