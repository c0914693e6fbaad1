use std::collections::{HashMap, HashSet};

/// Find one dependency cycle in `graph` (task -> tasks it depends on).
///
/// Returns the cycle as a path that starts and ends on the same task, or
/// `None` when the graph is acyclic. Nodes are visited in sorted order so the
/// reported cycle is stable between runs.
pub fn find_cycle(graph: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack: Vec<String> = Vec::new();

    fn dfs(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if visited.contains(node) {
            return None;
        }

        visited.insert(node.to_string());
        stack.push(node.to_string());

        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if let Some(cycle) = dfs(dep, graph, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    let mut nodes: Vec<&String> = graph.keys().collect();
    nodes.sort();

    for node in nodes {
        if !visited.contains(node.as_str()) {
            if let Some(cycle) = dfs(node, graph, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
    }

    None
}
