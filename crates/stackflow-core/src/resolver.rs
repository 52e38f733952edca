//! Dependency resolver
//!
//! Rejects cyclic graphs and computes a leveled topological order:
//! level 0 holds the nodes without producers, level k the nodes whose
//! producers all sit in levels below k. Ties inside a level keep
//! declaration order so identical input always yields identical output.

use crate::error::{Result, StackError};
use crate::graph::ResourceGraph;
use std::collections::HashMap;
use tracing::debug;

/// Leveled execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOrder {
    levels: Vec<Vec<String>>,
    level_of: HashMap<String, usize>,
}

impl ExecutionOrder {
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn level(&self, id: &str) -> Option<usize> {
        self.level_of.get(id).copied()
    }

    /// All node ids, level by level
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Validate the graph and compute its execution order
pub fn resolve(graph: &ResourceGraph) -> Result<ExecutionOrder> {
    detect_cycle(graph)?;
    let order = level_order(graph)?;
    debug!(nodes = graph.len(), levels = order.depth(), "Resolved execution order");
    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with on-stack marking
///
/// Walks with an explicit stack of `(node, next consumer)` frames so long
/// chains cannot exhaust the thread stack. Returns the first cycle found,
/// in producer-to-consumer order.
pub fn detect_cycle(graph: &ResourceGraph) -> Result<()> {
    let mut marks = vec![Mark::Unvisited; graph.len()];
    let mut path: Vec<(usize, usize)> = Vec::new();

    for start in 0..graph.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        marks[start] = Mark::OnStack;
        path.push((start, 0));

        while let Some((node, next)) = path.last_mut() {
            let node = *node;
            let Some(&succ) = graph.consumer_indices(node).get(*next) else {
                marks[node] = Mark::Done;
                path.pop();
                continue;
            };
            *next += 1;

            match marks[succ] {
                Mark::OnStack => {
                    let from = path.iter().position(|&(i, _)| i == succ).unwrap_or(0);
                    let cycle = path[from..]
                        .iter()
                        .map(|&(i, _)| graph.nodes()[i].id.clone())
                        .collect();
                    return Err(StackError::CyclicDependency { cycle });
                }
                Mark::Unvisited => {
                    marks[succ] = Mark::OnStack;
                    path.push((succ, 0));
                }
                Mark::Done => {}
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm, one frontier per level
fn level_order(graph: &ResourceGraph) -> Result<ExecutionOrder> {
    let mut indegree: Vec<usize> = (0..graph.len())
        .map(|i| graph.producer_indices(i).len())
        .collect();
    let mut frontier: Vec<usize> = (0..graph.len()).filter(|&i| indegree[i] == 0).collect();

    let mut order = ExecutionOrder::default();
    let mut placed = 0;

    while !frontier.is_empty() {
        frontier.sort_unstable();
        let mut next = Vec::new();
        for &i in &frontier {
            for &c in graph.consumer_indices(i) {
                indegree[c] -= 1;
                if indegree[c] == 0 {
                    next.push(c);
                }
            }
        }

        let level = order.levels.len();
        let ids: Vec<String> = frontier
            .iter()
            .map(|&i| graph.nodes()[i].id.clone())
            .collect();
        for id in &ids {
            order.level_of.insert(id.clone(), level);
        }
        placed += ids.len();
        order.levels.push(ids);
        frontier = next;
    }

    if placed != graph.len() {
        return Err(StackError::State(format!(
            "{} nodes could not be ordered",
            graph.len() - placed
        )));
    }
    Ok(order)
}
