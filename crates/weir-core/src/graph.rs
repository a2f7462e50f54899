//! Directed graph with topological ordering.
//!
//! [`Digraph`] is an adjacency-list directed graph over arbitrary hashable
//! vertices. It exists to serve the task runner in [`crate::dag`], so the
//! operations it carries are the ones a scheduler needs: edge maintenance,
//! successor lookup, topological ordering with cycle detection, and BFS
//! shortest distances.
//!
//! Vertices should be small (an id, one machine word) for best
//! performance; multiple edges between the same pair of vertices are not
//! supported.

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;

use fxhash::FxHashMap;
use smallvec::SmallVec;

/// Errors that can occur while ordering a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The graph contains a cycle, so no topological order exists.
    #[error("cycle detected")]
    CycleDetected,
}

/// Vertex coloring used by the topological sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Seen on the exploration branch currently on the stack.
    OnStack,
    /// Fully explored by a finished branch.
    Done,
}

/// A directed graph using an adjacency-list representation.
pub struct Digraph<V> {
    /// Successor lists. `SmallVec` avoids heap allocation for the common
    /// low-fan-out case.
    adj: FxHashMap<V, SmallVec<[V; 4]>>,
}

impl<V: fmt::Debug> fmt::Debug for Digraph<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digraph")
            .field("node_count", &self.adj.len())
            .field("adj", &self.adj)
            .finish()
    }
}

impl<V> Default for Digraph<V>
where
    V: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Digraph<V>
where
    V: Hash + Eq + Clone,
{
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adj: FxHashMap::default(),
        }
    }

    /// Adds a vertex with no edges. Returns `true` if the vertex did not
    /// exist and was added.
    pub fn add_node(&mut self, node: V) -> bool {
        match self.adj.entry(node) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(SmallVec::new());
                true
            }
        }
    }

    /// Adds an edge, creating either endpoint as needed. A duplicate of
    /// an existing edge is silently ignored.
    pub fn add_edge(&mut self, from: V, to: V) {
        self.add_node(to.clone());
        let list = self.adj.entry(from).or_default();
        if list.contains(&to) {
            return;
        }
        list.push(to);
    }

    /// Removes a vertex along with all incident edges. Returns `true` if
    /// the vertex existed and was removed.
    ///
    /// In-edges are erased with an unordered `swap_remove`, so this is
    /// O(V + E) with no allocation; the vacated slot is dropped rather
    /// than left behind.
    pub fn remove_node(&mut self, node: &V) -> bool {
        if self.adj.remove(node).is_none() {
            return false;
        }

        for list in self.adj.values_mut() {
            if let Some(i) = list.iter().position(|to| to == node) {
                list.swap_remove(i);
            }
        }

        true
    }

    /// Removes an edge. Returns `true` if the edge existed and was
    /// removed. Successor order is not preserved.
    pub fn remove_edge(&mut self, from: &V, to: &V) -> bool {
        let Some(list) = self.adj.get_mut(from) else {
            return false;
        };
        let Some(i) = list.iter().position(|t| t == to) else {
            return false;
        };
        list.swap_remove(i);
        true
    }

    /// Returns `true` if the vertex is in the graph.
    #[must_use]
    pub fn contains(&self, node: &V) -> bool {
        self.adj.contains_key(node)
    }

    /// Returns the number of vertices.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.adj.len()
    }

    /// Returns all vertices, in no particular order.
    #[must_use]
    pub fn nodes(&self) -> Vec<V> {
        self.adj.keys().cloned().collect()
    }

    /// Returns all edges as `(tail, head)` pairs, in no particular order.
    #[must_use]
    pub fn edges(&self) -> Vec<(V, V)> {
        let mut edges = Vec::with_capacity(self.adj.len());
        for (from, list) in &self.adj {
            for to in list {
                edges.push((from.clone(), to.clone()));
            }
        }
        edges
    }

    /// Returns a cloned successor list, or `None` if the vertex is not in
    /// the graph.
    #[must_use]
    pub fn neighbors(&self, node: &V) -> Option<Vec<V>> {
        self.adj.get(node).map(|list| list.to_vec())
    }

    /// Generates a topological order of all vertices: every edge points
    /// from an earlier to a later position. The order is not
    /// deterministic across runs.
    ///
    /// Uses an iterative depth-first search with three-color marking so
    /// deep graphs cannot overflow the stack.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] if the graph contains a
    /// cycle.
    pub fn topological_order(&self) -> std::result::Result<Vec<V>, GraphError> {
        let mut marks: FxHashMap<V, Mark> =
            FxHashMap::with_capacity_and_hasher(self.adj.len(), fxhash::FxBuildHasher::default());
        // Reverse post-order, reversed once at the end.
        let mut order: Vec<V> = Vec::with_capacity(self.adj.len());
        // Explicit DFS stack of (vertex, next successor index).
        let mut stack: Vec<(V, usize)> = Vec::new();

        for root in self.adj.keys() {
            if marks.contains_key(root) {
                continue;
            }

            marks.insert(root.clone(), Mark::OnStack);
            stack.push((root.clone(), 0));

            while let Some(frame) = stack.last_mut() {
                let node = frame.0.clone();
                let next_index = frame.1;
                frame.1 += 1;

                let next = self.adj[&node].get(next_index).cloned();
                match next {
                    Some(next) => match marks.get(&next) {
                        Some(Mark::OnStack) => return Err(GraphError::CycleDetected),
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(next.clone(), Mark::OnStack);
                            stack.push((next, 0));
                        }
                    },
                    None => {
                        // All successors explored; finish this vertex.
                        stack.pop();
                        marks.insert(node.clone(), Mark::Done);
                        order.push(node);
                    }
                }
            }
        }

        order.reverse();
        Ok(order)
    }

    /// Returns the shortest distance from `from` to every reachable
    /// vertex, along with the BFS-tree subgraph of the paths taken.
    /// Vertices unreachable from `from` are absent from both.
    ///
    /// If `from` is not in the graph, the result contains only `from`
    /// itself at distance 0. Cyclic graphs are fine.
    #[must_use]
    pub fn shortest_distances(&self, from: &V) -> (FxHashMap<V, usize>, Digraph<V>) {
        let mut distances = FxHashMap::default();
        distances.insert(from.clone(), 0);

        let mut subgraph = Digraph::new();
        subgraph.add_node(from.clone());

        let mut queue = VecDeque::new();
        queue.push_back(from.clone());

        while let Some(current) = queue.pop_front() {
            let Some(list) = self.adj.get(&current) else {
                continue;
            };
            let next_distance = distances[&current] + 1;
            for next in list {
                if !distances.contains_key(next) {
                    distances.insert(next.clone(), next_distance);
                    queue.push_back(next.clone());
                    subgraph.add_edge(current.clone(), next.clone());
                }
            }
        }

        (distances, subgraph)
    }
}

impl<V> fmt::Display for Digraph<V>
where
    V: Hash + Eq + Clone + fmt::Display,
{
    /// Formats the graph one vertex per line as `v -> a b c`, with lines
    /// and successors both in lexicographic order of their formatting.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<(String, Vec<String>)> = self
            .adj
            .iter()
            .map(|(node, list)| {
                let mut outs: Vec<String> = list.iter().map(ToString::to_string).collect();
                outs.sort_unstable();
                (node.to_string(), outs)
            })
            .collect();
        lines.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (i, (node, outs)) in lines.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{node} ->")?;
            for out in outs {
                write!(f, " {out}")?;
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the diamond a -> {b, c} -> d.
    fn diamond() -> Digraph<&'static str> {
        let mut g = Digraph::new();
        g.add_edge("a", "b");
        g.add_edge("a", "c");
        g.add_edge("b", "d");
        g.add_edge("c", "d");
        g
    }

    fn position<V: PartialEq>(order: &[V], node: &V) -> usize {
        order.iter().position(|v| v == node).expect("node in order")
    }

    #[test]
    fn test_add_node_idempotent() {
        let mut g = Digraph::new();
        assert!(g.add_node(1));
        assert!(!g.add_node(1));
        assert_eq!(g.node_count(), 1);
    }

    #[test]
    fn test_add_edge_creates_endpoints() {
        let mut g = Digraph::new();
        g.add_edge("x", "y");
        assert!(g.contains(&"x"));
        assert!(g.contains(&"y"));
        assert_eq!(g.neighbors(&"x"), Some(vec!["y"]));
        assert_eq!(g.neighbors(&"y"), Some(vec![]));
        assert_eq!(g.neighbors(&"z"), None);
    }

    #[test]
    fn test_duplicate_edges_suppressed() {
        let mut g = Digraph::new();
        g.add_edge(1, 2);
        g.add_edge(1, 2);
        assert_eq!(g.edges(), vec![(1, 2)]);
    }

    #[test]
    fn test_remove_node_removes_incident_edges() {
        let mut g = diamond();
        assert!(g.remove_node(&"d"));
        assert!(!g.remove_node(&"d"));

        assert_eq!(g.node_count(), 3);
        assert_eq!(g.neighbors(&"b"), Some(vec![]));
        assert_eq!(g.neighbors(&"c"), Some(vec![]));
    }

    #[test]
    fn test_remove_edge() {
        let mut g = diamond();
        assert!(g.remove_edge(&"a", &"b"));
        assert!(!g.remove_edge(&"a", &"b"));
        assert!(!g.remove_edge(&"a", &"d"));
        assert!(!g.remove_edge(&"nope", &"b"));

        // b stays as a vertex even with its in-edge gone.
        assert!(g.contains(&"b"));
    }

    #[test]
    fn test_topological_order_diamond() {
        let g = diamond();
        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), 4);
        assert!(position(&order, &"a") < position(&order, &"b"));
        assert!(position(&order, &"a") < position(&order, &"c"));
        assert!(position(&order, &"b") < position(&order, &"d"));
        assert!(position(&order, &"c") < position(&order, &"d"));
    }

    #[test]
    fn test_topological_order_disconnected() {
        let mut g = Digraph::new();
        g.add_edge(1, 2);
        g.add_node(3);
        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), 3);
        assert!(position(&order, &1) < position(&order, &2));
    }

    #[test]
    fn test_topological_order_cycle() {
        let mut g = diamond();
        g.add_edge("d", "a");
        assert_eq!(g.topological_order(), Err(GraphError::CycleDetected));
    }

    #[test]
    fn test_topological_order_self_loop() {
        let mut g = Digraph::new();
        g.add_edge(1, 1);
        assert_eq!(g.topological_order(), Err(GraphError::CycleDetected));
    }

    #[test]
    fn test_topological_order_deep_chain() {
        // Deep enough to overflow a recursive DFS on a small stack.
        let mut g = Digraph::new();
        for i in 0u32..100_000 {
            g.add_edge(i, i + 1);
        }
        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), 100_001);
        assert_eq!(order.first(), Some(&0));
        assert_eq!(order.last(), Some(&100_000));
    }

    #[test]
    fn test_shortest_distances() {
        let mut g = diamond();
        g.add_edge("d", "e");
        g.add_node("island");

        let (distances, subgraph) = g.shortest_distances(&"a");
        assert_eq!(distances[&"a"], 0);
        assert_eq!(distances[&"b"], 1);
        assert_eq!(distances[&"c"], 1);
        assert_eq!(distances[&"d"], 2);
        assert_eq!(distances[&"e"], 3);
        assert!(!distances.contains_key(&"island"));

        // The BFS tree reaches every reachable vertex exactly once.
        assert_eq!(subgraph.node_count(), 5);
        assert_eq!(subgraph.edges().len(), 4);
    }

    #[test]
    fn test_shortest_distances_missing_source() {
        let g = diamond();
        let (distances, subgraph) = g.shortest_distances(&"ghost");
        assert_eq!(distances.len(), 1);
        assert_eq!(distances[&"ghost"], 0);
        assert_eq!(subgraph.node_count(), 1);
    }

    #[test]
    fn test_shortest_distances_cyclic() {
        let mut g = Digraph::new();
        g.add_edge(1, 2);
        g.add_edge(2, 3);
        g.add_edge(3, 1);

        let (distances, _) = g.shortest_distances(&1);
        assert_eq!(distances[&1], 0);
        assert_eq!(distances[&2], 1);
        assert_eq!(distances[&3], 2);
    }

    #[test]
    fn test_display_sorted() {
        let g = diamond();
        let rendered = format!("{g}");
        assert_eq!(rendered, "a -> b c\nb -> d\nc -> d\nd ->");
    }
}
