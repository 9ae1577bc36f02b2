//! Typed dependency graph over the adjacency arena.

use std::collections::{BTreeSet, HashSet, VecDeque};

use super::arena::{EdgeLabel, Graph, VertexId};

/// A directed dependency graph specialized for migration phases.
///
/// Tracks the *independent set*: vertices with no outstanding `Needs` edge,
/// which seed the traversal. Adding a dependency removes the origin from the
/// set permanently; independence is monotonic for the lifetime of a run.
#[derive(Debug, Default)]
pub struct DependencyGraph<T> {
    graph: Graph<T>,
    independent: BTreeSet<VertexId>,
}

impl<T> DependencyGraph<T> {
    /// Creates an empty dependency graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            independent: BTreeSet::new(),
        }
    }

    /// Inserts a vertex and marks it independent.
    pub fn add(&mut self, vertex: T) -> VertexId {
        let id = self.graph.push(vertex);
        self.independent.insert(id);
        id
    }

    /// Records that `from` needs `to`.
    ///
    /// Connects the mirror pair `from --Needs--> to` and
    /// `to --NeededBy--> from` atomically and drops `from` from the
    /// independent set.
    pub fn add_dependency(&mut self, from: VertexId, to: VertexId) {
        self.independent.remove(&from);
        self.graph.connect(from, to, EdgeLabel::Needs);
        self.graph.connect(to, from, EdgeLabel::NeededBy);
    }

    /// Removes a vertex slot. Edges into it from other vertices remain and
    /// keep their holders permanently unready; the engine reports those.
    pub fn remove(&mut self, id: VertexId) {
        self.graph.remove(id);
        self.independent.remove(&id);
    }

    /// Removes both directions of an edge pair. Returns whether both halves
    /// were present.
    pub fn disconnect(&mut self, from: VertexId, to: VertexId) -> bool {
        let forward = self.graph.disconnect(from, to);
        let backward = self.graph.disconnect(to, from);
        forward && backward
    }

    /// Vertices this vertex depends on.
    pub fn dependencies_of(&self, id: VertexId) -> Vec<VertexId> {
        self.graph
            .edges_from(id)
            .filter_map(|(to, label)| (label == EdgeLabel::Needs).then_some(to))
            .collect()
    }

    /// Vertices depending on this vertex.
    pub fn dependents_of(&self, id: VertexId) -> Vec<VertexId> {
        self.graph
            .edges_from(id)
            .filter_map(|(to, label)| (label == EdgeLabel::NeededBy).then_some(to))
            .collect()
    }

    /// Returns the payload of a live vertex.
    pub fn vertex(&self, id: VertexId) -> Option<&T> {
        self.graph.vertex(id)
    }

    /// Number of live vertices.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Whether the graph has no live vertices.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Ids of all live vertices.
    pub fn indices(&self) -> Vec<VertexId> {
        self.graph.indices()
    }

    /// Current independent set, in id order.
    pub fn independent(&self) -> Vec<VertexId> {
        self.independent.iter().copied().collect()
    }

    /// Visits every vertex reachable from the independent set, in an order
    /// where a vertex is visited only after all of its dependencies.
    ///
    /// `per_vertex` fires once per visited vertex; `per_edge(from, to)`
    /// fires when visiting `from` unblocks `to`. Newly unblocked vertices
    /// are pushed to the front of the work-list so a branch completes
    /// depth-first once it becomes ready. Vertices unreachable from the
    /// independent set (cyclic or orphaned) are never visited.
    pub fn traverse(
        &self,
        mut per_vertex: impl FnMut(VertexId),
        mut per_edge: impl FnMut(VertexId, VertexId),
    ) {
        let mut visited: HashSet<VertexId> = HashSet::new();
        let mut ready: VecDeque<VertexId> = self.independent.iter().copied().collect();

        while let Some(vertex) = ready.pop_front() {
            if !visited.insert(vertex) {
                continue;
            }
            per_vertex(vertex);

            for (neighbor, _) in self.graph.edges_from(vertex) {
                if visited.contains(&neighbor) {
                    continue;
                }
                let unblocked = self
                    .dependencies_of(neighbor)
                    .iter()
                    .all(|dep| visited.contains(dep));
                if unblocked {
                    per_edge(vertex, neighbor);
                    ready.push_front(neighbor);
                }
            }
        }
    }
}
