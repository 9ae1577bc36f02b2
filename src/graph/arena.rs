//! Index-addressed adjacency arena with slot reuse.

use std::collections::{BTreeMap, VecDeque};

/// Stable index of a vertex slot. Ids survive additions but are not
/// guaranteed contiguous once slots have been removed and reused.
pub type VertexId = usize;

/// Label on a directed edge between two vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLabel {
    /// The origin vertex depends on the target.
    Needs,
    /// The origin vertex is depended on by the target (mirror of `Needs`).
    NeededBy,
}

impl std::fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Needs => write!(f, "needs"),
            Self::NeededBy => write!(f, "needed-by"),
        }
    }
}

/// One vertex slot. A cleared slot (`payload == None`) is a tombstone
/// waiting on the free-list for reuse.
#[derive(Debug)]
struct Slot<T> {
    payload: Option<T>,
    outgoing: BTreeMap<VertexId, EdgeLabel>,
}

impl<T> Slot<T> {
    fn new(payload: T) -> Self {
        Self {
            payload: Some(payload),
            outgoing: BTreeMap::new(),
        }
    }

    fn clear(&mut self) {
        self.payload = None;
        self.outgoing.clear();
    }
}

/// A mutable directed graph storing arbitrary vertex payloads in an arena.
///
/// Removed slots are pushed onto a free-list and reused by later insertions,
/// so a `VertexId` is only meaningful while its slot is live.
#[derive(Debug, Default)]
pub struct Graph<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<VertexId>,
}

impl<T> Graph<T> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
        }
    }

    /// Inserts a vertex, reusing a free slot when one exists.
    pub fn push(&mut self, payload: T) -> VertexId {
        if let Some(id) = self.free.pop_front() {
            self.slots[id] = Slot::new(payload);
            id
        } else {
            self.slots.push(Slot::new(payload));
            self.slots.len() - 1
        }
    }

    /// Clears a slot and queues its id for reuse.
    ///
    /// Edges *into* the removed vertex held by other slots are left in
    /// place; they point at a tombstone and are skipped by payload lookups.
    pub fn remove(&mut self, id: VertexId) {
        if let Some(slot) = self.slots.get_mut(id) {
            if slot.payload.is_some() {
                slot.clear();
                self.free.push_back(id);
            }
        }
    }

    /// Returns the payload of a live vertex.
    pub fn vertex(&self, id: VertexId) -> Option<&T> {
        self.slots.get(id).and_then(|slot| slot.payload.as_ref())
    }

    /// Returns the label of the edge `from -> to`, if present.
    pub fn edge(&self, from: VertexId, to: VertexId) -> Option<EdgeLabel> {
        self.slots.get(from)?.outgoing.get(&to).copied()
    }

    /// Adds or replaces the edge `from -> to`.
    pub fn connect(&mut self, from: VertexId, to: VertexId, label: EdgeLabel) {
        if let Some(slot) = self.slots.get_mut(from) {
            slot.outgoing.insert(to, label);
        }
    }

    /// Removes the edge `from -> to`. Returns whether an edge was removed.
    pub fn disconnect(&mut self, from: VertexId, to: VertexId) -> bool {
        self.slots
            .get_mut(from)
            .is_some_and(|slot| slot.outgoing.remove(&to).is_some())
    }

    /// Iterates the outgoing edges of a vertex in target-id order.
    pub fn edges_from(&self, id: VertexId) -> impl Iterator<Item = (VertexId, EdgeLabel)> + '_ {
        self.slots
            .get(id)
            .into_iter()
            .flat_map(|slot| slot.outgoing.iter().map(|(to, label)| (*to, *label)))
    }

    /// Number of live vertices.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether the graph has no live vertices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live vertices, in slot order.
    pub fn indices(&self) -> Vec<VertexId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.payload.is_some().then_some(id))
            .collect()
    }

    /// Clears every slot and the free-list.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn push_returns_stable_ids() {
        let mut g = Graph::new();
        let a = g.push("a");
        let b = g.push("b");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(g.vertex(a), Some(&"a"));
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn removed_slots_are_reused_in_order() {
        let mut g = Graph::new();
        let a = g.push("a");
        let b = g.push("b");
        g.push("c");
        g.remove(a);
        g.remove(b);
        assert_eq!(g.len(), 1);
        // FIFO reuse: the first freed slot is handed out first.
        assert_eq!(g.push("d"), a);
        assert_eq!(g.push("e"), b);
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn remove_clears_payload_and_edges() {
        let mut g = Graph::new();
        let a = g.push("a");
        let b = g.push("b");
        g.connect(a, b, EdgeLabel::Needs);
        g.remove(a);
        assert_eq!(g.vertex(a), None);
        assert_eq!(g.edge(a, b), None);
        assert!(!g.indices().contains(&a));
    }

    #[test]
    fn connect_and_disconnect_edges() {
        let mut g = Graph::new();
        let a = g.push("a");
        let b = g.push("b");
        g.connect(a, b, EdgeLabel::Needs);
        g.connect(b, a, EdgeLabel::NeededBy);
        assert_eq!(g.edge(a, b), Some(EdgeLabel::Needs));
        assert_eq!(g.edge(b, a), Some(EdgeLabel::NeededBy));
        assert!(g.disconnect(a, b));
        assert!(!g.disconnect(a, b));
        assert_eq!(g.edge(a, b), None);
    }

    #[test]
    fn double_remove_does_not_double_free() {
        let mut g = Graph::new();
        let a = g.push("a");
        g.push("b");
        g.remove(a);
        g.remove(a);
        assert_eq!(g.len(), 1);
        let c = g.push("c");
        assert_eq!(c, a);
        assert_eq!(g.len(), 2);
    }
}
