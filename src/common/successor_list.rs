//! Redundant successors, used to survive a successor failure without
//! breaking the ring.

use crate::common::{NodeRef, RingId};

#[derive(Debug, Clone)]
/// An ordered list of up to `capacity` successors. The head always mirrors
/// the authoritative successor pointer (finger table entry 0).
pub struct SuccessorList {
    local: NodeRef,
    capacity: usize,
    nodes: Vec<NodeRef>,
}

impl SuccessorList {
    pub fn new(local: NodeRef, capacity: usize) -> SuccessorList {
        SuccessorList {
            local,
            capacity: capacity.max(1),
            nodes: vec![local],
        }
    }

    // === Getters ===

    pub fn head(&self) -> Option<NodeRef> {
        self.nodes.first().copied()
    }

    pub fn as_slice(&self) -> &[NodeRef] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Rebuilds the list from the current successor and the successor's own
    /// list, as learned during stabilization. Duplicates and the local node
    /// are dropped from the tail; the result is truncated to capacity.
    pub fn refresh(&mut self, successor: NodeRef, tail: &[NodeRef]) {
        let mut nodes = vec![successor];

        for node in tail {
            if nodes.len() >= self.capacity {
                break;
            }
            if node.id == self.local.id || nodes.iter().any(|n| n.id == node.id) {
                continue;
            }
            nodes.push(*node);
        }

        self.nodes = nodes;
    }

    /// Replaces the head without touching the tail, for when stabilization
    /// finds a closer successor.
    pub fn set_head(&mut self, successor: NodeRef) {
        if self.nodes.is_empty() {
            self.nodes.push(successor);
        } else if self.nodes[0].id != successor.id {
            self.nodes.retain(|n| n.id != successor.id);
            self.nodes.insert(0, successor);
            self.nodes.truncate(self.capacity);
        }
    }

    /// Drops a failed node and promotes the next entry. Returns the new
    /// successor, or `None` when the list is exhausted and the node is
    /// isolated (the list then resets to the local node).
    pub fn advance(&mut self, failed: RingId) -> Option<NodeRef> {
        self.nodes.retain(|n| n.id != failed);

        match self.nodes.first().copied() {
            Some(next) => Some(next),
            None => {
                self.nodes = vec![self.local];
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::RingSpace;
    use std::net::SocketAddrV4;

    fn node(space: RingSpace, id: u64) -> NodeRef {
        NodeRef::new(
            space.id(id),
            SocketAddrV4::new([127, 0, 0, 1].into(), 6000 + id as u16),
        )
    }

    #[test]
    fn starts_with_the_local_node() {
        let space = RingSpace::new(3);
        let local = node(space, 0);
        let list = SuccessorList::new(local, 3);

        assert_eq!(list.head(), Some(local));
    }

    #[test]
    fn refresh_dedupes_and_truncates() {
        let space = RingSpace::new(3);
        let local = node(space, 0);
        let mut list = SuccessorList::new(local, 2);

        let successor = node(space, 1);
        // The tail repeats the successor, contains the local node and more
        // entries than fit.
        list.refresh(successor, &[node(space, 1), local, node(space, 3), node(space, 5)]);

        let ids: Vec<_> = list.as_slice().iter().map(|n| n.id.value()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn advance_promotes_the_next_entry() {
        let space = RingSpace::new(3);
        let local = node(space, 0);
        let mut list = SuccessorList::new(local, 3);
        list.refresh(node(space, 1), &[node(space, 3)]);

        let next = list.advance(space.id(1));

        assert_eq!(next.map(|n| n.id.value()), Some(3));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn advance_resets_to_local_when_exhausted() {
        let space = RingSpace::new(3);
        let local = node(space, 0);
        let mut list = SuccessorList::new(local, 3);
        list.refresh(node(space, 1), &[]);

        assert_eq!(list.advance(space.id(1)), None);
        assert_eq!(list.head(), Some(local));
    }

    #[test]
    fn set_head_keeps_the_tail() {
        let space = RingSpace::new(3);
        let local = node(space, 0);
        let mut list = SuccessorList::new(local, 3);
        list.refresh(node(space, 3), &[node(space, 5)]);

        // A closer successor appeared between us and 3.
        list.set_head(node(space, 1));

        let ids: Vec<_> = list.as_slice().iter().map(|n| n.id.value()).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
