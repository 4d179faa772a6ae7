//! The per-node routing table of m shortcut pointers.

use crate::common::{NodeRef, RingId, RingSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One finger table entry. `start` is fixed at table construction;
/// only `node` is ever refreshed.
pub struct Finger {
    start: RingId,
    node: NodeRef,
}

impl Finger {
    /// The identifier this entry routes for: `(id + 2^i) mod 2^m`.
    pub fn start(&self) -> RingId {
        self.start
    }

    /// The cached successor of [Finger::start].
    pub fn node(&self) -> NodeRef {
        self.node
    }
}

#[derive(Debug, Clone)]
/// A node's finger table: m entries, where entry i (0-based) caches the
/// successor of `(id + 2^i) mod 2^m`.
///
/// Entry 0 is the node's immediate successor and is the authoritative
/// successor pointer.
pub struct FingerTable {
    local: NodeRef,
    fingers: Vec<Finger>,
}

impl FingerTable {
    /// Creates a table with every entry pointing at the local node itself;
    /// a fresh singleton node is its own successor for every finger.
    pub fn new(local: NodeRef, space: RingSpace) -> FingerTable {
        let fingers = (0..space.bits())
            .map(|i| Finger {
                start: space.finger_start(local.id, i),
                node: local,
            })
            .collect();

        FingerTable { local, fingers }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.fingers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Finger> {
        self.fingers.get(index)
    }

    /// The immediate successor, i.e. entry 0.
    pub fn successor(&self) -> NodeRef {
        self.fingers[0].node
    }

    // === Public Methods ===

    /// Points entry `index` at `node`, keeping its start untouched.
    pub fn set(&mut self, index: usize, node: NodeRef) {
        if let Some(finger) = self.fingers.get_mut(index) {
            finger.node = node;
        }
    }

    /// Replaces the immediate successor (entry 0).
    pub fn set_successor(&mut self, node: NodeRef) {
        self.fingers[0].node = node;
    }

    /// The finger preceding `target` most closely: scans from the largest
    /// index down and returns the first cached node whose id lies strictly
    /// in `(local, target)`. Falls back to the local node when no finger
    /// qualifies.
    ///
    /// Scanning largest-first is what yields the logarithmic hop count.
    pub fn closest_preceding(&self, target: RingId) -> NodeRef {
        for finger in self.fingers.iter().rev() {
            if finger.node.id.in_open_interval(self.local.id, target) {
                return finger.node;
            }
        }

        self.local
    }

    /// All distinct non-local nodes preceding `target`, best first.
    /// Used to seed a lookup's fallback candidates.
    pub fn preceding_candidates(&self, target: RingId) -> Vec<NodeRef> {
        let mut candidates: Vec<NodeRef> = Vec::new();

        for finger in self.fingers.iter().rev() {
            let node = finger.node;
            if node.id.in_open_interval(self.local.id, target)
                && !candidates.iter().any(|c| c.address == node.address)
            {
                candidates.push(node);
            }
        }

        candidates
    }

    /// Rewrites every entry caching a failed node to `replacement`;
    /// `fix_fingers` repairs the entries properly over time.
    pub fn replace_node(&mut self, failed: RingId, replacement: NodeRef) {
        for finger in self.fingers.iter_mut() {
            if finger.node.id == failed {
                finger.node = replacement;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddrV4;

    fn node(space: RingSpace, id: u64, port: u16) -> NodeRef {
        NodeRef::new(space.id(id), SocketAddrV4::new([127, 0, 0, 1].into(), port))
    }

    /// Node 0's finger table in the stabilized 3-bit ring {0, 1, 3}.
    fn paper_table() -> (RingSpace, FingerTable) {
        let space = RingSpace::new(3);
        let mut table = FingerTable::new(node(space, 0, 6000), space);

        table.set(0, node(space, 1, 6001)); // start 1 -> node 1
        table.set(1, node(space, 3, 6003)); // start 2 -> node 3
        table.set(2, node(space, 0, 6000)); // start 4 -> node 0 (wraps)

        (space, table)
    }

    #[test]
    fn new_table_points_at_self() {
        let space = RingSpace::new(3);
        let local = node(space, 1, 6001);
        let table = FingerTable::new(local, space);

        assert_eq!(table.len(), 3);
        for i in 0..table.len() {
            assert_eq!(table.get(i).map(|f| f.node()), Some(local));
        }
        assert_eq!(table.successor(), local);
    }

    #[test]
    fn starts_are_fixed_at_construction() {
        let (space, mut table) = paper_table();

        let starts: Vec<_> = (0..3).filter_map(|i| table.get(i).map(|f| f.start())).collect();
        assert_eq!(starts, vec![space.id(1), space.id(2), space.id(4)]);

        // Refreshing nodes never touches the starts.
        table.set(1, node(space, 5, 6005));
        assert_eq!(table.get(1).map(|f| f.start()), Some(space.id(2)));
    }

    #[test]
    fn closest_preceding_scans_largest_first() {
        let (space, table) = paper_table();

        // Looking up 6 from node 0: finger 2 caches node 0 (not in (0, 6)),
        // finger 1 caches node 3 which precedes 6.
        assert_eq!(table.closest_preceding(space.id(6)).id, space.id(3));

        // Looking up 2: node 1 is the only finger in (0, 2).
        assert_eq!(table.closest_preceding(space.id(2)).id, space.id(1));
    }

    #[test]
    fn closest_preceding_falls_back_to_self() {
        let space = RingSpace::new(3);
        let local = node(space, 0, 6000);
        let table = FingerTable::new(local, space);

        // All fingers point at the local node, so nothing precedes target 5.
        assert_eq!(table.closest_preceding(space.id(5)), local);
    }

    #[test]
    fn preceding_candidates_are_distinct_and_ordered() {
        let (space, table) = paper_table();

        let candidates = table.preceding_candidates(space.id(6));
        let ids: Vec<_> = candidates.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![space.id(3), space.id(1)]);
    }

    #[test]
    fn replace_node_rewrites_failed_entries() {
        let (space, mut table) = paper_table();
        let replacement = node(space, 1, 6001);

        table.replace_node(space.id(3), replacement);

        assert_eq!(table.get(1).map(|f| f.node()), Some(replacement));
        // Untouched entries keep their node.
        assert_eq!(table.get(0).map(|f| f.node().id), Some(space.id(1)));
    }
}
