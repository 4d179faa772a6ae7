//! The ring protocol core: a single-threaded actor owning one node's state.
//!
//! Three activities are multiplexed through [Rpc::tick]: answering inbound
//! requests from peers, driving locally initiated lookups, and the periodic
//! maintenance routines (`stabilize`, `fix_fingers`, `check_predecessor`)
//! that keep the ring consistent as membership changes. Because everything
//! runs on one thread, no other synchronization of the finger table or the
//! predecessor pointer is needed.

pub(crate) mod config;
mod lookup;
pub(crate) mod socket;

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Instant;

use flume::Sender;
use tracing::{debug, info, trace};

use crate::common::{
    CompactNode, ErrorSpecific, FingerTable, Message, MessageType, NeighborsResponseArguments,
    NodeRef, NodeResponseArguments, RequestSpecific, ResponseSpecific, RingId, RingSpace,
    SenderArguments, SuccessorList, ERROR_METHOD_UNKNOWN, ERROR_RING_MISMATCH,
};
use crate::Error;

pub use config::{
    Config, DEFAULT_CHECK_PREDECESSOR_INTERVAL, DEFAULT_FIX_FINGERS_INTERVAL, DEFAULT_RING_BITS,
    DEFAULT_STABILIZE_INTERVAL, DEFAULT_SUCCESSOR_LIST_LENGTH,
};
pub use lookup::{LookupError, LookupKind, LookupResult};
pub use socket::DEFAULT_REQUEST_TIMEOUT;

use lookup::{Lookup, LookupPurpose};
use socket::RpcSocket;

#[derive(Debug)]
pub struct Rpc {
    socket: RpcSocket,
    space: RingSpace,
    local: NodeRef,

    // Ring state. The successor pointer is authoritative in the finger
    // table's entry 0; the successor list's head mirrors it.
    finger_table: FingerTable,
    successor_list: SuccessorList,
    predecessor: Option<NodeRef>,

    // Active lookups, keyed by kind and target.
    lookups: HashMap<(LookupKind, RingId), Lookup>,

    // Maintenance timers and their inflight probes.
    last_stabilize: Instant,
    last_fix_fingers: Instant,
    last_check_predecessor: Instant,
    pending_stabilize: Option<u16>,
    pending_predecessor_check: Option<u16>,
    next_finger: usize,

    bootstrap: Option<SocketAddrV4>,
    config: Config,
}

impl Rpc {
    pub fn new(config: Config) -> Result<Rpc, Error> {
        config.validate()?;

        let space = RingSpace::new(config.bits);
        let socket = RpcSocket::new(&config)?;
        let address = socket.local_addr();

        let id = match config.id {
            Some(value) => space.id(value),
            None => space.hash_key(address.to_string().as_bytes()),
        };
        let local = NodeRef::new(id, address);

        info!(%local, bits = space.bits(), "Starting ring node");

        Ok(Rpc {
            socket,
            space,
            local,
            finger_table: FingerTable::new(local, space),
            successor_list: SuccessorList::new(local, config.successor_list_length),
            predecessor: None,
            lookups: HashMap::new(),
            last_stabilize: Instant::now(),
            last_fix_fingers: Instant::now(),
            last_check_predecessor: Instant::now(),
            pending_stabilize: None,
            pending_predecessor_check: None,
            next_finger: 1,
            bootstrap: config.bootstrap,
            config,
        })
    }

    // === Getters ===

    pub fn id(&self) -> RingId {
        self.local.id
    }

    pub fn space(&self) -> RingSpace {
        self.space
    }

    pub fn local(&self) -> NodeRef {
        self.local
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn successor(&self) -> NodeRef {
        self.finger_table.successor()
    }

    pub fn predecessor(&self) -> Option<NodeRef> {
        self.predecessor
    }

    pub fn successor_list(&self) -> &[NodeRef] {
        self.successor_list.as_slice()
    }

    // === Public Methods ===

    /// Performs one round of I/O and housekeeping: drive lookups, apply
    /// finished ones, run due maintenance, then receive at most one message.
    pub fn tick(&mut self) {
        for lookup in self.lookups.values_mut() {
            lookup.tick(&mut self.socket);
        }

        self.reap_finished_lookups();

        self.maintain_ring();

        if let Some((message, from)) = self.socket.recv_from() {
            match &message.message_type {
                MessageType::Request(request) => {
                    self.handle_request(from, message.transaction_id, request.clone());
                }
                MessageType::Response(_) => {
                    self.handle_response(from, &message);
                }
                MessageType::Error(error) => {
                    self.handle_error(message.transaction_id, error.clone());
                }
            }
        }
    }

    /// Starts the join through the bootstrap address, or reports immediate
    /// success for the first node of a fresh ring.
    pub fn start_join(&mut self, sender: Sender<LookupResult>) {
        match self.bootstrap {
            Some(address) => {
                info!(%address, "Joining ring via known member");
                let mut lookup = self.new_lookup(
                    LookupKind::Successor,
                    self.local.id,
                    LookupPurpose::Join,
                );
                lookup.add_sender(Some(sender));
                lookup.visit(&mut self.socket, address);
                self.lookups
                    .insert((LookupKind::Successor, self.local.id), lookup);
            }
            None => {
                info!("Starting a fresh ring");
                let _ = sender.send(Ok(self.local));
            }
        }
    }

    /// Resolve the node owning `target`. Answers from the local successor
    /// pointer when it suffices, otherwise starts (or joins) a lookup.
    pub fn find_successor(&mut self, target: RingId, sender: Option<Sender<LookupResult>>) {
        let successor = self.successor();

        if target.in_open_closed_interval(self.local.id, successor.id) {
            self.reply_local(LookupKind::Successor, target, successor, sender);
            return;
        }

        self.start_lookup(LookupKind::Successor, target, LookupPurpose::Client, sender);
    }

    /// Resolve the node directly preceding `target`.
    pub fn find_predecessor(&mut self, target: RingId, sender: Option<Sender<LookupResult>>) {
        let successor = self.successor();

        if target.in_open_closed_interval(self.local.id, successor.id) {
            self.reply_local(LookupKind::Predecessor, target, self.local, sender);
            return;
        }

        self.start_lookup(
            LookupKind::Predecessor,
            target,
            LookupPurpose::Client,
            sender,
        );
    }

    // === Private Methods ===

    fn new_lookup(&self, kind: LookupKind, target: RingId, purpose: LookupPurpose) -> Lookup {
        // Hop budget: a populated ring needs O(log N) <= m hops; leave room
        // for stale fingers and successor-list detours.
        let max_hops = 2 * self.space.bits() as usize + self.successor_list.len();
        Lookup::new(kind, target, self.local, purpose, max_hops)
    }

    fn start_lookup(
        &mut self,
        kind: LookupKind,
        target: RingId,
        purpose: LookupPurpose,
        sender: Option<Sender<LookupResult>>,
    ) {
        if let Some(lookup) = self.lookups.get_mut(&(kind, target)) {
            lookup.add_sender(sender);
            return;
        }

        let first_hop = self.finger_table.closest_preceding(target);

        if first_hop.id == self.local.id {
            // No finger precedes the target and it is not in our successor
            // range: a degenerate or not yet stabilized ring. Terminate with
            // the successor rather than loop (it is the best answer we have).
            let successor = self.successor();
            self.reply_local(kind, target, successor, sender);
            return;
        }

        let mut lookup = self.new_lookup(kind, target, purpose);
        lookup.add_sender(sender);

        // Fallback routes if the first hop fails: remaining preceding
        // fingers, then the successor list.
        for candidate in self.finger_table.preceding_candidates(target) {
            if candidate.address != first_hop.address {
                lookup.add_fallback(candidate);
            }
        }
        for candidate in self.successor_list.as_slice() {
            lookup.add_fallback(*candidate);
        }

        lookup.visit(&mut self.socket, first_hop.address);
        self.lookups.insert((kind, target), lookup);
    }

    /// Answer a lookup from local state. The local node itself is handed out
    /// directly; a remote answer goes through a lookup's liveness probe
    /// first, falling back to a full lookup when the node turns out dead.
    fn reply_local(
        &mut self,
        kind: LookupKind,
        target: RingId,
        node: NodeRef,
        sender: Option<Sender<LookupResult>>,
    ) {
        if node.id == self.local.id {
            if let Some(sender) = sender {
                let _ = sender.send(Ok(node));
            }
            return;
        }

        if let Some(lookup) = self.lookups.get_mut(&(kind, target)) {
            lookup.add_sender(sender);
            return;
        }

        let mut lookup = self.new_lookup(kind, target, LookupPurpose::Client);
        lookup.add_sender(sender);

        for candidate in self.finger_table.preceding_candidates(target) {
            if candidate.address != node.address {
                lookup.add_fallback(candidate);
            }
        }
        for candidate in self.successor_list.as_slice() {
            if candidate.address != node.address {
                lookup.add_fallback(*candidate);
            }
        }

        lookup.handle_found(&mut self.socket, node);
        self.lookups.insert((kind, target), lookup);
    }

    /// Apply the side effects of finished lookups and drop them.
    fn reap_finished_lookups(&mut self) {
        let finished: Vec<_> = self
            .lookups
            .iter()
            .filter(|(_, lookup)| lookup.is_done())
            .map(|(key, _)| *key)
            .collect();

        for key in finished {
            if let Some(lookup) = self.lookups.remove(&key) {
                match (lookup.purpose(), lookup.result()) {
                    (LookupPurpose::Join, Some(Ok(successor))) => {
                        info!(%successor, "Joined the ring");
                        self.adopt_successor(successor);
                    }
                    (LookupPurpose::FixFinger(index), Some(Ok(node))) => {
                        trace!(index, %node, "Refreshed finger");
                        self.finger_table.set(index, node);
                    }
                    _ => {}
                }
            }
        }
    }

    // === Inbound requests ===

    fn handle_request(&mut self, from: SocketAddrV4, transaction_id: u16, request: RequestSpecific) {
        let sender = self.peer_ref(request.sender(), from);

        match request {
            RequestSpecific::FindSuccessor { arguments } => {
                let target = self.space.id(arguments.target);
                match self.route(target) {
                    Routed::Owned(successor) => self.socket.response(
                        from,
                        transaction_id,
                        ResponseSpecific::FoundSuccessor {
                            arguments: self.node_response(successor),
                        },
                    ),
                    Routed::Closer(closer) => self.socket.response(
                        from,
                        transaction_id,
                        ResponseSpecific::Redirect {
                            arguments: self.node_response(closer),
                        },
                    ),
                }
            }
            RequestSpecific::FindPredecessor { arguments } => {
                let target = self.space.id(arguments.target);
                match self.route(target) {
                    // We own the target, so we are its predecessor.
                    Routed::Owned(_) => self.socket.response(
                        from,
                        transaction_id,
                        ResponseSpecific::FoundPredecessor {
                            arguments: self.node_response(self.local),
                        },
                    ),
                    Routed::Closer(closer) => self.socket.response(
                        from,
                        transaction_id,
                        ResponseSpecific::Redirect {
                            arguments: self.node_response(closer),
                        },
                    ),
                }
            }
            RequestSpecific::ClosestPrecedingFinger { arguments } => {
                let target = self.space.id(arguments.target);
                let node = self.finger_table.closest_preceding(target);
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::ClosestPreceding {
                        arguments: self.node_response(node),
                    },
                );
            }
            RequestSpecific::GetPredecessor { .. } => {
                let arguments = NeighborsResponseArguments {
                    sender: CompactNode::from_node(&self.local),
                    predecessor: self.predecessor.map(|p| CompactNode::from_node(&p)),
                    successors: self
                        .successor_list
                        .as_slice()
                        .iter()
                        .map(CompactNode::from_node)
                        .collect(),
                };
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Neighbors { arguments },
                );
            }
            RequestSpecific::Notify { .. } => {
                self.notified_by(sender);
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Pong {
                        arguments: SenderArguments {
                            sender: CompactNode::from_node(&self.local),
                        },
                    },
                );
            }
            RequestSpecific::Ping { .. } => {
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Pong {
                        arguments: SenderArguments {
                            sender: CompactNode::from_node(&self.local),
                        },
                    },
                );
            }
        }
    }

    /// Routing decision for an inbound `find_successor`/`find_predecessor`:
    /// answer with our successor when the target is in `(us, successor]`,
    /// otherwise redirect to the closest preceding finger. If no finger
    /// precedes the target (degenerate ring) terminate with the successor
    /// rather than redirect to ourselves.
    fn route(&self, target: RingId) -> Routed {
        let successor = self.successor();

        if target.in_open_closed_interval(self.local.id, successor.id) {
            return Routed::Owned(successor);
        }

        let closer = self.finger_table.closest_preceding(target);
        if closer.id == self.local.id {
            Routed::Owned(successor)
        } else {
            Routed::Closer(closer)
        }
    }

    /// `notify(candidate)`: adopt the candidate as predecessor when we have
    /// none, or when it sits between our current predecessor and us.
    fn notified_by(&mut self, candidate: NodeRef) {
        if candidate.id == self.local.id {
            return;
        }

        let adopt = match self.predecessor {
            None => true,
            Some(current) => candidate.id.in_open_interval(current.id, self.local.id),
        };

        if adopt {
            debug!(%candidate, "Adopting new predecessor");
            self.predecessor = Some(candidate);
        }
    }

    // === Inbound responses ===

    fn handle_response(&mut self, from: SocketAddrV4, message: &Message) {
        let transaction_id = message.transaction_id;
        let response = match &message.message_type {
            MessageType::Response(response) => response.clone(),
            _ => return,
        };

        if self.pending_stabilize == Some(transaction_id) {
            self.pending_stabilize = None;
            if let ResponseSpecific::Neighbors { arguments } = response {
                self.process_stabilize_response(arguments);
            }
            return;
        }

        if self.pending_predecessor_check == Some(transaction_id) {
            // Any answer proves the predecessor is alive.
            self.pending_predecessor_check = None;
            return;
        }

        let key = match self
            .lookups
            .iter()
            .find(|(_, lookup)| lookup.expects(transaction_id))
        {
            Some((key, _)) => *key,
            None => {
                // Late answers to notify or to already abandoned requests.
                trace!(transaction_id, ?from, "Response matches nothing, ignoring");
                return;
            }
        };

        let space = self.space;
        let local_address = self.local.address;
        let successor = self.successor();
        if let Some(lookup) = self.lookups.get_mut(&key) {
            match response {
                ResponseSpecific::FoundSuccessor { arguments }
                    if lookup.kind() == LookupKind::Successor =>
                {
                    let node = peer_ref_in(&space, arguments.node, Some(from));
                    lookup.handle_found(&mut self.socket, node);
                }
                ResponseSpecific::FoundPredecessor { arguments }
                    if lookup.kind() == LookupKind::Predecessor =>
                {
                    let node = peer_ref_in(&space, arguments.node, Some(from));
                    lookup.handle_found(&mut self.socket, node);
                }
                ResponseSpecific::Redirect { arguments } => {
                    let closer = peer_ref_in(&space, arguments.node, Some(from));
                    if closer.address == local_address {
                        // A peer with stale routing state redirected the
                        // lookup back to us; our successor is its best
                        // remaining answer.
                        lookup.handle_found(&mut self.socket, successor);
                    } else {
                        lookup.handle_redirect(&mut self.socket, closer);
                    }
                }
                ResponseSpecific::Pong { arguments } => {
                    let node = peer_ref_in(&space, arguments.sender, Some(from));
                    lookup.handle_pong(node);
                }
                other => {
                    debug!(?other, "Unexpected response type for lookup");
                }
            }
        }
    }

    fn handle_error(&mut self, transaction_id: u16, error: ErrorSpecific) {
        debug!(?error, "Received protocol error");

        if self.pending_stabilize == Some(transaction_id) {
            self.pending_stabilize = None;
            return;
        }
        if self.pending_predecessor_check == Some(transaction_id) {
            self.pending_predecessor_check = None;
            return;
        }

        let key = match self
            .lookups
            .iter()
            .find(|(_, lookup)| lookup.expects(transaction_id))
        {
            Some((key, _)) => *key,
            None => return,
        };

        if let Some(lookup) = self.lookups.get_mut(&key) {
            if error.code == ERROR_RING_MISMATCH {
                lookup.handle_ring_mismatch();
            } else if error.code == ERROR_METHOD_UNKNOWN {
                lookup.finish(Err(LookupError::LookupFailed));
            }
        }
    }

    // === Ring maintenance ===

    fn maintain_ring(&mut self) {
        // A stabilize round that never got its answer means the successor
        // is gone; promote the next successor-list entry.
        if let Some(tid) = self.pending_stabilize {
            if !self.socket.inflight(&tid) {
                self.pending_stabilize = None;
                self.handle_successor_failure();
            }
        }

        if let Some(tid) = self.pending_predecessor_check {
            if !self.socket.inflight(&tid) {
                self.pending_predecessor_check = None;
                if let Some(predecessor) = self.predecessor.take() {
                    debug!(%predecessor, "Predecessor stopped answering, clearing it");
                }
            }
        }

        if self.last_stabilize.elapsed() >= self.config.stabilize_interval {
            self.last_stabilize = Instant::now();
            self.stabilize();
        }

        if self.last_fix_fingers.elapsed() >= self.config.fix_fingers_interval {
            self.last_fix_fingers = Instant::now();
            self.fix_fingers();
        }

        if self.last_check_predecessor.elapsed() >= self.config.check_predecessor_interval {
            self.last_check_predecessor = Instant::now();
            self.check_predecessor();
        }
    }

    /// One stabilization round: ask the successor for its predecessor (and
    /// successor list), then notify it of us. A node that is its own
    /// successor but has a predecessor adopts it as successor instead; that
    /// is how the first node of a ring learns of its second member.
    fn stabilize(&mut self) {
        let successor = self.successor();

        if successor.id == self.local.id {
            if let Some(predecessor) = self.predecessor {
                if predecessor.id != self.local.id {
                    debug!(%predecessor, "Adopting predecessor as successor");
                    self.adopt_successor(predecessor);
                    self.notify_successor();
                }
            }
            return;
        }

        if self.pending_stabilize.is_some() {
            // The previous round is still in the air.
            return;
        }

        self.pending_stabilize = Some(self.socket.request(
            successor.address,
            RequestSpecific::GetPredecessor {
                arguments: SenderArguments {
                    sender: CompactNode::from_node(&self.local),
                },
            },
        ));
    }

    fn process_stabilize_response(&mut self, arguments: NeighborsResponseArguments) {
        let successor = self.successor();

        // A node between us and our successor appeared; it is our successor.
        if let Some(candidate) = arguments.predecessor {
            let candidate = peer_ref_in(&self.space, candidate, None);
            if candidate.id.in_open_interval(self.local.id, successor.id) {
                debug!(%candidate, "Stabilize found a closer successor");
                self.adopt_successor(candidate);
            }
        }

        // Refresh our redundancy from the successor's own list.
        let space = self.space;
        let tail: Vec<NodeRef> = arguments
            .successors
            .iter()
            .map(|n| peer_ref_in(&space, *n, None))
            .collect();
        self.successor_list.refresh(self.successor(), &tail);

        self.notify_successor();
    }

    fn notify_successor(&mut self) {
        let successor = self.successor();
        if successor.id == self.local.id {
            return;
        }

        // Fire and forget; the pong is ignored and the inflight entry ages out.
        self.socket.request(
            successor.address,
            RequestSpecific::Notify {
                arguments: SenderArguments {
                    sender: CompactNode::from_node(&self.local),
                },
            },
        );
    }

    /// Refresh one finger per round, round-robin over entries 1..m.
    /// Entry 0 is the successor pointer and is maintained by stabilize.
    fn fix_fingers(&mut self) {
        let m = self.finger_table.len();
        if m <= 1 {
            return;
        }

        let index = self.next_finger;
        self.next_finger += 1;
        if self.next_finger >= m {
            self.next_finger = 1;
        }

        let start = match self.finger_table.get(index) {
            Some(finger) => finger.start(),
            None => return,
        };

        let successor = self.successor();
        if start.in_open_closed_interval(self.local.id, successor.id) {
            // The successor covers this start; no network round needed.
            self.finger_table.set(index, successor);
            return;
        }

        self.start_lookup(
            LookupKind::Successor,
            start,
            LookupPurpose::FixFinger(index),
            None,
        );
    }

    /// Ping the predecessor; the timeout handling in [Rpc::maintain_ring]
    /// clears it when it stops answering.
    fn check_predecessor(&mut self) {
        if self.pending_predecessor_check.is_some() {
            return;
        }

        let predecessor = match self.predecessor {
            Some(predecessor) if predecessor.id != self.local.id => predecessor,
            _ => return,
        };

        self.pending_predecessor_check = Some(self.socket.request(
            predecessor.address,
            RequestSpecific::Ping {
                arguments: SenderArguments {
                    sender: CompactNode::from_node(&self.local),
                },
            },
        ));
    }

    fn adopt_successor(&mut self, successor: NodeRef) {
        self.finger_table.set_successor(successor);
        self.successor_list.set_head(successor);
    }

    fn handle_successor_failure(&mut self) {
        let failed = self.successor();
        debug!(%failed, "Successor stopped answering");

        let replacement = self.successor_list.advance(failed.id).unwrap_or(self.local);

        self.finger_table.set_successor(replacement);
        self.finger_table.replace_node(failed.id, replacement);

        if let Some(predecessor) = self.predecessor {
            if predecessor.id == failed.id {
                self.predecessor = None;
            }
        }

        info!(%failed, %replacement, "Replaced failed successor from the successor list");
    }

    /// Canonicalizes a wire node reference: a sender bound to a wildcard
    /// address advertises 0.0.0.0, substitute the address we actually saw.
    fn peer_ref(&self, wire: &CompactNode, from: SocketAddrV4) -> NodeRef {
        peer_ref_in(&self.space, *wire, Some(from))
    }

    fn node_response(&self, node: NodeRef) -> NodeResponseArguments {
        NodeResponseArguments {
            sender: CompactNode::from_node(&self.local),
            node: CompactNode::from_node(&node),
        }
    }
}

enum Routed {
    /// The target is in `(us, successor]`; the successor owns it.
    Owned(NodeRef),
    /// Redirect to this closer node.
    Closer(NodeRef),
}

fn peer_ref_in(space: &RingSpace, wire: CompactNode, from: Option<SocketAddrV4>) -> NodeRef {
    let mut node = wire.to_node(space);

    if let Some(from) = from {
        if node.address.ip().is_unspecified() {
            node.address = SocketAddrV4::new(*from.ip(), node.address.port());
        }
    }

    node
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn test_rpc(bits: u8, id: u64) -> Rpc {
        Rpc::new(Config {
            bits,
            id: Some(id),
            request_timeout: Duration::from_millis(100),
            ..Config::default()
        })
        .expect("bind test rpc")
    }

    fn node(space: RingSpace, id: u64, port: u16) -> NodeRef {
        NodeRef::new(
            space.id(id),
            std::net::SocketAddrV4::new([127, 0, 0, 1].into(), port),
        )
    }

    #[test]
    fn singleton_owns_the_whole_ring() {
        let mut rpc = test_rpc(3, 0);
        let space = rpc.space();

        for key in 0..8 {
            let (tx, rx) = flume::bounded(1);
            rpc.find_successor(space.id(key), Some(tx));
            assert_eq!(rx.recv().expect("result"), Ok(rpc.local()));
        }
    }

    #[test]
    fn singleton_is_its_own_predecessor() {
        let mut rpc = test_rpc(3, 0);
        let space = rpc.space();

        let (tx, rx) = flume::bounded(1);
        rpc.find_predecessor(space.id(5), Some(tx));
        assert_eq!(rx.recv().expect("result"), Ok(rpc.local()));
    }

    #[test]
    fn find_successor_local_fast_path() {
        let mut rpc = test_rpc(3, 0);
        let mut peer = test_rpc(3, 3);
        let space = rpc.space();

        let successor = NodeRef::new(space.id(3), peer.local_addr());
        rpc.adopt_successor(successor);

        // Keys in (0, 3] belong to the successor; it only has to answer
        // the liveness probe, no routing happens.
        let (tx, rx) = flume::bounded(1);
        rpc.find_successor(space.id(2), Some(tx));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "fast path did not resolve");

            rpc.tick();
            peer.tick();

            if let Ok(result) = rx.try_recv() {
                assert_eq!(result.map(|n| n.id), Ok(space.id(3)));
                break;
            }
        }
    }

    #[test]
    fn find_successor_fast_path_fails_on_a_dead_successor() {
        let mut rpc = Rpc::new(Config {
            bits: 3,
            id: Some(0),
            request_timeout: Duration::from_millis(50),
            ..Config::default()
        })
        .expect("bind test rpc");
        let space = rpc.space();

        // A successor that is not listening anywhere.
        rpc.adopt_successor(node(space, 3, 1));

        let (tx, rx) = flume::bounded(1);
        rpc.find_successor(space.id(2), Some(tx));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "lookup did not finish");

            rpc.tick();

            if let Ok(result) = rx.try_recv() {
                assert_eq!(result, Err(LookupError::LookupFailed));
                break;
            }
        }
    }

    #[test]
    fn notify_adopts_closer_predecessors_only() {
        let mut rpc = test_rpc(3, 0);
        let space = rpc.space();

        rpc.notified_by(node(space, 5, 6005));
        assert_eq!(rpc.predecessor().map(|p| p.id), Some(space.id(5)));

        // 6 is between 5 and 0: closer predecessor.
        rpc.notified_by(node(space, 6, 6006));
        assert_eq!(rpc.predecessor().map(|p| p.id), Some(space.id(6)));

        // 3 is not in (6, 0): keep the current predecessor.
        rpc.notified_by(node(space, 3, 6003));
        assert_eq!(rpc.predecessor().map(|p| p.id), Some(space.id(6)));
    }

    #[test]
    fn stabilize_kick_adopts_predecessor_as_successor() {
        let mut rpc = test_rpc(3, 0);
        let space = rpc.space();

        // A second node notified us but we are still our own successor.
        rpc.notified_by(node(space, 3, 6003));
        assert_eq!(rpc.successor().id, space.id(0));

        rpc.stabilize();

        assert_eq!(rpc.successor().id, space.id(3));
    }

    #[test]
    fn stabilize_on_a_consistent_ring_changes_nothing() {
        let mut rpc = test_rpc(3, 0);
        let space = rpc.space();

        let successor = node(space, 1, 6001);
        rpc.adopt_successor(successor);

        // The successor's predecessor is already us; its list is consistent.
        rpc.process_stabilize_response(NeighborsResponseArguments {
            sender: CompactNode::from_node(&successor),
            predecessor: Some(CompactNode::from_node(&rpc.local())),
            successors: vec![
                CompactNode::from_node(&node(space, 3, 6003)),
                CompactNode::from_node(&rpc.local()),
            ],
        });

        assert_eq!(rpc.successor(), successor);
        let ids: Vec<u64> = rpc.successor_list().iter().map(|n| n.id.value()).collect();
        assert_eq!(ids, vec![1, 3]);

        // A second identical round reaches the same state.
        rpc.process_stabilize_response(NeighborsResponseArguments {
            sender: CompactNode::from_node(&successor),
            predecessor: Some(CompactNode::from_node(&rpc.local())),
            successors: vec![
                CompactNode::from_node(&node(space, 3, 6003)),
                CompactNode::from_node(&rpc.local()),
            ],
        });

        assert_eq!(rpc.successor(), successor);
        let ids: Vec<u64> = rpc.successor_list().iter().map(|n| n.id.value()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn successor_failure_promotes_from_the_list() {
        let mut rpc = test_rpc(3, 1);
        let space = rpc.space();

        let first = node(space, 3, 6003);
        let second = node(space, 6, 6006);
        rpc.adopt_successor(first);
        rpc.successor_list.refresh(first, &[second]);

        rpc.handle_successor_failure();

        assert_eq!(rpc.successor(), second);
        // Finger entries caching the failed node were rewritten.
        assert!(!(0..rpc.finger_table.len())
            .filter_map(|i| rpc.finger_table.get(i))
            .any(|f| f.node().id == first.id));
    }

    #[test]
    fn successor_failure_without_backups_isolates_the_node() {
        let mut rpc = test_rpc(3, 1);
        let space = rpc.space();

        let first = node(space, 3, 6003);
        rpc.adopt_successor(first);
        rpc.successor_list.refresh(first, &[]);

        rpc.handle_successor_failure();

        assert_eq!(rpc.successor(), rpc.local());
    }

    #[test]
    fn answers_closest_preceding_finger_over_the_wire() {
        use crate::common::LookupRequestArguments;

        let mut server = test_rpc(3, 0);
        let space = server.space();
        server.adopt_successor(node(space, 1, 6001));
        server.finger_table.set(1, node(space, 3, 6003));
        let server_address = server.local_addr();

        let mut client = test_rpc(3, 6);
        let local = client.local();

        let tid = client.socket.request(
            server_address,
            RequestSpecific::ClosestPrecedingFinger {
                arguments: LookupRequestArguments {
                    sender: CompactNode::from_node(&local),
                    target: 6,
                },
            },
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "no answer within the deadline");

            server.tick();

            if let Some((message, _)) = client.socket.recv_from() {
                assert_eq!(message.transaction_id, tid);
                match message.message_type {
                    MessageType::Response(ResponseSpecific::ClosestPreceding { arguments }) => {
                        // Node 3 is server's closest finger preceding 6.
                        assert_eq!(arguments.node.id, 3);
                        break;
                    }
                    other => panic!("expected closest_preceding, got {:?}", other),
                }
            }
        }
    }

    #[test]
    fn route_owns_or_redirects() {
        let mut rpc = test_rpc(3, 0);
        let space = rpc.space();

        rpc.adopt_successor(node(space, 1, 6001));
        rpc.finger_table.set(1, node(space, 3, 6003));

        match rpc.route(space.id(1)) {
            Routed::Owned(n) => assert_eq!(n.id, space.id(1)),
            Routed::Closer(n) => panic!("expected ownership, got redirect to {}", n),
        }

        match rpc.route(space.id(6)) {
            Routed::Closer(n) => assert_eq!(n.id, space.id(3)),
            Routed::Owned(n) => panic!("expected redirect, got ownership by {}", n),
        }
    }
}
