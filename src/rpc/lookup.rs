//! Iterative lookup: repeatedly ask the closest known node for the target
//! until one of them owns it.
//!
//! Each hop either answers with the final result or redirects to its closest
//! preceding finger; following redirects strictly shrinks the remaining ring
//! distance, which bounds the walk. A hop that times out is replaced by the
//! next fallback candidate (lower fingers, then successor-list entries); when
//! every candidate is exhausted the lookup fails rather than returning a
//! guess. A final answer is additionally pinged before it is handed to the
//! caller, so a node that died after answering its last stabilization round
//! is reported as a failure, not as the owner.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use flume::Sender;
use tracing::{debug, trace};

use crate::common::{
    CompactNode, LookupRequestArguments, NodeRef, RequestSpecific, RingId, SenderArguments,
};
use crate::rpc::socket::RpcSocket;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Failure of a single lookup, surfaced to the caller.
pub enum LookupError {
    /// Every candidate route to the target was exhausted. The caller may
    /// retry after the next stabilization rounds repaired the ring.
    #[error("lookup failed: exhausted all candidate routes to the target")]
    LookupFailed,

    /// The contacted ring uses a different identifier bit length. This is a
    /// configuration error and will not resolve by retrying.
    #[error("ring mismatch: the remote ring uses a different identifier bit length")]
    InvalidRing,
}

pub type LookupResult = Result<NodeRef, LookupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    /// Resolve the node owning the target id.
    Successor,
    /// Resolve the node directly preceding the target id.
    Predecessor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why this lookup exists; decides what happens to the result besides
/// notifying the senders.
pub enum LookupPurpose {
    /// Requested through the public handle.
    Client,
    /// Refreshing finger table entry i.
    FixFinger(usize),
    /// The join bootstrap: the result becomes this node's successor.
    Join,
}

#[derive(Debug)]
enum Phase {
    /// Walking the ring towards the target.
    Routing,
    /// Got a final answer; pinging it to make sure it is alive.
    Verifying(NodeRef),
    /// Finished, result recorded.
    Done(LookupResult),
}

#[derive(Debug)]
pub struct Lookup {
    kind: LookupKind,
    target: RingId,
    purpose: LookupPurpose,
    request: RequestSpecific,
    local: NodeRef,

    phase: Phase,
    /// Candidates to fall back to when the current hop fails, best first.
    fallbacks: Vec<NodeRef>,
    visited: HashSet<SocketAddrV4>,
    inflight: Option<u16>,
    hops: usize,
    max_hops: usize,

    senders: Vec<Sender<LookupResult>>,
}

impl Lookup {
    pub fn new(
        kind: LookupKind,
        target: RingId,
        local: NodeRef,
        purpose: LookupPurpose,
        max_hops: usize,
    ) -> Lookup {
        let arguments = LookupRequestArguments {
            sender: CompactNode::from_node(&local),
            target: target.value(),
        };
        let request = match kind {
            LookupKind::Successor => RequestSpecific::FindSuccessor { arguments },
            LookupKind::Predecessor => RequestSpecific::FindPredecessor { arguments },
        };

        trace!(?kind, %target, ?purpose, "New lookup");

        Lookup {
            kind,
            target,
            purpose,
            request,
            local,
            phase: Phase::Routing,
            fallbacks: Vec::new(),
            visited: HashSet::new(),
            inflight: None,
            hops: 0,
            max_hops,
            senders: Vec::new(),
        }
    }

    // === Getters ===

    pub fn kind(&self) -> LookupKind {
        self.kind
    }

    pub fn purpose(&self) -> LookupPurpose {
        self.purpose
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done(_))
    }

    /// The recorded result, once [Lookup::is_done] is true.
    pub fn result(&self) -> Option<LookupResult> {
        match &self.phase {
            Phase::Done(result) => Some(*result),
            _ => None,
        }
    }

    /// Return true if a response with this transaction_id belongs to this
    /// lookup.
    pub fn expects(&self, transaction_id: u16) -> bool {
        self.inflight == Some(transaction_id)
    }

    // === Public Methods ===

    pub fn add_sender(&mut self, sender: Option<Sender<LookupResult>>) {
        if let Some(sender) = sender {
            self.senders.push(sender);
        }
    }

    /// Queue a fallback candidate. Ordering of calls is significant: best
    /// candidates first.
    pub fn add_fallback(&mut self, node: NodeRef) {
        if node.address == self.local.address
            || self.visited.contains(&node.address)
            || self.fallbacks.iter().any(|n| n.address == node.address)
        {
            return;
        }
        self.fallbacks.push(node);
    }

    /// Send the lookup request to an explicit address; used for the first
    /// hop and for join bootstrapping, where only an address is known.
    pub fn visit(&mut self, socket: &mut RpcSocket, address: SocketAddrV4) {
        self.visited.insert(address);
        self.hops += 1;
        self.inflight = Some(socket.request(address, self.request.clone()));
    }

    /// A hop answered with the final result; verify it is alive before
    /// reporting, unless it is the local node itself.
    pub fn handle_found(&mut self, socket: &mut RpcSocket, node: NodeRef) {
        self.inflight = None;

        if node.address == self.local.address || self.visited.contains(&node.address) {
            // We already exchanged messages with it this lookup; alive.
            self.finish(Ok(node));
            return;
        }

        self.phase = Phase::Verifying(node);
        self.inflight = Some(socket.request(
            node.address,
            RequestSpecific::Ping {
                arguments: SenderArguments {
                    sender: CompactNode::from_node(&self.local),
                },
            },
        ));
    }

    /// A hop redirected us to a closer node.
    pub fn handle_redirect(&mut self, socket: &mut RpcSocket, closer: NodeRef) {
        self.inflight = None;

        if self.hops >= self.max_hops {
            debug!(target = %self.target, hops = self.hops, "Lookup exceeded hop budget");
            self.next(socket);
            return;
        }

        if self.visited.contains(&closer.address) {
            // Stale routing state sent us in a circle; try another route.
            self.next(socket);
            return;
        }

        self.visit(socket, closer.address);
    }

    /// The verification ping was answered.
    pub fn handle_pong(&mut self, from: NodeRef) {
        if let Phase::Verifying(node) = self.phase {
            self.inflight = None;
            trace!(%from, "Lookup result verified");
            self.finish(Ok(node));
        }
    }

    /// A hop answered with a protocol error; a bit length mismatch is fatal.
    pub fn handle_ring_mismatch(&mut self) {
        self.inflight = None;
        self.finish(Err(LookupError::InvalidRing));
    }

    /// Advance timeouts. The current hop failed when its transaction is no
    /// longer inflight in the socket and no response reached us.
    pub fn tick(&mut self, socket: &mut RpcSocket) {
        if self.is_done() {
            return;
        }

        if let Some(tid) = self.inflight {
            if socket.inflight(&tid) {
                return;
            }
            // Timed out or unreachable; either way this hop is gone.
            self.inflight = None;
            if let Phase::Verifying(node) = self.phase {
                debug!(candidate = %node, "Lookup result did not answer the liveness probe");
                self.phase = Phase::Routing;
            }
            self.next(socket);
        }
    }

    // === Private Methods ===

    /// Visit the next unvisited fallback, or give up.
    fn next(&mut self, socket: &mut RpcSocket) {
        while let Some(node) = self.pop_fallback() {
            if !self.visited.contains(&node.address) {
                self.visit(socket, node.address);
                return;
            }
        }

        self.finish(Err(LookupError::LookupFailed));
    }

    fn pop_fallback(&mut self) -> Option<NodeRef> {
        if self.fallbacks.is_empty() {
            None
        } else {
            Some(self.fallbacks.remove(0))
        }
    }

    /// Record the result and wake up everyone waiting on it.
    pub fn finish(&mut self, result: LookupResult) {
        debug!(kind = ?self.kind, target = %self.target, hops = self.hops, ?result, "Lookup done");

        for sender in self.senders.drain(..) {
            // A caller that hung up is not our problem.
            let _ = sender.send(result);
        }

        self.phase = Phase::Done(result);
        self.inflight = None;
    }
}
