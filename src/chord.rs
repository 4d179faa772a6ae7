//! The public node handle.
//!
//! [Chord::new] binds a UDP socket, spawns the actor thread that owns all
//! ring state, and blocks until the node has joined (or started) its ring.
//! The handle itself is cheap to clone and safe to share across threads;
//! every method is a message to the actor plus a blocking wait for the
//! answer.

use std::net::SocketAddrV4;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::info;

use crate::common::{NodeRef, RingId};
use crate::rpc::{Config, LookupResult, Rpc};
use crate::Error;

#[derive(Debug)]
pub struct Chord {
    handle: Option<JoinHandle<()>>,
    sender: Sender<ActorMessage>,
}

impl Clone for Chord {
    fn clone(&self) -> Self {
        Chord {
            handle: None,
            sender: self.sender.clone(),
        }
    }
}

impl Chord {
    /// Creates a node, joins its ring, and returns once the join finished.
    ///
    /// With no bootstrap address configured the node starts a fresh ring
    /// and returns immediately. With one, this blocks until the join lookup
    /// resolved this node's successor, and fails with [Error::Lookup] when
    /// it could not.
    pub fn new(config: Config) -> Result<Chord, Error> {
        // Bind on the caller's thread so configuration and io errors are
        // returned synchronously.
        let mut rpc = Rpc::new(config)?;

        let (join_sender, join_receiver) = flume::bounded(1);
        rpc.start_join(join_sender);

        let (sender, receiver) = flume::unbounded();
        let handle = thread::Builder::new()
            .name("chord".to_string())
            .spawn(move || run(rpc, receiver))?;

        let node = Chord {
            handle: Some(handle),
            sender,
        };

        match join_receiver.recv() {
            Ok(Ok(_)) => Ok(node),
            Ok(Err(error)) => {
                node.shutdown();
                Err(Error::Lookup(error))
            }
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Returns a builder over the node [Config].
    pub fn builder() -> ChordBuilder {
        ChordBuilder::default()
    }

    // === Getters ===

    /// This node's own identifier.
    pub fn id(&self) -> Result<RingId, Error> {
        Ok(self.info()?.id())
    }

    /// The address this node is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4, Error> {
        Ok(self.info()?.local_addr())
    }

    /// A snapshot of the node's ring state.
    pub fn info(&self) -> Result<Info, Error> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    // === Public Methods ===

    /// Resolves the node owning `target`: the first node whose identifier
    /// is equal to or follows `target` on the ring.
    ///
    /// `target` is reduced modulo the ring size.
    pub fn find_successor(&self, target: u64) -> Result<NodeRef, Error> {
        self.lookup(|sender| ActorMessage::FindSuccessor(target, sender))
    }

    /// Resolves the node directly preceding `target` on the ring.
    pub fn find_predecessor(&self, target: u64) -> Result<NodeRef, Error> {
        self.lookup(|sender| ActorMessage::FindPredecessor(target, sender))
    }

    /// Hashes an arbitrary key onto the ring and resolves the node owning
    /// it.
    pub fn find_key(&self, key: &[u8]) -> Result<NodeRef, Error> {
        let key = key.to_vec();
        self.lookup(|sender| ActorMessage::FindKey(key, sender))
    }

    /// Asks the actor thread to stop and waits for it to exit.
    pub fn shutdown(mut self) {
        let (sender, receiver) = flume::bounded(1);

        if self.sender.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    // === Private Methods ===

    fn lookup(
        &self,
        message: impl FnOnce(Sender<LookupResult>) -> ActorMessage,
    ) -> Result<NodeRef, Error> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(message(sender))
            .map_err(|_| Error::Shutdown)?;

        let result = receiver.recv().map_err(|_| Error::Shutdown)?;

        Ok(result?)
    }
}

fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>) {
    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                info!(local = %rpc.local(), "Shutting down");
                let _ = sender.send(());
                return;
            }
            Ok(ActorMessage::FindSuccessor(target, sender)) => {
                let target = rpc.space().id(target);
                rpc.find_successor(target, Some(sender));
            }
            Ok(ActorMessage::FindPredecessor(target, sender)) => {
                let target = rpc.space().id(target);
                rpc.find_predecessor(target, Some(sender));
            }
            Ok(ActorMessage::FindKey(key, sender)) => {
                let target = rpc.space().hash_key(&key);
                rpc.find_successor(target, Some(sender));
            }
            Ok(ActorMessage::Info(sender)) => {
                let _ = sender.send(Info::from(&rpc));
            }
            Err(flume::TryRecvError::Empty) => {}
            Err(flume::TryRecvError::Disconnected) => {
                // Every handle is gone; nothing can reach this node anymore.
                info!(local = %rpc.local(), "All handles dropped, stopping");
                return;
            }
        }

        rpc.tick();
    }
}

enum ActorMessage {
    FindSuccessor(u64, Sender<LookupResult>),
    FindPredecessor(u64, Sender<LookupResult>),
    FindKey(Vec<u8>, Sender<LookupResult>),
    Info(Sender<Info>),
    Shutdown(Sender<()>),
}

#[derive(Debug, Clone)]
/// A snapshot of a node's ring state at one point in time.
pub struct Info {
    id: RingId,
    bits: u8,
    local_addr: SocketAddrV4,
    successor: NodeRef,
    predecessor: Option<NodeRef>,
    successor_list: Vec<NodeRef>,
}

impl Info {
    pub fn id(&self) -> RingId {
        self.id
    }

    /// The ring's identifier bit length m.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// The node's current immediate successor.
    pub fn successor(&self) -> NodeRef {
        self.successor
    }

    /// The node's current predecessor, if it learned one.
    pub fn predecessor(&self) -> Option<NodeRef> {
        self.predecessor
    }

    /// The redundant successors, nearest first.
    pub fn successor_list(&self) -> &[NodeRef] {
        &self.successor_list
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Info {
            id: rpc.id(),
            bits: rpc.space().bits(),
            local_addr: rpc.local_addr(),
            successor: rpc.successor(),
            predecessor: rpc.predecessor(),
            successor_list: rpc.successor_list().to_vec(),
        }
    }
}

#[derive(Debug, Default)]
/// Builds a [Chord] node from a [Config].
pub struct ChordBuilder {
    config: Config,
}

impl ChordBuilder {
    /// Sets the identifier bit length m. Must match the ring being joined.
    pub fn bits(mut self, bits: u8) -> Self {
        self.config.bits = bits;
        self
    }

    /// Sets an explicit node id instead of hashing the node's address.
    pub fn id(mut self, id: u64) -> Self {
        self.config.id = Some(id);
        self
    }

    /// Joins the ring through this known member.
    pub fn bootstrap(mut self, address: SocketAddrV4) -> Self {
        self.config.bootstrap = Some(address);
        self
    }

    /// Listens on this UDP port instead of an ephemeral one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn stabilize_interval(mut self, interval: Duration) -> Self {
        self.config.stabilize_interval = interval;
        self
    }

    pub fn fix_fingers_interval(mut self, interval: Duration) -> Self {
        self.config.fix_fingers_interval = interval;
        self
    }

    pub fn check_predecessor_interval(mut self, interval: Duration) -> Self {
        self.config.check_predecessor_interval = interval;
        self
    }

    /// Sets the successor list length r.
    pub fn successor_list_length(mut self, length: usize) -> Self {
        self.config.successor_list_length = length;
        self
    }

    pub fn build(self) -> Result<Chord, Error> {
        Chord::new(self.config)
    }
}

#[derive(Debug)]
/// A local ring for tests and demos: `count` nodes on ephemeral localhost
/// ports, the first one bootstrapping the rest, all with maintenance
/// intervals tightened so the ring converges in well under a second.
pub struct Testnet {
    pub nodes: Vec<Chord>,
}

impl Testnet {
    pub fn new(count: usize, bits: u8) -> Result<Testnet, Error> {
        let mut nodes: Vec<Chord> = Vec::with_capacity(count);

        for _ in 0..count {
            let mut builder = Self::node_builder().bits(bits);

            if let Some(first) = nodes.first() {
                builder = builder.bootstrap(first.local_addr()?);
            }

            nodes.push(builder.build()?);
        }

        Ok(Testnet { nodes })
    }

    /// A builder preconfigured with the testnet's tightened timings, for
    /// adding members to an existing testnet.
    pub fn node_builder() -> ChordBuilder {
        Chord::builder()
            .request_timeout(Duration::from_millis(200))
            .stabilize_interval(Duration::from_millis(50))
            .fix_fingers_interval(Duration::from_millis(50))
            .check_predecessor_interval(Duration::from_millis(50))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shutdown() {
        let node = Chord::builder().bits(8).build().expect("start node");

        node.shutdown();
    }

    #[test]
    fn clone_shares_the_same_node() {
        let node = Chord::builder().bits(8).id(42).build().expect("start node");
        let clone = node.clone();

        assert_eq!(clone.id().expect("id").value(), 42);

        node.shutdown();
    }

    #[test]
    fn fresh_ring_owns_every_key() {
        let node = Chord::builder().bits(8).id(7).build().expect("start node");

        let owner = node.find_successor(200).expect("lookup");
        assert_eq!(owner.id.value(), 7);

        let owner = node.find_key(b"some key").expect("lookup");
        assert_eq!(owner.id.value(), 7);

        node.shutdown();
    }

    #[test]
    fn join_through_bootstrap() {
        let first = Testnet::node_builder()
            .bits(8)
            .id(10)
            .build()
            .expect("start first node");

        let second = Testnet::node_builder()
            .bits(8)
            .id(200)
            .bootstrap(first.local_addr().expect("local addr"))
            .build()
            .expect("join second node");

        // The join resolved the second node's successor immediately.
        assert_eq!(
            second.info().expect("info").successor().id.value(),
            10,
            "the only other node is the successor"
        );

        second.shutdown();
        first.shutdown();
    }

    #[test]
    fn join_through_a_dead_bootstrap_fails() {
        let result = Testnet::node_builder()
            .bits(8)
            .bootstrap(std::net::SocketAddrV4::new([127, 0, 0, 1].into(), 1))
            .build();

        assert!(matches!(
            result,
            Err(Error::Lookup(crate::rpc::LookupError::LookupFailed))
        ));
    }
}
