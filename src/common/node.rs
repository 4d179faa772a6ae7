//! Address-only reference to a ring participant.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddrV4;

use crate::common::RingId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A peer on the ring: its id and network address.
///
/// This is all a node ever holds about another node; there is no live
/// connection state behind a `NodeRef`.
pub struct NodeRef {
    pub id: RingId,
    pub address: SocketAddrV4,
}

impl NodeRef {
    pub fn new(id: RingId, address: SocketAddrV4) -> NodeRef {
        NodeRef { id, address }
    }
}

impl Display for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.id, self.address)
    }
}
