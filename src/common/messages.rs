//! Wire format of the ring protocol messages.
//!
//! Messages are bencoded. Every message carries a transaction id, the
//! sender's software version, the ring bit length `m`, and a request,
//! response or error variant. Node references travel as an id integer plus a
//! compact 6-byte address (4 ip + 2 port, big endian).

use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::common::{NodeRef, RingSpace};

/// Error code sent when a peer's ring bit length differs from ours.
pub const ERROR_RING_MISMATCH: i32 = 301;
/// Error code for requests this node cannot parse or serve.
pub const ERROR_METHOD_UNKNOWN: i32 = 204;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    #[serde(rename = "t")]
    pub transaction_id: u16,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    pub version: Option<[u8; 4]>,

    /// The sender's ring bit length. All members of one ring must agree.
    #[serde(rename = "m")]
    pub ring_bits: u8,

    #[serde(flatten)]
    pub message_type: MessageType,
}

impl Message {
    pub fn from_bytes(bytes: &[u8]) -> Result<Message, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum MessageType {
    #[serde(rename = "q")]
    Request(RequestSpecific),

    #[serde(rename = "r")]
    Response(ResponseSpecific),

    #[serde(rename = "e")]
    Error(ErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum RequestSpecific {
    /// Resolve the node owning `target`: the first node clockwise from it.
    #[serde(rename = "find_successor")]
    FindSuccessor {
        #[serde(rename = "a")]
        arguments: LookupRequestArguments,
    },

    /// Resolve the node directly preceding `target` on the ring.
    #[serde(rename = "find_predecessor")]
    FindPredecessor {
        #[serde(rename = "a")]
        arguments: LookupRequestArguments,
    },

    /// Ask a node for its finger preceding `target` most closely.
    #[serde(rename = "closest_preceding_finger")]
    ClosestPrecedingFinger {
        #[serde(rename = "a")]
        arguments: LookupRequestArguments,
    },

    /// Ask a node for its predecessor and successor list (stabilization).
    #[serde(rename = "get_predecessor")]
    GetPredecessor {
        #[serde(rename = "a")]
        arguments: SenderArguments,
    },

    /// Tell a node the sender believes it is its predecessor.
    #[serde(rename = "notify")]
    Notify {
        #[serde(rename = "a")]
        arguments: SenderArguments,
    },

    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: SenderArguments,
    },
}

impl RequestSpecific {
    /// The wire node reference of whoever sent this request.
    pub fn sender(&self) -> &CompactNode {
        match self {
            RequestSpecific::FindSuccessor { arguments } => &arguments.sender,
            RequestSpecific::FindPredecessor { arguments } => &arguments.sender,
            RequestSpecific::ClosestPrecedingFinger { arguments } => &arguments.sender,
            RequestSpecific::GetPredecessor { arguments } => &arguments.sender,
            RequestSpecific::Notify { arguments } => &arguments.sender,
            RequestSpecific::Ping { arguments } => &arguments.sender,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "r")]
pub enum ResponseSpecific {
    /// Final answer to `find_successor`: `node` owns the target.
    #[serde(rename = "found_successor")]
    FoundSuccessor {
        #[serde(rename = "a")]
        arguments: NodeResponseArguments,
    },

    /// Final answer to `find_predecessor`: the responder precedes the target.
    #[serde(rename = "found_predecessor")]
    FoundPredecessor {
        #[serde(rename = "a")]
        arguments: NodeResponseArguments,
    },

    /// The responder does not own the target; `node` is a closer hop
    /// (its closest preceding finger).
    #[serde(rename = "redirect")]
    Redirect {
        #[serde(rename = "a")]
        arguments: NodeResponseArguments,
    },

    /// Answer to an explicit `closest_preceding_finger` request.
    #[serde(rename = "closest_preceding")]
    ClosestPreceding {
        #[serde(rename = "a")]
        arguments: NodeResponseArguments,
    },

    /// Answer to `get_predecessor`: the responder's predecessor (if any)
    /// and its successor list.
    #[serde(rename = "neighbors")]
    Neighbors {
        #[serde(rename = "a")]
        arguments: NeighborsResponseArguments,
    },

    /// Acknowledgment of `ping` and `notify`.
    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "a")]
        arguments: SenderArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LookupRequestArguments {
    #[serde(rename = "n")]
    pub sender: CompactNode,

    #[serde(rename = "x")]
    pub target: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SenderArguments {
    #[serde(rename = "n")]
    pub sender: CompactNode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeResponseArguments {
    #[serde(rename = "n")]
    pub sender: CompactNode,

    #[serde(rename = "o")]
    pub node: CompactNode,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NeighborsResponseArguments {
    #[serde(rename = "n")]
    pub sender: CompactNode,

    #[serde(default)]
    #[serde(rename = "p", skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<CompactNode>,

    #[serde(rename = "s")]
    pub successors: Vec<CompactNode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorSpecific {
    #[serde(rename = "c")]
    pub code: i32,

    #[serde(rename = "d")]
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
/// A [NodeRef] as it travels on the wire.
pub struct CompactNode {
    #[serde(rename = "i")]
    pub id: u64,

    #[serde(rename = "a", with = "serde_bytes")]
    pub address: [u8; 6],
}

impl CompactNode {
    pub fn from_node(node: &NodeRef) -> CompactNode {
        CompactNode {
            id: node.id.value(),
            address: address_to_bytes(node.address),
        }
    }

    /// Reduces the id into `space` on the way in, so a malformed peer can
    /// never inject an out-of-range id.
    pub fn to_node(self, space: &RingSpace) -> NodeRef {
        NodeRef::new(space.id(self.id), address_from_bytes(self.address))
    }
}

fn address_to_bytes(address: SocketAddrV4) -> [u8; 6] {
    let ip = address.ip().octets();
    let port = address.port().to_be_bytes();

    [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
}

fn address_from_bytes(bytes: [u8; 6]) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
        u16::from_be_bytes([bytes[4], bytes[5]]),
    )
}
