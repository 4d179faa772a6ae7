//! Ring node configuration.

use std::net::SocketAddrV4;
use std::time::Duration;

use crate::common::MAX_RING_BITS;
use crate::rpc::socket::DEFAULT_REQUEST_TIMEOUT;
use crate::Error;

/// Default identifier bit length m. All members of one ring must agree on it.
pub const DEFAULT_RING_BITS: u8 = 32;

/// Default length r of the redundant successor list.
pub const DEFAULT_SUCCESSOR_LIST_LENGTH: usize = 8;

pub const DEFAULT_STABILIZE_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_FIX_FINGERS_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CHECK_PREDECESSOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
/// Configuration of a single ring node.
pub struct Config {
    /// Identifier bit length m; the ring holds ids in `[0, 2^m)`.
    ///
    /// Defaults to [DEFAULT_RING_BITS]. Must be in `1..=64`.
    pub bits: u8,
    /// Explicit node id. Defaults to None, where the id is derived by
    /// hashing the node's own address onto the ring.
    pub id: Option<u64>,
    /// Address of a known ring member to join through.
    ///
    /// Defaults to None: this node starts a fresh ring as its only member.
    pub bootstrap: Option<SocketAddrV4>,
    /// Explicit UDP port to listen on. Defaults to None (ephemeral port).
    pub port: Option<u16>,
    /// Timeout for a single remote call.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]. A peer that does not answer
    /// within this duration is treated as failed for that call.
    pub request_timeout: Duration,
    /// How often to run the `stabilize` routine.
    pub stabilize_interval: Duration,
    /// How often to refresh one finger table entry.
    pub fix_fingers_interval: Duration,
    /// How often to ping the predecessor.
    pub check_predecessor_interval: Duration,
    /// Successor list length r.
    pub successor_list_length: usize,
}

impl Config {
    /// Rejects bit lengths the identifier arithmetic cannot represent.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.bits < 1 || self.bits > MAX_RING_BITS {
            return Err(Error::InvalidRingBits(self.bits));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bits: DEFAULT_RING_BITS,
            id: None,
            bootstrap: None,
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stabilize_interval: DEFAULT_STABILIZE_INTERVAL,
            fix_fingers_interval: DEFAULT_FIX_FINGERS_INTERVAL,
            check_predecessor_interval: DEFAULT_CHECK_PREDECESSOR_INTERVAL,
            successor_list_length: DEFAULT_SUCCESSOR_LIST_LENGTH,
        }
    }
}
