//! UDP socket layer correlating outgoing requests with incoming responses.
//!
//! This is the transport collaborator of the protocol core: the actor only
//! ever calls [RpcSocket::request], [RpcSocket::response], [RpcSocket::error]
//! and [RpcSocket::recv_from], and never touches the socket itself. A request
//! whose response does not arrive within the configured timeout simply drops
//! out of the inflight table; the caller observes that through
//! [RpcSocket::inflight] turning false. UDP cannot tell an unreachable peer
//! from a silent one, so both look like a timeout.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific, ERROR_RING_MISMATCH,
};
use crate::rpc::config::Config;

const VERSION: [u8; 4] = [67, 104, 0, 1]; // "Ch" version 01
const MTU: usize = 2048;

/// Default request timeout before an inflight request to a non-responding
/// node is abandoned.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// The maximum duration to block on an empty socket buffer per receive
/// attempt. Lower values reduce latency at the cost of CPU.
const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A [UdpSocket] wrapper that frames and correlates ring protocol requests
/// and responses.
#[derive(Debug)]
pub struct RpcSocket {
    next_tid: u16,
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    ring_bits: u8,
    inflight_requests: InflightRequestsMap,
}

#[derive(Debug, Clone)]
struct InflightRequest {
    to: SocketAddrV4,
    sent_at: Instant,
}

impl RpcSocket {
    pub(crate) fn new(config: &Config) -> Result<RpcSocket, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(0))))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("RpcSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(RpcSocket {
            socket,
            next_tid: 0,
            local_addr,
            ring_bits: config.bits,
            inflight_requests: InflightRequestsMap::new(config.request_timeout),
        })
    }

    // === Getters ===

    /// Returns the address this node is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Returns true if this transaction_id is still awaiting a response.
    pub fn inflight(&self, transaction_id: &u16) -> bool {
        self.inflight_requests.contains_key(transaction_id)
    }

    /// Send a request to the given address and return the transaction_id.
    pub fn request(&mut self, address: SocketAddrV4, request: RequestSpecific) -> u16 {
        let transaction_id = self.tid();
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            ring_bits: self.ring_bits,
            message_type: MessageType::Request(request),
        };

        self.inflight_requests.insert(
            &transaction_id,
            InflightRequest {
                to: address,
                sent_at: Instant::now(),
            },
        );

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, ?address, "Error sending request message");
        });

        transaction_id
    }

    /// Send a response to the given address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            ring_bits: self.ring_bits,
            message_type: MessageType::Response(response),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, ?address, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddrV4, transaction_id: u16, error: ErrorSpecific) {
        let message = Message {
            transaction_id,
            version: Some(VERSION),
            ring_bits: self.ring_bits,
            message_type: MessageType::Error(error),
        };

        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, ?address, "Error sending error message");
        });
    }

    /// Receives a single protocol message from the socket.
    ///
    /// Requests from a ring with a different bit length are answered with an
    /// error message and never reach the caller; responses are only returned
    /// when they match an inflight request from the right address.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        self.inflight_requests.cleanup();

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!("Ignoring message from port 0");
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        let should_return = match message.message_type {
                            MessageType::Request(_) => {
                                trace!(?message, ?from, "Received request message");
                                self.check_ring_bits(&message, from)
                            }
                            MessageType::Response(_) | MessageType::Error(_) => {
                                trace!(?message, ?from, "Received response message");
                                self.is_expected_response(&message, &from)
                            }
                        };

                        if should_return {
                            return Some((message, from));
                        }
                    }
                    Err(error) => {
                        trace!(
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid bencode message"
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!("Received IPv6 packet, ignoring");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(?e, "recv_from failed unexpectedly");
            }
        }

        None
    }

    // === Private Methods ===

    /// A request from a ring with a different `m` is a configuration error,
    /// not a peer; answer with a protocol error and drop it.
    fn check_ring_bits(&mut self, message: &Message, from: SocketAddrV4) -> bool {
        if message.ring_bits == self.ring_bits {
            return true;
        }

        debug!(
            ?from,
            theirs = message.ring_bits,
            ours = self.ring_bits,
            "Request from a ring with a different bit length"
        );
        self.error(
            from,
            message.transaction_id,
            ErrorSpecific {
                code: ERROR_RING_MISMATCH,
                description: format!(
                    "ring bit length mismatch: ours is {}, yours is {}",
                    self.ring_bits, message.ring_bits
                ),
            },
        );

        false
    }

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        // Positive or error response to an inflight request.
        if let Some(request) = self.inflight_requests.remove(&message.transaction_id) {
            if compare_socket_addr(&request.to, from) {
                return true;
            }
            trace!(?from, "Response from wrong address");
        } else {
            trace!(
                transaction_id = message.transaction_id,
                "Unexpected response id"
            );
        }

        false
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&mut self) -> u16 {
        // Transaction ids are not reused; the timeout is short enough that
        // wrapping 65535 ids is harmless.
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn send(&mut self, address: SocketAddrV4, message: Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(?message, "Sent message");
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SendMessageError {
    /// Failed to serialize the outgoing message.
    #[error("Failed to encode message: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),
}

// Same as SocketAddrV4::eq but ignores the ip if it is unspecified,
// so nodes bound to 0.0.0.0 can talk to themselves in tests.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[derive(Debug)]
struct InflightRequestsMap {
    request_timeout: Duration,
    requests: Vec<(u16, InflightRequest)>,
}

impl InflightRequestsMap {
    fn new(request_timeout: Duration) -> InflightRequestsMap {
        InflightRequestsMap {
            request_timeout,
            requests: vec![],
        }
    }

    fn contains_key(&self, key: &u16) -> bool {
        if let Some(request) = self
            .requests
            .iter()
            .find(|(tid, _)| tid == key)
            .map(|(_, r)| r)
        {
            if request.sent_at.elapsed() < self.request_timeout {
                return true;
            }
        }

        false
    }

    fn insert(&mut self, key: &u16, inflight_request: InflightRequest) {
        self.requests.retain(|(tid, _)| tid != key);
        self.requests.push((*key, inflight_request));
    }

    fn remove(&mut self, key: &u16) -> Option<InflightRequest> {
        match self.requests.iter().position(|(tid, _)| tid == key) {
            Some(index) => Some(self.requests.remove(index).1),
            None => None,
        }
    }

    /// Drop requests that have outlived the timeout. Requests are pushed in
    /// send order, so expired entries sit at the front.
    fn cleanup(&mut self) {
        let timeout = self.request_timeout;
        self.requests
            .retain(|(_, request)| request.sent_at.elapsed() < timeout);
    }
}
