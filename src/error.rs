//! Crate-level error type.

use crate::rpc::LookupError;

#[derive(thiserror::Error, Debug)]
/// Errors surfaced by the public [crate::Chord] handle.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error], e.g. failing to bind the UDP socket.
    Io(#[from] std::io::Error),

    /// The configured identifier bit length is outside `1..=64`.
    #[error("invalid ring bit length: {0} (expected 1..=64)")]
    InvalidRingBits(u8),

    #[error(transparent)]
    /// A lookup (including the join lookup) failed.
    Lookup(#[from] LookupError),

    /// The node's actor thread is no longer running.
    #[error("node was shut down")]
    Shutdown,
}
