#![doc = include_str!("../README.md")]

mod chord;
mod common;
mod error;
pub mod rpc;

pub use crate::chord::{Chord, ChordBuilder, Info, Testnet};
pub use crate::common::{NodeRef, RingId, RingSpace, MAX_RING_BITS};
pub use crate::error::Error;
pub use crate::rpc::{Config, LookupError};
