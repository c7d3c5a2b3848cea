//! gossip-core: wire codec, error taxonomy and configuration.
//! All other gossip crates depend on this one.

pub mod config;
pub mod error;
pub mod wire;

pub use error::{Error, Result};
pub use wire::{Message, MessageKind, PeerAddress, WireError};
