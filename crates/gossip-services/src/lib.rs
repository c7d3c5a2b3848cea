//! gossip-services: peer registry and chat application logic.
//! Network-free: the daemon feeds these types from its sockets.

pub mod chat;
pub mod command;
pub mod peer;
pub mod service;

pub use chat::{emit, ChatReceiver, OutputSink};
pub use command::CommandProcessor;
pub use peer::{NameClaim, OutboundQueue, Peer, PeerLookup, PeerRegistry, ReconcileSummary};
pub use service::MessageReceiver;
