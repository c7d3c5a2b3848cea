//! gossipd: chat node: directory session, peer links and inbound
//! identification around the registry from `gossip-services`.

pub mod discovery;
pub mod inbound;
pub mod link;
pub mod node;

pub use discovery::{DiscoveryClient, DiscoveryEvent, PeerSetTracker};
pub use inbound::{InboundConnection, InboundListener, RetryPolicy};
pub use link::PeerLink;
pub use node::{start, NodeHandle};
