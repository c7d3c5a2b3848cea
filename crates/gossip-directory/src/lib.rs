//! gossip-directory: rendezvous service for gossip nodes.

pub mod server;
pub mod state;

pub use server::DirectoryServer;
pub use state::{Audience, ConnectionRecord, DirectoryState, Identify};
