//! Receiver trait for messages arriving on identified peer connections.
//!
//! The network layer owns sockets and identification; the receiver owns
//! what a message means. This trait is the contract between the two.

use gossip_core::Message;

use crate::peer::Peer;

/// Application-side handler for inbound peer traffic.
///
/// Called from per-connection tasks, so implementations must be cheap and
/// must not block.
pub trait MessageReceiver: Send + Sync {
    /// A message from an identified peer. HELLO never reaches this method.
    fn receive(&self, message: Message, from: &Peer);

    /// An inbound connection was just bound to `from`. Fires once per binding.
    fn handle_hello(&self, payload: &str, from: &Peer);
}
