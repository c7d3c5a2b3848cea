//! Chat receiver: turns SAY/SAYTO/NAME traffic into console lines.

use tokio::sync::mpsc;

use gossip_core::{Error, Message, MessageKind};

use crate::peer::{NameClaim, Peer, PeerRegistry};
use crate::service::MessageReceiver;

/// Sink for user-visible lines.
pub type OutputSink = mpsc::UnboundedSender<String>;

/// Push a line to the console. A closed sink is logged, not an error.
pub fn emit(output: &OutputSink, line: String) {
    if output.send(line).is_err() {
        tracing::debug!("output sink closed");
    }
}

/// Default [`MessageReceiver`] for the chat node.
pub struct ChatReceiver {
    registry: PeerRegistry,
    output: OutputSink,
}

impl ChatReceiver {
    pub fn new(registry: PeerRegistry, output: OutputSink) -> Self {
        Self { registry, output }
    }

    fn handle_name(&self, name: &str, from: &Peer) {
        let name = name.trim();
        match self.registry.claim_name(&from.address, name) {
            Ok(NameClaim::Accepted { previous }) => {
                emit(&self.output, format!("{previous} is now known as {name}"));
            }
            Ok(NameClaim::Unchanged) => {}
            Ok(NameClaim::Invalid) => {
                tracing::debug!(peer = %from.address, name, "ignoring invalid name claim");
            }
            Ok(NameClaim::UnknownPeer) => {
                tracing::debug!(peer = %from.address, "name claim from peer no longer known");
            }
            Err(Error::IdentityConflict { .. }) => {
                emit(
                    &self.output,
                    format!("{from} tried to use an already taken username"),
                );
            }
            Err(e) => tracing::warn!(error = %e, "name claim failed"),
        }
    }
}

impl MessageReceiver for ChatReceiver {
    fn receive(&self, message: Message, from: &Peer) {
        match message.kind {
            MessageKind::Say => emit(&self.output, format!("[{from}] {}", message.payload)),
            MessageKind::SayTo => {
                emit(&self.output, format!("[{from} -> you] {}", message.payload))
            }
            MessageKind::Name => self.handle_name(&message.payload, from),
            MessageKind::Hello | MessageKind::Peers | MessageKind::Welcome => {
                tracing::warn!(peer = %from.address, %message, "unexpected message kind from peer");
            }
        }
    }

    fn handle_hello(&self, _payload: &str, from: &Peer) {
        let local = self.registry.local_name();
        if local.is_empty() {
            tracing::debug!(peer = %from.address, "no local name yet, skipping NAME");
            return;
        }
        self.registry.send_to(&from.address, Message::name(&local));
    }
}
