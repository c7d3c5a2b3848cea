//! Outbound peer link.
//!
//! One task per registry entry: dial the peer's chat address, introduce
//! ourselves with HELLO, then write everything queued for the peer in order.
//! Links are never re-dialled; the registry entry stays until the directory
//! drops the peer.

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use gossip_core::wire::write_message;
use gossip_core::{Message, PeerAddress};
use gossip_services::OutboundQueue;

pub struct PeerLink {
    address: PeerAddress,
    local_chat_port: u16,
    queue: OutboundQueue,
}

impl PeerLink {
    pub fn new(address: PeerAddress, local_chat_port: u16, queue: OutboundQueue) -> Self {
        Self {
            address,
            local_chat_port,
            queue,
        }
    }

    /// Run the link on its own task, logging how it ends.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let address = self.address.clone();
            match self.run().await {
                Ok(()) => tracing::debug!(peer = %address, "link closed"),
                Err(e) => tracing::warn!(peer = %address, error = %e, "link failed"),
            }
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let mut stream = TcpStream::connect((self.address.host(), self.address.port()))
            .await
            .with_context(|| format!("failed to dial {}", self.address))?;

        write_message(&mut stream, &Message::hello(self.local_chat_port))
            .await
            .context("failed to send HELLO")?;
        tracing::info!(peer = %self.address, "link established");

        while let Some(message) = self.queue.recv().await {
            write_message(&mut stream, &message)
                .await
                .with_context(|| format!("failed to send {}", message.kind.as_str()))?;
        }
        Ok(())
    }
}
