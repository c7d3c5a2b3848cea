//! Chat listener: accepts peer connections and runs identification.
//!
//! Each connection gets a reader that feeds a dispatch task over a channel,
//! so slow registry lookups never stall the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};

use gossip_core::wire::read_message;
use gossip_core::Message;
use gossip_services::{MessageReceiver, PeerLookup};

use super::identify::{InboundConnection, RetryPolicy};

pub struct InboundListener {
    listener: TcpListener,
    lookup: Arc<dyn PeerLookup>,
    receiver: Arc<dyn MessageReceiver>,
    policy: RetryPolicy,
    shutdown: broadcast::Receiver<()>,
}

impl InboundListener {
    pub fn new(
        listener: TcpListener,
        lookup: Arc<dyn PeerLookup>,
        receiver: Arc<dyn MessageReceiver>,
        policy: RetryPolicy,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            lookup,
            receiver,
            policy,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "chat listener started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("chat listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, source)) => {
                            tracing::debug!(%source, "inbound chat connection");
                            tokio::spawn(handle_connection(
                                stream,
                                source,
                                self.lookup.clone(),
                                self.receiver.clone(),
                                self.policy,
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept chat connection");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    source: SocketAddr,
    lookup: Arc<dyn PeerLookup>,
    receiver: Arc<dyn MessageReceiver>,
    policy: RetryPolicy,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (closed_tx, closed_rx) = watch::channel(false);

    let mut conn = InboundConnection::new(source.ip(), lookup, receiver, policy, closed_rx);
    let mut dispatcher = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            conn.dispatch(message).await?;
        }
        Ok::<(), gossip_core::Error>(())
    });

    let mut reader = BufReader::new(stream);
    loop {
        tokio::select! {
            read = read_message(&mut reader) => match read {
                Ok(message) => {
                    tracing::debug!(%source, %message, "received");
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(%source, error = %e, "ignoring message");
                }
                Err(e) => {
                    tracing::debug!(%source, error = %e, "chat connection closed");
                    break;
                }
            },

            outcome = &mut dispatcher => {
                match outcome {
                    Ok(Err(e)) => tracing::warn!(%source, error = %e, "dropping chat connection"),
                    Ok(Ok(())) => {}
                    Err(e) => tracing::warn!(%source, error = %e, "dispatch task failed"),
                }
                return;
            }
        }
    }

    // Queued messages still drain; pending lookups give up.
    let _ = closed_tx.send(true);
    drop(tx);
    match dispatcher.await {
        Ok(Err(e)) => tracing::debug!(%source, error = %e, "dispatch ended with error"),
        Err(e) => tracing::warn!(%source, error = %e, "dispatch task failed"),
        Ok(Ok(())) => {}
    }
}
