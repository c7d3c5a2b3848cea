//! Directory server: accepts nodes, hands out guest names and keeps every
//! node's peer list in step with the live set.
//!
//! Per connection: WELCOME on accept, HELLO binds the chat address and
//! triggers a PEERS broadcast plus pairwise NAME introductions, and any read
//! error drops the record and re-broadcasts PEERS to the rest.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};

use gossip_core::wire::{read_message, write_message};
use gossip_core::{Message, MessageKind, WireError};

use crate::state::{Audience, DirectoryState, Identify};

pub struct DirectoryServer {
    listener: TcpListener,
    state: DirectoryState,
    shutdown: broadcast::Receiver<()>,
}

impl DirectoryServer {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind<A: ToSocketAddrs>(addr: A, shutdown: broadcast::Receiver<()>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind directory listen socket")?;
        Ok(Self {
            listener,
            state: DirectoryState::new(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> DirectoryState {
        self.state.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "directory listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("directory shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, source)) => {
                            tokio::spawn(handle_connection(stream, source, self.state.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept incoming connection");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, source: SocketAddr, state: DirectoryState) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &message).await {
                tracing::debug!(node = %source, error = %e, "write failed");
                break;
            }
        }
    });

    let pseudonym = state.register(source, tx);
    tracing::info!(node = %source, pseudonym, "node connected");

    match read_loop(read_half, source, &state).await {
        Err(WireError::ConnectionClosed) => tracing::info!(node = %source, "node disconnected"),
        Err(WireError::Io(e)) => tracing::info!(node = %source, error = %e, "node connection lost"),
        Err(e) => tracing::warn!(node = %source, error = %e, "dropping node after protocol error"),
        Ok(()) => {}
    }

    state.remove(&source);
    writer.abort();
    state.broadcast_peers(Audience::Identified);
}

async fn read_loop(
    read_half: OwnedReadHalf,
    source: SocketAddr,
    state: &DirectoryState,
) -> Result<(), WireError> {
    let mut reader = BufReader::new(read_half);

    loop {
        let message = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(node = %source, error = %e, "ignoring message");
                continue;
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(node = %source, %message, "received");

        match message.kind {
            MessageKind::Hello => {
                let port = message.hello_port()?;
                match state.identify(source, port) {
                    Identify::Identified(address) => {
                        tracing::info!(node = %source, chat = %address, "node identified");
                        state.broadcast_peers(Audience::All);
                        state.introduce(&source);
                    }
                    Identify::AlreadyIdentified(address) => {
                        tracing::warn!(node = %source, chat = %address, "repeated HELLO ignored");
                    }
                    Identify::UnknownConnection => return Err(WireError::ConnectionClosed),
                }
            }
            MessageKind::Say
            | MessageKind::SayTo
            | MessageKind::Name
            | MessageKind::Peers
            | MessageKind::Welcome => {
                tracing::warn!(node = %source, %message, "unexpected message kind");
            }
        }
    }
}
