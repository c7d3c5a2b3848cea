//! Gossip integration test harness.
//!
//! Everything runs in-process over loopback TCP: a real directory server,
//! real nodes, and raw clients speaking the line protocol directly.
//!
//!   cargo test --test integration
//!
//! Each test starts its own directory on an ephemeral port, so tests never
//! share state.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use gossip_core::wire::{read_message, write_message};
use gossip_core::{Message, MessageKind, WireError};
use gossip_directory::DirectoryServer;

mod directory;
mod overlay;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Start a directory on an ephemeral loopback port.
pub async fn start_directory() -> Result<(SocketAddr, broadcast::Sender<()>)> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let server = DirectoryServer::bind("127.0.0.1:0", shutdown_tx.subscribe()).await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok((addr, shutdown_tx))
}

/// A port nothing is listening on right now.
pub async fn free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// Poll `check` until it holds or [`WAIT`] runs out.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A hand-driven protocol client.
pub struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.writer, message).await?;
        Ok(())
    }

    /// Next message, or the read error (EOF is `ConnectionClosed`).
    pub async fn recv(&mut self) -> Result<Result<Message, WireError>> {
        tokio::time::timeout(WAIT, read_message(&mut self.reader))
            .await
            .context("timed out waiting for a message")
    }

    /// Skip ahead to the next message of `kind`.
    pub async fn recv_kind(&mut self, kind: MessageKind) -> Result<Message> {
        loop {
            let message = self.recv().await??;
            if message.kind == kind {
                return Ok(message);
            }
        }
    }
}
