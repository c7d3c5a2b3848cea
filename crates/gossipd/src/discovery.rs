//! Directory discovery client.
//!
//! Keeps a session open with the directory server, redialling on a fixed
//! interval whenever the connection drops. Every PEERS / NAME / WELCOME the
//! directory sends is folded into a [`PeerSetTracker`] and published to the
//! node's event loop as a [`DiscoveryEvent`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use gossip_core::wire::{read_message, write_message};
use gossip_core::{Message, MessageKind, PeerAddress};

/// What the directory told us, in a form the event loop can apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Name the directory assigned to this node.
    Welcome(String),
    /// Full current peer set: address → display name (address string until named).
    Peers(BTreeMap<PeerAddress, String>),
}

/// Addresses that entered and left the set with one PEERS message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerSetDelta {
    pub added: Vec<PeerAddress>,
    pub removed: Vec<PeerAddress>,
}

/// The client's last known peer set plus the names the directory bound.
#[derive(Debug, Default)]
pub struct PeerSetTracker {
    known: BTreeSet<PeerAddress>,
    names: HashMap<PeerAddress, String>,
}

impl PeerSetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the known set with `announced`.
    pub fn apply_peers(&mut self, announced: Vec<PeerAddress>) -> PeerSetDelta {
        let next: BTreeSet<PeerAddress> = announced.into_iter().collect();
        let removed: Vec<PeerAddress> = self.known.difference(&next).cloned().collect();
        let added: Vec<PeerAddress> = next.difference(&self.known).cloned().collect();
        for address in &removed {
            self.names.remove(address);
        }
        self.known = next;
        PeerSetDelta { added, removed }
    }

    /// Record a name. True if `address` is in the current set, i.e. the
    /// snapshot changed and should be republished.
    pub fn apply_name(&mut self, address: PeerAddress, name: String) -> bool {
        let present = self.known.contains(&address);
        self.names.insert(address, name);
        present
    }

    /// Current set with names, placeholders for unnamed addresses.
    pub fn snapshot(&self) -> BTreeMap<PeerAddress, String> {
        self.known
            .iter()
            .map(|address| {
                let name = self
                    .names
                    .get(address)
                    .cloned()
                    .unwrap_or_else(|| address.to_string());
                (address.clone(), name)
            })
            .collect()
    }
}

pub struct DiscoveryClient {
    directory_addr: String,
    chat_port: u16,
    reconnect_interval: Duration,
    connected: Arc<AtomicBool>,
    tracker: Arc<Mutex<PeerSetTracker>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl DiscoveryClient {
    pub fn new(
        directory_addr: String,
        chat_port: u16,
        reconnect_interval: Duration,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            directory_addr,
            chat_port,
            reconnect_interval,
            connected: Arc::new(AtomicBool::new(false)),
            tracker: Arc::new(Mutex::new(PeerSetTracker::new())),
            events,
            shutdown,
        }
    }

    /// Supervisor loop. Only process shutdown stops it.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.reconnect_interval);
        let mut session: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery client shutting down");
                    if let Some(handle) = session.take() {
                        handle.abort();
                    }
                    return Ok(());
                }

                _ = interval.tick() => {
                    if !self.connected.load(Ordering::Acquire) {
                        if let Some(handle) = self.connect().await {
                            session = Some(handle);
                        }
                    }
                }
            }
        }
    }

    /// Dial the directory and start a session. The dial is bounded by the
    /// reconnect interval so a silent host never holds up shutdown.
    async fn connect(&self) -> Option<JoinHandle<()>> {
        let dial = TcpStream::connect(&self.directory_addr);
        let stream = match tokio::time::timeout(self.reconnect_interval, dial).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                tracing::warn!(directory = %self.directory_addr, error = %e, "cannot connect to directory");
                return None;
            }
            Err(_) => {
                tracing::warn!(directory = %self.directory_addr, "directory dial timed out");
                return None;
            }
        };
        let (reader, mut writer) = stream.into_split();

        if let Err(e) = write_message(&mut writer, &Message::hello(self.chat_port)).await {
            tracing::warn!(error = %e, "failed to send HELLO to directory");
            return None;
        }
        tracing::info!(directory = %self.directory_addr, "connected to directory");
        self.connected.store(true, Ordering::Release);

        Some(tokio::spawn(read_flow(
            reader,
            writer,
            self.tracker.clone(),
            self.events.clone(),
            self.connected.clone(),
        )))
    }
}

/// Read directory messages until the transport fails.
///
/// Holds the write half so the session stays open in both directions.
async fn read_flow(
    reader: OwnedReadHalf,
    _writer: OwnedWriteHalf,
    tracker: Arc<Mutex<PeerSetTracker>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(reader);

    loop {
        let message = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "unknown message from directory");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "lost connection to directory");
                break;
            }
        };
        tracing::debug!(%message, "directory said");

        let event = match message.kind {
            MessageKind::Welcome => {
                let name = message.payload.trim();
                if name.is_empty() || name.split_whitespace().count() != 1 {
                    tracing::warn!(%message, "invalid WELCOME message");
                    continue;
                }
                Some(DiscoveryEvent::Welcome(name.to_string()))
            }
            MessageKind::Peers => {
                let mut tracker = tracker.lock().await;
                let delta = tracker.apply_peers(message.parse_peer_list());
                for address in &delta.removed {
                    tracing::info!(peer = %address, "peer left");
                }
                for address in &delta.added {
                    tracing::info!(peer = %address, "peer joined");
                }
                Some(DiscoveryEvent::Peers(tracker.snapshot()))
            }
            MessageKind::Name => match message.parse_name_binding() {
                Ok((address, name)) => {
                    tracing::info!(peer = %address, name, "directory bound name");
                    let mut tracker = tracker.lock().await;
                    tracker
                        .apply_name(address, name)
                        .then(|| DiscoveryEvent::Peers(tracker.snapshot()))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invalid NAME message");
                    None
                }
            },
            MessageKind::Hello | MessageKind::Say | MessageKind::SayTo => {
                tracing::warn!(%message, "unexpected message kind from directory");
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                tracing::debug!("node event loop gone, ending directory session");
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
}
