//! Node wiring: chat listener, directory session and the event loop that
//! keeps the registry and the outbound links in step with the directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use gossip_core::config::{GossipConfig, NodeConfig};
use gossip_core::{Error, PeerAddress};
use gossip_services::{emit, MessageReceiver, NameClaim, OutputSink, PeerLookup, PeerRegistry};

use crate::discovery::{DiscoveryClient, DiscoveryEvent};
use crate::inbound::{InboundListener, RetryPolicy};
use crate::link::PeerLink;

/// A running node.
pub struct NodeHandle {
    pub chat_port: u16,
    pub registry: PeerRegistry,
    pub tasks: Vec<JoinHandle<Result<()>>>,
}

/// Bind the chat listener and start every node task.
///
/// Failing to bind the chat port is fatal.
pub async fn start(
    config: &GossipConfig,
    registry: PeerRegistry,
    receiver: Arc<dyn MessageReceiver>,
    output: OutputSink,
    shutdown: &broadcast::Sender<()>,
) -> Result<NodeHandle> {
    let chat_port = pick_chat_port(&config.node);
    let listener = TcpListener::bind(("0.0.0.0", chat_port))
        .await
        .with_context(|| format!("failed to bind chat listener on port {chat_port}"))?;
    let chat_port = listener.local_addr()?.port();
    tracing::info!(chat_port, "listening for peers");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut tasks = Vec::new();

    let inbound = InboundListener::new(
        listener,
        Arc::new(registry.clone()),
        receiver,
        RetryPolicy::from(&config.identify),
        shutdown.subscribe(),
    );
    tasks.push(tokio::spawn(inbound.run()));

    let discovery = DiscoveryClient::new(
        config.directory.dial_addr(),
        chat_port,
        config.directory.reconnect_interval(),
        events_tx,
        shutdown.subscribe(),
    );
    tasks.push(tokio::spawn(discovery.run()));

    let event_loop = EventLoop::new(
        chat_port,
        registry.clone(),
        output,
        events_rx,
        shutdown.subscribe(),
    );
    tasks.push(tokio::spawn(event_loop.run()));

    Ok(NodeHandle {
        chat_port,
        registry,
        tasks,
    })
}

/// Configured port, or a random one from the configured range.
fn pick_chat_port(config: &NodeConfig) -> u16 {
    if config.chat_port != 0 {
        return config.chat_port;
    }
    if config.port_range_len == 0 {
        return config.port_range_start;
    }
    let offset = rand::thread_rng().gen_range(0..config.port_range_len);
    config.port_range_start.saturating_add(offset)
}

// ── Event loop ───────────────────────────────────────────────────────────────

/// Owns the link table and applies directory events to the registry.
struct EventLoop {
    chat_port: u16,
    registry: PeerRegistry,
    output: OutputSink,
    links: HashMap<PeerAddress, JoinHandle<()>>,
    /// Last name the directory gave each peer. Peers may rename themselves
    /// afterwards, so a directory name is applied only when it changes.
    directory_names: HashMap<PeerAddress, String>,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl EventLoop {
    fn new(
        chat_port: u16,
        registry: PeerRegistry,
        output: OutputSink,
        events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            chat_port,
            registry,
            output,
            links: HashMap::new(),
            directory_names: HashMap::new(),
            events,
            shutdown,
        }
    }

    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("node event loop shutting down");
                    break;
                }

                event = self.events.recv() => {
                    match event {
                        Some(DiscoveryEvent::Welcome(name)) => self.on_welcome(&name),
                        Some(DiscoveryEvent::Peers(peers)) => self.on_peers(&peers),
                        None => break,
                    }
                }
            }
        }

        for (_, link) in self.links.drain() {
            link.abort();
        }
        Ok(())
    }

    fn on_welcome(&self, name: &str) {
        match self.registry.set_local_name(name) {
            Ok(()) => emit(&self.output, format!("You are known as {name}")),
            Err(e) => tracing::warn!(error = %e, "cannot take the name the directory assigned"),
        }
    }

    fn on_peers(&mut self, peers: &BTreeMap<PeerAddress, String>) {
        let mut joined = Vec::new();
        let mut left = Vec::new();
        let summary = self.registry.reconcile(
            peers,
            |peer, queue| joined.push((peer.address.clone(), queue)),
            |peer| left.push((peer.address.clone(), peer.label())),
        );
        if !summary.is_empty() {
            tracing::debug!(
                added = summary.added.len(),
                removed = summary.removed.len(),
                total = self.registry.len(),
                "peer set reconciled"
            );
        }

        for (address, label) in left {
            if let Some(link) = self.links.remove(&address) {
                link.abort();
            }
            self.directory_names.remove(&address);
            emit(&self.output, format!("{label} left the chat"));
        }

        for (address, queue) in joined {
            let link = PeerLink::new(address.clone(), self.chat_port, queue).spawn();
            if let Some(stale) = self.links.insert(address, link) {
                stale.abort();
            }
        }

        self.apply_names(peers);

        for address in &summary.added {
            let label = self
                .registry
                .get(address)
                .map(|peer| peer.label())
                .unwrap_or_else(|| address.to_string());
            emit(&self.output, format!("{label} joined the chat"));
        }
    }

    /// Bind names the directory knows. Entries still carrying the address
    /// placeholder have no name yet.
    fn apply_names(&mut self, peers: &BTreeMap<PeerAddress, String>) {
        for (address, name) in peers {
            if *name == address.to_string() {
                continue;
            }
            if self.directory_names.get(address) == Some(name) {
                continue;
            }
            self.directory_names.insert(address.clone(), name.clone());
            match self.registry.claim_name(address, name) {
                Ok(NameClaim::Accepted { previous }) => {
                    tracing::debug!(peer = %address, previous, name, "directory name applied");
                }
                Ok(_) => {}
                Err(Error::IdentityConflict { name }) => {
                    tracing::warn!(peer = %address, name, "directory name already taken");
                }
                Err(e) => tracing::warn!(error = %e, "failed to apply directory name"),
            }
        }
    }
}
