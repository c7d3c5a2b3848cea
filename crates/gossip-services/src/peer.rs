//! Peer registry: the node's view of who is on the overlay.
//!
//! Entries come and go only through [`PeerRegistry::reconcile`], driven by the
//! directory's peer list. Display names are bound through
//! [`PeerRegistry::claim_name`], which keeps the name → address index
//! injective (the local node's own name included).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use gossip_core::{Error, Message, PeerAddress, Result};

/// Receiving end of a peer's send queue, drained by its outbound link.
pub type OutboundQueue = mpsc::UnboundedReceiver<Message>;

/// A known peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Routable chat address (source host + announced listening port).
    pub address: PeerAddress,
    /// Bound display name. `None` until a NAME claim is accepted.
    pub display_name: Option<String>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Peer {
    /// Create a peer together with the queue its link will drain.
    pub fn new(address: PeerAddress) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            address,
            display_name: None,
            outbound: tx,
        };
        (peer, rx)
    }

    /// Display name, or the address string as a placeholder.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.address.to_string(),
        }
    }

    /// Queue a message for this peer. False if the link is gone.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Read-only capability the network layer needs from a peer collection.
pub trait PeerLookup: Send + Sync {
    /// Peer registered under this address.
    fn get(&self, address: &PeerAddress) -> Option<Peer>;

    /// Peer currently bound to this display name.
    fn find_by_name(&self, name: &str) -> Option<Peer>;
}

/// Who holds a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NameOwner {
    Local,
    Peer(PeerAddress),
}

/// Result of a name claim that did not collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameClaim {
    /// Name bound; carries the label the peer had before.
    Accepted { previous: String },
    /// Same as the current label, nothing to do.
    Unchanged,
    /// Empty, or contains whitespace/control characters.
    Invalid,
    /// No peer at that address.
    UnknownPeer,
}

/// Addresses added and removed by one reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<PeerAddress>,
    pub removed: Vec<PeerAddress>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The peer registry: shared between the event loop, inbound connections
/// and the chat receiver. Cheap to clone.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<PeerAddress, Peer>>,
    names: Arc<DashMap<String, NameOwner>>,
    local_name: Arc<RwLock<String>>,
}

/// Names may not be empty or contain whitespace or control characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.peers.contains_key(address)
    }

    /// Snapshot of all peers, ordered by address.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Make the registry hold exactly the addresses in `announced`.
    ///
    /// Stale addresses get `on_removed` and are then deleted; new ones are
    /// created and passed to `on_added` with their send queue. Addresses in
    /// both are left alone, so repeating a call fires nothing.
    pub fn reconcile<A, R>(
        &self,
        announced: &BTreeMap<PeerAddress, String>,
        mut on_added: A,
        mut on_removed: R,
    ) -> ReconcileSummary
    where
        A: FnMut(&Peer, OutboundQueue),
        R: FnMut(&Peer),
    {
        let mut summary = ReconcileSummary::default();

        let stale: Vec<PeerAddress> = self
            .peers
            .iter()
            .filter(|e| !announced.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for address in stale {
            let Some(peer) = self.get(&address) else {
                continue;
            };
            on_removed(&peer);
            if let Some((_, removed)) = self.peers.remove(&address) {
                if let Some(name) = removed.display_name {
                    self.names
                        .remove_if(&name, |_, owner| *owner == NameOwner::Peer(address.clone()));
                }
            }
            summary.removed.push(address);
        }

        for address in announced.keys() {
            if let Entry::Vacant(slot) = self.peers.entry(address.clone()) {
                let (peer, queue) = Peer::new(address.clone());
                slot.insert(peer.clone());
                on_added(&peer, queue);
                summary.added.push(address.clone());
            }
        }

        summary
    }

    /// Bind `name` to the peer at `address`.
    ///
    /// Collisions with another peer or the local name are returned as
    /// [`Error::IdentityConflict`]; the claim is discarded either way.
    pub fn claim_name(&self, address: &PeerAddress, name: &str) -> Result<NameClaim> {
        if !is_valid_name(name) {
            return Ok(NameClaim::Invalid);
        }
        let Some(peer) = self.get(address) else {
            return Ok(NameClaim::UnknownPeer);
        };
        let previous = peer.label();
        if previous == name {
            return Ok(NameClaim::Unchanged);
        }

        let owner = NameOwner::Peer(address.clone());
        match self.names.entry(name.to_string()) {
            Entry::Occupied(held) if *held.get() != owner => {
                return Err(Error::IdentityConflict {
                    name: name.to_string(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(owner.clone());
            }
        }

        let old_name = match self.peers.get_mut(address) {
            Some(mut entry) => entry.display_name.replace(name.to_string()),
            None => {
                // Removed while we were claiming.
                self.names.remove_if(name, |_, o| *o == owner);
                return Ok(NameClaim::UnknownPeer);
            }
        };
        if let Some(old) = old_name {
            self.names.remove_if(&old, |_, o| *o == owner);
        }

        Ok(NameClaim::Accepted { previous })
    }

    /// Set the local node's display name, reserving it in the name index.
    pub fn set_local_name(&self, name: &str) -> Result<()> {
        match self.names.entry(name.to_string()) {
            Entry::Occupied(held) if *held.get() != NameOwner::Local => {
                return Err(Error::IdentityConflict {
                    name: name.to_string(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(NameOwner::Local);
            }
        }

        let old = {
            let mut local = self.local_name.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *local, name.to_string())
        };
        if !old.is_empty() && old != name {
            self.names.remove_if(&old, |_, o| *o == NameOwner::Local);
        }
        Ok(())
    }

    /// The local node's display name (empty until the directory welcomes us).
    pub fn local_name(&self) -> String {
        self.local_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queue a message for one peer. False if unknown or its link is gone.
    pub fn send_to(&self, address: &PeerAddress, message: Message) -> bool {
        match self.peers.get(address) {
            Some(peer) => {
                let sent = peer.send(message);
                if !sent {
                    tracing::debug!(peer = %address, "no live link, message dropped");
                }
                sent
            }
            None => false,
        }
    }

    /// Queue a message for every known peer. Returns how many accepted it.
    pub fn send_to_all(&self, message: Message) -> usize {
        self.peers()
            .iter()
            .filter(|peer| {
                let sent = peer.send(message.clone());
                if !sent {
                    tracing::debug!(peer = %peer.address, "no live link, message dropped");
                }
                sent
            })
            .count()
    }
}

impl PeerLookup for PeerRegistry {
    fn get(&self, address: &PeerAddress) -> Option<Peer> {
        self.peers.get(address).map(|e| e.value().clone())
    }

    fn find_by_name(&self, name: &str) -> Option<Peer> {
        match self.names.get(name).map(|e| e.value().clone()) {
            Some(NameOwner::Peer(address)) => self.get(&address),
            _ => None,
        }
    }
}
