//! Per-connection identification state.
//!
//! An inbound connection announces its listening port with HELLO. Together
//! with the source host that gives a candidate chat address, which must match
//! a registry entry before anything the connection sends is delivered. The
//! registry may lag the directory by a little, so lookups are retried a
//! bounded number of times with a fixed backoff. Once that window has run
//! out, later messages get a single lookup each until the peer shows up or
//! a new HELLO arrives.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use gossip_core::config::IdentifyConfig;
use gossip_core::{Error, Message, MessageKind, PeerAddress};
use gossip_services::{MessageReceiver, Peer, PeerLookup};

/// Bounded retry for registry lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Lookups after the first miss.
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

impl From<&IdentifyConfig> for RetryPolicy {
    fn from(config: &IdentifyConfig) -> Self {
        Self::new(config.retry_attempts, config.retry_backoff())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&IdentifyConfig::default())
    }
}

/// Candidate address announced by HELLO, plus the raw payload.
#[derive(Debug, Clone)]
struct Candidate {
    address: PeerAddress,
    payload: String,
}

/// Identification and delivery for one inbound connection.
///
/// Owned by the connection's dispatch task, so messages are handled strictly
/// in arrival order.
pub struct InboundConnection {
    source: IpAddr,
    lookup: Arc<dyn PeerLookup>,
    receiver: Arc<dyn MessageReceiver>,
    policy: RetryPolicy,
    candidate: Option<Candidate>,
    bound: Option<PeerAddress>,
    /// Set when the last lookup used up the whole retry window.
    exhausted: bool,
    closed: watch::Receiver<bool>,
}

impl InboundConnection {
    pub fn new(
        source: IpAddr,
        lookup: Arc<dyn PeerLookup>,
        receiver: Arc<dyn MessageReceiver>,
        policy: RetryPolicy,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            lookup,
            receiver,
            policy,
            candidate: None,
            bound: None,
            exhausted: false,
            closed,
        }
    }

    /// Registry address this connection is bound to, if any.
    pub fn bound(&self) -> Option<&PeerAddress> {
        self.bound.as_ref()
    }

    /// Handle one message. An error means the connection must be dropped.
    pub async fn dispatch(&mut self, message: Message) -> Result<(), Error> {
        match message.kind {
            MessageKind::Hello => self.on_hello(message).await,
            _ => {
                self.on_message(message).await;
                Ok(())
            }
        }
    }

    async fn on_hello(&mut self, message: Message) -> Result<(), Error> {
        let port = message.hello_port()?;
        let address = PeerAddress::from_ip(self.source, port);

        if self.bound.as_ref() == Some(&address) {
            tracing::debug!(peer = %address, "repeated HELLO on bound connection");
            return Ok(());
        }

        self.bound = None;
        self.exhausted = false;
        self.candidate = Some(Candidate {
            address: address.clone(),
            payload: message.payload,
        });

        match self.find(&address).await {
            Some(peer) => self.bind(&peer),
            None => {
                let e = Error::UnresolvedPeer { address };
                tracing::warn!(error = %e, "dropping HELLO");
            }
        }
        Ok(())
    }

    async fn on_message(&mut self, message: Message) {
        let peer = if let Some(address) = self.bound.clone() {
            self.find(&address).await
        } else if let Some(candidate) = self.candidate.clone() {
            let peer = self.find(&candidate.address).await;
            if let Some(peer) = &peer {
                self.bind(peer);
            }
            peer
        } else {
            tracing::warn!(source = %self.source, %message, "message before HELLO, dropping");
            return;
        };

        match peer {
            Some(peer) => self.receiver.receive(message, &peer),
            None => {
                let address = self
                    .bound
                    .clone()
                    .or_else(|| self.candidate.as_ref().map(|c| c.address.clone()));
                if let Some(address) = address {
                    let e = Error::UnresolvedPeer { address };
                    tracing::warn!(error = %e, %message, "dropping message");
                }
            }
        }
    }

    fn bind(&mut self, peer: &Peer) {
        self.bound = Some(peer.address.clone());
        let payload = self
            .candidate
            .as_ref()
            .map(|c| c.payload.clone())
            .unwrap_or_default();
        tracing::info!(peer = %peer.address, name = %peer, "inbound connection identified");
        self.receiver.handle_hello(&payload, peer);
    }

    /// Full retry window on the first miss, one lookup per call after that.
    async fn find(&mut self, address: &PeerAddress) -> Option<Peer> {
        let peer = if self.exhausted {
            self.lookup.get(address)
        } else {
            self.resolve(address).await
        };
        self.exhausted = peer.is_none();
        peer
    }

    /// Look `address` up, retrying per the policy. Gives up early once the
    /// connection is closed.
    async fn resolve(&mut self, address: &PeerAddress) -> Option<Peer> {
        if let Some(peer) = self.lookup.get(address) {
            return Some(peer);
        }

        for attempt in 1..=self.policy.attempts {
            if *self.closed.borrow() {
                return None;
            }
            tracing::debug!(peer = %address, attempt, "peer not in registry yet, retrying");

            tokio::select! {
                _ = tokio::time::sleep(self.policy.backoff) => {}
                _ = self.closed.wait_for(|closed| *closed) => {
                    tracing::debug!(peer = %address, "connection closed, abandoning lookup");
                    return None;
                }
            }

            if let Some(peer) = self.lookup.get(address) {
                return Some(peer);
            }
        }
        None
    }
}
