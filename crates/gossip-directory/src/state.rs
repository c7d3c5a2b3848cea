//! Directory connection table.
//!
//! One record per accepted TCP connection, keyed by the connection's source
//! socket address. Records start anonymous and become identified once the
//! node announces its chat port with HELLO. Every record owns the sending
//! half of its connection's write queue, so broadcasts never touch sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use gossip_core::{Message, PeerAddress};

/// One connected node as the directory sees it.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub source: SocketAddr,
    pub pseudonym: String,
    /// Routable chat address. `None` until HELLO.
    pub chat_address: Option<PeerAddress>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Which records receive a PEERS broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    Identified,
}

/// Outcome of a HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identify {
    Identified(PeerAddress),
    AlreadyIdentified(PeerAddress),
    UnknownConnection,
}

/// Snapshot of a record, taken so broadcasts run without holding map locks.
#[derive(Clone)]
struct Snapshot {
    source: SocketAddr,
    pseudonym: String,
    chat_address: Option<PeerAddress>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// The connection table: shared by every connection task.
#[derive(Clone, Default)]
pub struct DirectoryState {
    connections: Arc<DashMap<SocketAddr, ConnectionRecord>>,
    guests: Arc<AtomicU64>,
}

impl DirectoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Record a new connection under the next guest pseudonym.
    ///
    /// WELCOME is queued before the record becomes visible, so it is always
    /// the first line the node receives.
    pub fn register(&self, source: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> String {
        let n = self.guests.fetch_add(1, Ordering::Relaxed) + 1;
        let pseudonym = format!("Guest#{n}");
        deliver(&outbound, source, Message::welcome(&pseudonym));
        self.connections.insert(
            source,
            ConnectionRecord {
                source,
                pseudonym: pseudonym.clone(),
                chat_address: None,
                outbound,
            },
        );
        pseudonym
    }

    /// Bind the connection's chat address from its source host and `port`.
    pub fn identify(&self, source: SocketAddr, port: u16) -> Identify {
        let Some(mut record) = self.connections.get_mut(&source) else {
            return Identify::UnknownConnection;
        };
        if let Some(existing) = &record.chat_address {
            return Identify::AlreadyIdentified(existing.clone());
        }
        let address = PeerAddress::from_ip(source.ip(), port);
        record.chat_address = Some(address.clone());
        Identify::Identified(address)
    }

    pub fn remove(&self, source: &SocketAddr) -> Option<ConnectionRecord> {
        self.connections.remove(source).map(|(_, record)| record)
    }

    /// Send each record in `audience` the current peer list minus itself.
    pub fn broadcast_peers(&self, audience: Audience) {
        let records = self.snapshot();
        for recipient in &records {
            if audience == Audience::Identified && recipient.chat_address.is_none() {
                continue;
            }
            let mut list: Vec<&PeerAddress> = records
                .iter()
                .filter(|s| s.source != recipient.source)
                .filter_map(|s| s.chat_address.as_ref())
                .collect();
            list.sort();
            deliver(&recipient.outbound, recipient.source, Message::peers(list));
        }
        tracing::debug!(recipients = records.len(), "peer list broadcast");
    }

    /// Exchange `NAME <chat address> <pseudonym>` between the newly
    /// identified connection and every other identified one.
    pub fn introduce(&self, source: &SocketAddr) {
        let records = self.snapshot();
        let Some(newcomer) = records.iter().find(|s| s.source == *source) else {
            return;
        };
        let Some(new_address) = &newcomer.chat_address else {
            return;
        };

        for other in records.iter().filter(|s| s.source != *source) {
            let Some(other_address) = &other.chat_address else {
                continue;
            };
            deliver(
                &newcomer.outbound,
                newcomer.source,
                Message::name_binding(other_address, &other.pseudonym),
            );
            deliver(
                &other.outbound,
                other.source,
                Message::name_binding(new_address, &newcomer.pseudonym),
            );
        }
    }

    fn snapshot(&self) -> Vec<Snapshot> {
        let mut records: Vec<Snapshot> = self
            .connections
            .iter()
            .map(|r| Snapshot {
                source: r.source,
                pseudonym: r.pseudonym.clone(),
                chat_address: r.chat_address.clone(),
                outbound: r.outbound.clone(),
            })
            .collect();
        records.sort_by_key(|s| s.source);
        records
    }
}

/// Queue `message` on a connection's writer. False if the writer is gone.
fn deliver(outbound: &mpsc::UnboundedSender<Message>, node: SocketAddr, message: Message) -> bool {
    let kind = message.kind;
    let sent = outbound.send(message).is_ok();
    if !sent {
        tracing::debug!(%node, %kind, "writer gone, message dropped");
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use gossip_core::MessageKind;

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connect(
        state: &DirectoryState,
        port: u16,
    ) -> (String, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.register(source(port), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn pseudonyms_are_sequential_and_welcome_first() {
        let state = DirectoryState::new();
        let (a, mut rx_a) = connect(&state, 40001);
        let (b, _rx_b) = connect(&state, 40002);
        assert_eq!(a, "Guest#1");
        assert_eq!(b, "Guest#2");
        assert_eq!(rx_a.try_recv().unwrap(), Message::welcome("Guest#1"));
    }

    #[test]
    fn identify_uses_source_host_and_announced_port() {
        let state = DirectoryState::new();
        let _conn = connect(&state, 40001);
        assert_eq!(
            state.identify(source(40001), 9001),
            Identify::Identified(PeerAddress::new("127.0.0.1", 9001))
        );
        assert!(matches!(
            state.identify(source(40001), 9002),
            Identify::AlreadyIdentified(_)
        ));
        assert_eq!(state.identify(source(1), 9003), Identify::UnknownConnection);
    }

    #[test]
    fn peer_lists_exclude_recipient_and_anonymous() {
        let state = DirectoryState::new();
        let (_, mut rx_a) = connect(&state, 40001);
        let (_, mut rx_b) = connect(&state, 40002);
        let (_, mut rx_c) = connect(&state, 40003);
        state.identify(source(40001), 9001);
        state.identify(source(40002), 9002);
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        state.broadcast_peers(Audience::All);
        assert_eq!(drain(&mut rx_a), vec![Message::new(MessageKind::Peers, "127.0.0.1:9002")]);
        assert_eq!(drain(&mut rx_b), vec![Message::new(MessageKind::Peers, "127.0.0.1:9001")]);
        assert_eq!(
            drain(&mut rx_c),
            vec![Message::new(MessageKind::Peers, "127.0.0.1:9001 127.0.0.1:9002")]
        );

        state.broadcast_peers(Audience::Identified);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn introduce_is_pairwise() {
        let state = DirectoryState::new();
        let mut rxs = Vec::new();
        for (i, port) in [40001u16, 40002, 40003].iter().enumerate() {
            let (_, rx) = connect(&state, *port);
            rxs.push(rx);
            state.identify(source(*port), 9001 + i as u16);
            state.introduce(&source(*port));
        }

        let names: Vec<Vec<Message>> = rxs
            .iter_mut()
            .map(|rx| {
                drain(rx)
                    .into_iter()
                    .filter(|m| m.kind == MessageKind::Name)
                    .collect()
            })
            .collect();

        let about = |n: u16, guest: &str| {
            Message::name_binding(&PeerAddress::new("127.0.0.1", 9000 + n), guest)
        };
        assert_eq!(names[0], vec![about(2, "Guest#2"), about(3, "Guest#3")]);
        assert_eq!(names[1], vec![about(1, "Guest#1"), about(3, "Guest#3")]);
        assert_eq!(names[2], vec![about(1, "Guest#1"), about(2, "Guest#2")]);
    }

    #[test]
    fn closed_writer_does_not_stop_introductions() {
        let state = DirectoryState::new();
        let (_, rx_a) = connect(&state, 40001);
        let (_, mut rx_b) = connect(&state, 40002);
        let (_, mut rx_c) = connect(&state, 40003);
        state.identify(source(40001), 9001);
        state.identify(source(40002), 9002);
        drop(rx_a);
        drain(&mut rx_b);

        state.identify(source(40003), 9003);
        state.introduce(&source(40003));

        let c_names: Vec<Message> = drain(&mut rx_c)
            .into_iter()
            .filter(|m| m.kind == MessageKind::Name)
            .collect();
        assert_eq!(c_names.len(), 2);
        assert_eq!(
            drain(&mut rx_b),
            vec![Message::name_binding(&PeerAddress::new("127.0.0.1", 9003), "Guest#3")]
        );
        state.broadcast_peers(Audience::All);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn deliver_reports_closed_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(deliver(&tx, source(40001), Message::welcome("Guest#1")));
        drop(rx);
        assert!(!deliver(&tx, source(40001), Message::welcome("Guest#1")));
    }

    #[test]
    fn remove_drops_record() {
        let state = DirectoryState::new();
        let _conn = connect(&state, 40001);
        assert!(state.remove(&source(40001)).is_some());
        assert!(state.is_empty());
        assert!(state.remove(&source(40001)).is_none());
    }
}
