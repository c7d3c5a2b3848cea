use std::collections::BTreeSet;
use std::time::Duration;

use crate::*;
use gossip_core::PeerAddress;

fn local(port: u16) -> PeerAddress {
    PeerAddress::new("127.0.0.1", port)
}

/// Connect, read the WELCOME, announce `port` and wait for our own PEERS.
async fn join(addr: SocketAddr, port: u16) -> Result<(RawClient, String)> {
    let mut client = RawClient::connect(addr).await?;
    let welcome = client.recv().await??;
    assert_eq!(welcome.kind, MessageKind::Welcome);
    client.send(&Message::hello(port)).await?;
    client.recv_kind(MessageKind::Peers).await?;
    Ok((client, welcome.payload))
}

#[tokio::test]
async fn test_welcome_assigns_sequential_guest_names() -> Result<()> {
    let (addr, _shutdown) = start_directory().await?;

    let mut first = RawClient::connect(addr).await?;
    assert_eq!(first.recv().await??, Message::welcome("Guest#1"));
    let mut second = RawClient::connect(addr).await?;
    assert_eq!(second.recv().await??, Message::welcome("Guest#2"));
    Ok(())
}

#[tokio::test]
async fn test_hello_introduces_every_pair() -> Result<()> {
    let (addr, _shutdown) = start_directory().await?;

    let (mut a, name_a) = join(addr, 9001).await?;
    let (mut b, name_b) = join(addr, 9002).await?;
    assert_eq!((name_a.as_str(), name_b.as_str()), ("Guest#1", "Guest#2"));

    // C joins last and hears about everyone already identified.
    let mut c = RawClient::connect(addr).await?;
    assert_eq!(c.recv().await??, Message::welcome("Guest#3"));
    c.send(&Message::hello(9003)).await?;

    let peers: BTreeSet<_> = c.recv_kind(MessageKind::Peers).await?.parse_peer_list().into_iter().collect();
    assert_eq!(peers, BTreeSet::from([local(9001), local(9002)]));

    let mut names = BTreeSet::new();
    for _ in 0..2 {
        names.insert(c.recv_kind(MessageKind::Name).await?.parse_name_binding()?);
    }
    assert_eq!(
        names,
        BTreeSet::from([
            (local(9001), "Guest#1".to_string()),
            (local(9002), "Guest#2".to_string()),
        ])
    );

    // A was told about B when B joined, then about C.
    assert_eq!(
        a.recv_kind(MessageKind::Name).await?.parse_name_binding()?,
        (local(9002), "Guest#2".to_string())
    );
    let peers = a.recv_kind(MessageKind::Peers).await?.parse_peer_list();
    assert_eq!(peers, vec![local(9002), local(9003)]);
    assert_eq!(
        a.recv_kind(MessageKind::Name).await?.parse_name_binding()?,
        (local(9003), "Guest#3".to_string())
    );

    // B learns C's name too.
    assert_eq!(
        b.recv_kind(MessageKind::Name).await?.parse_name_binding()?,
        (local(9001), "Guest#1".to_string())
    );
    assert_eq!(
        b.recv_kind(MessageKind::Name).await?.parse_name_binding()?,
        (local(9003), "Guest#3".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_disconnect_rebroadcasts_to_identified_only() -> Result<()> {
    let (addr, _shutdown) = start_directory().await?;

    let (mut a, _) = join(addr, 9011).await?;
    let (b, _) = join(addr, 9012).await?;
    a.recv_kind(MessageKind::Name).await?;

    // Welcomed but never said HELLO.
    let mut lurker = RawClient::connect(addr).await?;
    assert_eq!(lurker.recv().await??.kind, MessageKind::Welcome);

    drop(b);
    let peers = a.recv_kind(MessageKind::Peers).await?;
    assert!(peers.parse_peer_list().is_empty());

    let quiet = tokio::time::timeout(Duration::from_millis(300), lurker.recv()).await;
    assert!(quiet.is_err(), "unidentified connection should not get PEERS on removal");
    Ok(())
}

#[tokio::test]
async fn test_malformed_hello_drops_connection() -> Result<()> {
    let (addr, _shutdown) = start_directory().await?;

    let mut client = RawClient::connect(addr).await?;
    assert_eq!(client.recv().await??.kind, MessageKind::Welcome);
    client.send(&Message::new(MessageKind::Hello, "abc")).await?;

    match client.recv().await? {
        Err(WireError::ConnectionClosed) | Err(WireError::Io(_)) => {}
        other => panic!("expected the directory to hang up, got {other:?}"),
    }
    Ok(())
}
