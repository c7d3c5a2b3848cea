use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::*;
use gossip_core::config::GossipConfig;
use gossip_services::{ChatReceiver, CommandProcessor, MessageReceiver, Peer, PeerRegistry};
use gossipd::NodeHandle;

/// Chat receiver that also counts identifications.
struct Recording {
    inner: ChatReceiver,
    hellos: AtomicUsize,
}

impl MessageReceiver for Recording {
    fn receive(&self, message: Message, from: &Peer) {
        self.inner.receive(message, from);
    }

    fn handle_hello(&self, payload: &str, from: &Peer) {
        self.hellos.fetch_add(1, Ordering::SeqCst);
        self.inner.handle_hello(payload, from);
    }
}

struct TestNode {
    handle: NodeHandle,
    receiver: Arc<Recording>,
    commands: CommandProcessor,
    lines: Arc<Mutex<Vec<String>>>,
    shutdown: broadcast::Sender<()>,
}

impl TestNode {
    async fn start(directory: SocketAddr) -> Result<Self> {
        let mut config = GossipConfig::default();
        config.directory.host = directory.ip().to_string();
        config.directory.port = directory.port();
        config.directory.reconnect_interval_ms = 50;
        config.node.chat_port = free_port().await?;
        config.identify.retry_backoff_ms = 50;

        let registry = PeerRegistry::new();
        let (output, mut output_rx) = mpsc::unbounded_channel::<String>();
        let receiver = Arc::new(Recording {
            inner: ChatReceiver::new(registry.clone(), output.clone()),
            hellos: AtomicUsize::new(0),
        });
        let commands = CommandProcessor::new(registry.clone(), output.clone());

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        tokio::spawn(async move {
            while let Some(line) = output_rx.recv().await {
                sink.lock().unwrap().push(line);
            }
        });

        let (shutdown, _) = broadcast::channel(1);
        let handle = gossipd::start(&config, registry, receiver.clone(), output, &shutdown).await?;
        Ok(Self {
            handle,
            receiver,
            commands,
            lines,
            shutdown,
        })
    }

    fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    fn saw(&self, line: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l == line)
    }

    fn knows(&self, label: &str) -> bool {
        self.handle.registry.peers().iter().any(|p| p.label() == label)
    }
}

/// Two nodes meet through the directory: X first, then Y.
async fn pair() -> Result<(TestNode, TestNode, broadcast::Sender<()>)> {
    let (directory, shutdown) = start_directory().await?;

    let x = TestNode::start(directory).await?;
    assert!(wait_until(|| x.handle.registry.local_name() == "Guest#1").await);

    let y = TestNode::start(directory).await?;
    assert!(wait_until(|| y.handle.registry.local_name() == "Guest#2").await);

    assert!(wait_until(|| x.knows("Guest#2") && y.knows("Guest#1")).await);
    Ok((x, y, shutdown))
}

#[tokio::test]
async fn test_nodes_learn_names_and_identify_links() -> Result<()> {
    let (x, y, directory) = pair().await?;

    assert!(wait_until(|| x.saw("You are known as Guest#1")).await);
    assert!(wait_until(|| y.saw("You are known as Guest#2")).await);

    // Each side's link says HELLO to the other; each binding fires once.
    assert!(wait_until(|| x.receiver.hellos.load(Ordering::SeqCst) == 1).await);
    assert!(wait_until(|| y.receiver.hellos.load(Ordering::SeqCst) == 1).await);

    x.stop();
    y.stop();
    let _ = directory.send(());
    Ok(())
}

#[tokio::test]
async fn test_broadcast_and_private_messages() -> Result<()> {
    let (x, y, directory) = pair().await?;

    x.commands.process("hello everyone");
    assert!(wait_until(|| x.saw("[Guest#1] hello everyone")).await);
    assert!(wait_until(|| y.saw("[Guest#1] hello everyone")).await);

    y.commands.process("/msg Guest#1 psst");
    assert!(wait_until(|| y.saw("[Guest#2 -> Guest#1] psst")).await);
    assert!(wait_until(|| x.saw("[Guest#2 -> you] psst")).await);

    x.commands.process("/msg nobody hi");
    assert!(wait_until(|| x.saw("No peer named nobody")).await);

    x.stop();
    y.stop();
    let _ = directory.send(());
    Ok(())
}

#[tokio::test]
async fn test_rename_propagates_to_peers() -> Result<()> {
    let (x, y, directory) = pair().await?;

    x.commands.process("/name alice");
    assert!(wait_until(|| x.saw("You are now known as alice")).await);
    assert!(wait_until(|| y.saw("Guest#1 is now known as alice")).await);
    assert!(y.knows("alice"));

    // Y already knows X as alice, so Y refuses the name locally.
    y.commands.process("/name alice");
    assert!(wait_until(|| y.saw("alice is already taken")).await);
    assert_eq!(y.handle.registry.local_name(), "Guest#2");

    x.stop();
    y.stop();
    let _ = directory.send(());
    Ok(())
}

#[tokio::test]
async fn test_peer_leaving_is_reconciled() -> Result<()> {
    let (x, y, directory) = pair().await?;

    // Y's directory session ends; the directory tells X.
    y.stop();

    assert!(wait_until(|| x.handle.registry.is_empty()).await);
    assert!(wait_until(|| x.saw("Guest#2 left the chat")).await);

    x.stop();
    let _ = directory.send(());
    Ok(())
}
