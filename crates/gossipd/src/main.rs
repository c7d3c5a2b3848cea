//! gossipd: chat node.
//!
//! Usage: `gossipd [directory-host]`

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use gossip_core::config::GossipConfig;
use gossip_services::{ChatReceiver, CommandProcessor, PeerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = GossipConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = GossipConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GossipConfig::default()
    });
    if let Some(host) = std::env::args().nth(1) {
        config.directory.host = host;
    }

    println!("== GOssip ==");
    tracing::info!(directory = %config.directory.dial_addr(), "gossipd starting");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let registry = PeerRegistry::new();
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
    let receiver = Arc::new(ChatReceiver::new(registry.clone(), output_tx.clone()));
    let commands = CommandProcessor::new(registry.clone(), output_tx.clone());

    let node = gossipd::start(&config, registry, receiver, output_tx, &shutdown_tx).await?;
    println!("Listening on port {}", node.chat_port);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            line = stdin.next_line() => match line {
                Ok(Some(line)) => commands.process(&line),
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    break;
                }
            },

            Some(line) = output_rx.recv() => println!("{line}"),
        }
    }

    let _ = shutdown_tx.send(());
    for task in node.tasks {
        match task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "task exited with error"),
            Err(e) => tracing::warn!(error = %e, "task panicked"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}
