//! gossip-directory: peers directory server.
//!
//! Usage: `gossip-directory [port]`

use anyhow::Result;

use gossip_core::config::GossipConfig;
use gossip_directory::DirectoryServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GossipConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GossipConfig::default()
    });

    let port = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<u16>()
            .map_err(|_| anyhow::anyhow!("invalid port argument {arg:?}"))?,
        None => config.directory.listen_port,
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let server = DirectoryServer::bind(("0.0.0.0", port), shutdown_tx.subscribe()).await?;
    server.run().await
}
