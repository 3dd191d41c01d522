mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wiresync::{ByteLink, EventBus, Peer, SyncEvent};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let link = ByteLink::open_device(&cli.device)
        .await
        .with_context(|| format!("failed to open {}", cli.device.display()))?;

    let events = EventBus::new();
    let mut event_rx = events.channel();

    let peer = Peer::new(link, events);
    peer.set_sync_folder(Some(cli.folder.clone()));
    peer.set_strict_mode(cli.strict);
    peer.set_respect_gitignore(cli.respect_gitignore);
    peer.set_quick_mode(cli.quick);
    peer.set_manifest_cache(cli.manifest_cache.clone());

    peer.start();

    tracing::info!(device = %cli.device.display(), "waiting for peer");
    if !peer
        .wait_for_connection(Duration::from_secs(cli.connect_timeout))
        .await
    {
        peer.stop().await;
        anyhow::bail!("no peer responded within {}s", cli.connect_timeout);
    }

    if cli.send {
        // Let role negotiation settle before overriding the direction.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !peer.state().is_sender() {
            peer.set_sender(true);
            peer.notify_direction_change().await;
        }
        peer.start_sync();

        while let Some(event) = event_rx.recv().await {
            if event == SyncEvent::SyncComplete {
                break;
            }
        }
        peer.stop().await;
        return Ok(());
    }

    // Receiver mode: serve until interrupted.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
        _ = async {
            while event_rx.recv().await.is_some() {}
        } => {}
    }
    peer.stop().await;
    Ok(())
}
