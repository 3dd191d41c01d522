//! Sender-driven sync session.
//!
//! One round of reconciliation: exchange manifests, compute the change set,
//! stream each changed file through the block plane, then the directory
//! creates and deletes, and finish with `SYNC_COMPLETE`. The session claims
//! the wire for its whole duration, so it reads control replies directly
//! while the reader loop and heartbeat supervisor stand down.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::event::SyncEvent;
use crate::manifest::{compute_changes, generate_manifest, ChangeSet, ScanOptions};
use crate::peer::{manifest_summary, Peer};
use crate::protocol::Command;

/// Entry point spawned by [`Peer::start_sync`]. `syncing` is already set.
pub(crate) async fn run(peer: Arc<Peer>) {
    if let Err(e) = perform(&peer).await {
        peer.events.error(format!("Sync failed: {e}"));
    }
    peer.state.syncing.store(false, Ordering::SeqCst);
    peer.state.touch_received();
    peer.flush_shared_text().await;
}

async fn perform(peer: &Peer) -> Result<()> {
    peer.events.post(SyncEvent::SyncStarted);

    let folder = peer
        .sync_folder()
        .filter(|f| f.is_dir())
        .ok_or_else(|| SyncError::Config("sync folder not configured".into()))?;
    let respect_gitignore = peer.respect_gitignore();
    let quick_mode = peer.quick_mode();
    let strict = peer.strict_mode();

    // The local scan overlaps the remote round-trip.
    peer.events.log("Generating local manifest...");
    let scan_root = folder.clone();
    let options = ScanOptions {
        respect_gitignore,
        quick_mode,
        cache_path: peer.manifest_cache(),
        persist: peer.manifest_cache().is_some(),
        ..Default::default()
    };
    let local_scan = tokio::task::spawn_blocking(move || generate_manifest(&scan_root, &options));

    let _claim = peer.state.claim_wire();

    peer.events.log("Requesting remote manifest...");
    peer.wire
        .send(
            Command::ManifestReq,
            &[&respect_gitignore.to_string(), &quick_mode.to_string()],
        )
        .await?;

    let announce = peer.wire.wait_for(Command::ManifestData).await?;
    let compressed_size = announce
        .param_usize(0)
        .ok_or_else(|| SyncError::Protocol("MANIFEST_DATA without byte count".into()))?;
    peer.wire.send(Command::Ack, &[]).await?;
    let remote_manifest = peer.wire.receive_manifest(compressed_size).await?;

    let local_manifest = local_scan
        .await
        .map_err(|e| SyncError::Protocol(format!("manifest scan task failed: {e}")))??;

    peer.events
        .log(manifest_summary("Remote manifest received", &remote_manifest));

    let changes = compute_changes(&local_manifest, &remote_manifest, strict);
    if changes.is_empty() {
        peer.events.log("No files need to be synced or deleted");
        peer.events.post(SyncEvent::SyncComplete);
        return Ok(());
    }

    log_summary(peer, &changes, strict);
    let total = changes.total_operations();
    let mut op = 0usize;

    for record in &changes.to_send {
        op += 1;
        let compressed = peer.wire.send_file(&folder, &record.path).await?;
        let mut message = format!("Syncing [{op}/{total}]: {}", record.path);
        if compressed {
            message.push_str(" (compressed)");
        }
        peer.events.log(message);
        peer.events.post(SyncEvent::FileProgress {
            current: op,
            total,
            name: record.path.clone(),
        });
    }

    for dir in &changes.empty_dirs_to_create {
        op += 1;
        peer.events
            .log(format!("Creating dir [{op}/{total}]: {dir}"));
        peer.events.post(SyncEvent::FileProgress {
            current: op,
            total,
            name: format!("[DIR] {dir}"),
        });
        peer.wire.send(Command::Mkdir, &[dir]).await?;
    }

    for path in &changes.to_delete {
        op += 1;
        peer.events.log(format!("Deleting [{op}/{total}]: {path}"));
        peer.events.post(SyncEvent::FileProgress {
            current: op,
            total,
            name: format!("[DEL] {path}"),
        });
        peer.wire.send(Command::FileDelete, &[path]).await?;
    }

    for dir in &changes.empty_dirs_to_delete {
        op += 1;
        peer.events
            .log(format!("Deleting dir [{op}/{total}]: {dir}"));
        peer.events.post(SyncEvent::FileProgress {
            current: op,
            total,
            name: format!("[RMDIR] {dir}"),
        });
        peer.wire.send(Command::Rmdir, &[dir]).await?;
    }

    peer.wire.send(Command::SyncComplete, &[]).await?;

    peer.events.log("Sync completed successfully");
    peer.events.post(SyncEvent::TransferComplete);
    peer.events.post(SyncEvent::SyncComplete);
    Ok(())
}

fn log_summary(peer: &Peer, changes: &ChangeSet, strict: bool) {
    let mut summary = format!("Files to sync: {}", changes.to_send.len());
    if !changes.empty_dirs_to_create.is_empty() {
        summary.push_str(&format!(
            ", Empty dirs to create: {}",
            changes.empty_dirs_to_create.len()
        ));
    }
    if strict {
        summary.push_str(&format!(", Files to delete: {}", changes.to_delete.len()));
        if !changes.empty_dirs_to_delete.is_empty() {
            summary.push_str(&format!(
                ", Empty dirs to delete: {}",
                changes.empty_dirs_to_delete.len()
            ));
        }
    }
    peer.events.log(summary);
}
