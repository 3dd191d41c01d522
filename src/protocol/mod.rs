//! Line-framed control protocol.
//!
//! Control messages are UTF-8 lines of the form `[[SYNC:CMD[:PARAM]*]]` and
//! multiplex with framed block transfers over the same byte link: a peer
//! announces a payload with a control line, waits for `ACK`, and only then
//! commits the wire to the block plane.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tokio::time::Instant;

use crate::compress;
use crate::error::{Result, SyncError};
use crate::event::EventBus;
use crate::fbt::{self, BlockTransfer};
use crate::link::ByteLink;
use crate::manifest::Manifest;

const START_MARKER: &str = "[[SYNC:";
const END_MARKER: &str = "]]";
const SEPARATOR: char = ':';

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SEND_RETRY_PAUSE: Duration = Duration::from_millis(200);
const FILE_SEND_ATTEMPTS: u32 = 3;

/// Enumerated control commands. The wire names are parse/serialise targets
/// only; dispatch happens on this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ManifestReq,
    ManifestData,
    FileReq,
    FileData,
    FileDelete,
    Mkdir,
    Rmdir,
    SyncComplete,
    DirectionChange,
    RoleNegotiate,
    Ack,
    Error,
    Heartbeat,
    HeartbeatAck,
    SharedText,
}

impl Command {
    pub fn wire_name(self) -> &'static str {
        match self {
            Command::ManifestReq => "MANIFEST_REQ",
            Command::ManifestData => "MANIFEST_DATA",
            Command::FileReq => "FILE_REQ",
            Command::FileData => "FILE_DATA",
            Command::FileDelete => "FILE_DELETE",
            Command::Mkdir => "MKDIR",
            Command::Rmdir => "RMDIR",
            Command::SyncComplete => "SYNC_COMPLETE",
            Command::DirectionChange => "DIRECTION_CHANGE",
            Command::RoleNegotiate => "ROLE_NEGOTIATE",
            Command::Ack => "ACK",
            Command::Error => "ERROR",
            Command::Heartbeat => "HEARTBEAT",
            Command::HeartbeatAck => "HEARTBEAT_ACK",
            Command::SharedText => "SHARED_TEXT",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "MANIFEST_REQ" => Command::ManifestReq,
            "MANIFEST_DATA" => Command::ManifestData,
            "FILE_REQ" => Command::FileReq,
            "FILE_DATA" => Command::FileData,
            "FILE_DELETE" => Command::FileDelete,
            "MKDIR" => Command::Mkdir,
            "RMDIR" => Command::Rmdir,
            "SYNC_COMPLETE" => Command::SyncComplete,
            "DIRECTION_CHANGE" => Command::DirectionChange,
            "ROLE_NEGOTIATE" => Command::RoleNegotiate,
            "ACK" => Command::Ack,
            "ERROR" => Command::Error,
            "HEARTBEAT" => Command::Heartbeat,
            "HEARTBEAT_ACK" => Command::HeartbeatAck,
            "SHARED_TEXT" => Command::SharedText,
            _ => return None,
        })
    }
}

/// One parsed control line.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub command: Command,
    pub params: Vec<String>,
}

impl ControlMessage {
    pub fn new(command: Command, params: Vec<String>) -> Self {
        Self { command, params }
    }

    /// Parse a raw line. Malformed brackets or an unknown command yield
    /// `None`; the caller decides whether to log.
    pub fn parse(line: &str) -> Option<Self> {
        let content = line
            .strip_prefix(START_MARKER)
            .and_then(|rest| rest.strip_suffix(END_MARKER))?;
        let mut parts = content.split(SEPARATOR);
        let command = Command::from_wire(parts.next()?)?;
        Some(Self {
            command,
            params: parts.map(str::to_owned).collect(),
        })
    }

    /// Serialise without the trailing newline.
    pub fn encode(&self) -> String {
        let mut line = String::from(START_MARKER);
        line.push_str(self.command.wire_name());
        for param in &self.params {
            line.push(SEPARATOR);
            line.push_str(param);
        }
        line.push_str(END_MARKER);
        line
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn param_usize(&self, index: usize) -> Option<usize> {
        self.param(index)?.parse().ok()
    }

    pub fn param_i64(&self, index: usize) -> Option<i64> {
        self.param(index)?.parse().ok()
    }

    pub fn param_bool(&self, index: usize) -> Option<bool> {
        match self.param(index)? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

/// Resolve a wire-supplied relative path under `base`, rejecting anything
/// that could escape the sync root.
pub fn resolve_rel_path(base: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SyncError::Protocol("empty relative path".into()));
    }
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(SyncError::Protocol(format!(
            "absolute path not allowed: {relative}"
        )));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(SyncError::Protocol(format!(
                    "path traversal not allowed: {relative}"
                )))
            }
            Component::Prefix(_) => {
                return Err(SyncError::Protocol(format!(
                    "prefixed path not allowed: {relative}"
                )))
            }
            _ => {}
        }
    }
    Ok(base.join(rel))
}

/// Control-plane operations over one byte link.
///
/// `Wire` is deliberately stateless about who owns the wire; the peer
/// controller sequences callers so that only one of them reads at a time.
pub struct Wire {
    link: ByteLink,
    events: Arc<EventBus>,
    timeout: Duration,
    on_activity: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Wire {
    pub fn new(link: ByteLink, events: Arc<EventBus>) -> Self {
        Self {
            link,
            events,
            timeout: DEFAULT_TIMEOUT,
            on_activity: None,
        }
    }

    /// Invoke `hook` for every well-formed inbound message. The peer
    /// controller uses this to refresh its liveness timestamp.
    pub fn with_activity_hook(mut self, hook: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.on_activity = Some(hook);
        self
    }

    pub fn link(&self) -> &ByteLink {
        &self.link
    }

    fn block_transfer(&self) -> BlockTransfer {
        BlockTransfer::new(self.link.clone(), self.events.clone())
    }

    pub async fn send(&self, command: Command, params: &[&str]) -> Result<()> {
        let msg = ControlMessage::new(command, params.iter().map(|p| p.to_string()).collect());
        let line = msg.encode();
        tracing::debug!(%line, "sending control line");
        self.link.write_line(&line).await
    }

    /// Read one control line. `Ok(None)` means a malformed line was dropped.
    pub async fn recv(&self, timeout: Duration) -> Result<Option<ControlMessage>> {
        let line = self.link.read_line(timeout).await?;
        match ControlMessage::parse(&line) {
            Some(msg) => {
                tracing::debug!(command = msg.command.wire_name(), "received control line");
                if let Some(hook) = &self.on_activity {
                    hook();
                }
                Ok(Some(msg))
            }
            None => {
                tracing::warn!(%line, "dropping malformed control line");
                Ok(None)
            }
        }
    }

    /// Read control lines until `expected` arrives, discarding others.
    pub async fn wait_for(&self, expected: Command) -> Result<ControlMessage> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::Protocol(format!(
                    "timed out waiting for {}",
                    expected.wire_name()
                )));
            }
            match self.recv(remaining).await {
                Ok(Some(msg)) if msg.command == expected => return Ok(msg),
                Ok(Some(msg)) => {
                    tracing::debug!(
                        got = msg.command.wire_name(),
                        want = expected.wire_name(),
                        "skipping interleaved control line"
                    );
                }
                Ok(None) => {}
                Err(SyncError::Timeout(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    // ── Manifest exchange ────────────────────────────────────────

    /// Announce and push a manifest: `MANIFEST_DATA <size>`, `ACK`, FBT.
    pub async fn send_manifest(&self, manifest: &Manifest) -> Result<()> {
        let json = manifest.to_json()?;
        let compressed = compress::gzip(json.as_bytes())?;

        self.send(Command::ManifestData, &[&compressed.len().to_string()])
            .await?;
        self.wait_for(Command::Ack).await?;
        self.block_transfer().send(&compressed).await
    }

    /// Receive the manifest payload already announced by `MANIFEST_DATA`.
    pub async fn receive_manifest(&self, compressed_size: usize) -> Result<Manifest> {
        let raw = self.block_transfer().receive().await?;
        let compressed = fbt::restore_padding(raw, compressed_size);
        let json = compress::gunzip(&compressed)?;
        Manifest::from_json(&String::from_utf8(json)?)
    }

    // ── File exchange ────────────────────────────────────────────

    /// Send one file under `base`. Returns whether the payload went out
    /// compressed. The whole announce/ACK/FBT sequence is retried a few
    /// times so a transient handshake failure does not abort the session.
    pub async fn send_file(&self, base: &Path, relative: &str) -> Result<bool> {
        let path = resolve_rel_path(base, relative)?;
        if !path.is_file() {
            self.send(Command::Error, &[&format!("File not found: {relative}")])
                .await?;
            return Ok(false);
        }

        let data = tokio::fs::read(&path).await?;
        let modified = file_mtime_millis(&path).await?;
        let (payload, was_compressed) = compress::compress_if_beneficial(relative, &data);
        let payload = Bytes::from(payload);

        let mut last_error = None;
        for attempt in 1..=FILE_SEND_ATTEMPTS {
            self.send(
                Command::FileData,
                &[
                    relative,
                    &payload.len().to_string(),
                    &was_compressed.to_string(),
                    &modified.to_string(),
                ],
            )
            .await?;
            self.wait_for(Command::Ack).await?;

            match self.block_transfer().send(&payload).await {
                Ok(()) => return Ok(was_compressed),
                Err(e @ (SyncError::Transfer(_) | SyncError::Handshake(_))) => {
                    tracing::warn!(%relative, attempt, error = %e, "file transfer attempt failed");
                    last_error = Some(e);
                    self.link.clear_input();
                    if attempt < FILE_SEND_ATTEMPTS {
                        tokio::time::sleep(SEND_RETRY_PAUSE).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::Transfer(format!(
            "failed to send {relative} after {FILE_SEND_ATTEMPTS} attempts ({})",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Receive a file payload announced by `FILE_DATA` and install it under
    /// `base`, restoring the sender's modification time.
    pub async fn receive_file(
        &self,
        base: &Path,
        relative: &str,
        byte_count: usize,
        compressed: bool,
        modified_millis: i64,
    ) -> Result<()> {
        let target = resolve_rel_path(base, relative)?;

        let raw = self.block_transfer().receive().await.map_err(|e| {
            self.link.clear_input();
            SyncError::Transfer(format!("failed to receive file data for {relative} ({e})"))
        })?;
        let mut data = fbt::restore_padding(raw, byte_count);
        if compressed && compress::is_gzip(&data) {
            data = compress::gunzip(&data)?;
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Stage next to the target so the rename is atomic on one filesystem.
        let staged = staging_path(&target);
        let install = async {
            tokio::fs::write(&staged, &data).await?;
            tokio::fs::rename(&staged, &target).await
        };
        if let Err(e) = install.await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(SyncError::Io(e));
        }

        if modified_millis > 0 {
            let mtime = filetime::FileTime::from_unix_time(
                modified_millis / 1000,
                ((modified_millis % 1000) * 1_000_000) as u32,
            );
            let target = target.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_mtime(&target, mtime))
                .await
                .map_err(|e| SyncError::Protocol(format!("mtime task failed: {e}")))??;
        }
        Ok(())
    }

    // ── Shared text ──────────────────────────────────────────────

    /// Base64 protects the `:`/`]]` delimiters in user text.
    pub async fn send_shared_text(&self, text: &str) -> Result<()> {
        let encoded = BASE64.encode(text.as_bytes());
        self.send(Command::SharedText, &[&encoded]).await
    }

    pub fn decode_shared_text(payload: &str) -> Result<String> {
        let data = BASE64
            .decode(payload)
            .map_err(|e| SyncError::Protocol(format!("invalid shared-text payload: {e}")))?;
        Ok(String::from_utf8(data)?)
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".wsync-part");
    target.with_file_name(name)
}

async fn file_mtime_millis(path: &Path) -> Result<i64> {
    let meta = tokio::fs::metadata(path).await?;
    let modified = meta.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let msg = ControlMessage::new(
            Command::FileData,
            vec!["a/b.txt".into(), "6".into(), "false".into(), "123".into()],
        );
        let line = msg.encode();
        assert_eq!(line, "[[SYNC:FILE_DATA:a/b.txt:6:false:123]]");
        assert_eq!(ControlMessage::parse(&line), Some(msg));
    }

    #[test]
    fn parse_no_params() {
        let msg = ControlMessage::parse("[[SYNC:HEARTBEAT]]").unwrap();
        assert_eq!(msg.command, Command::Heartbeat);
        assert!(msg.params.is_empty());
    }

    #[test]
    fn parse_keeps_empty_params() {
        let msg = ControlMessage::parse("[[SYNC:ERROR:]]").unwrap();
        assert_eq!(msg.command, Command::Error);
        assert_eq!(msg.params, vec![String::new()]);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        assert_eq!(ControlMessage::parse(""), None);
        assert_eq!(ControlMessage::parse("[[SYNC:HEARTBEAT"), None);
        assert_eq!(ControlMessage::parse("SYNC:HEARTBEAT]]"), None);
        assert_eq!(ControlMessage::parse("[[SYNC:NO_SUCH_COMMAND]]"), None);
        assert_eq!(ControlMessage::parse("noise"), None);
    }

    #[test]
    fn param_accessors() {
        let msg = ControlMessage::parse("[[SYNC:FILE_DATA:x.txt:42:true:99]]").unwrap();
        assert_eq!(msg.param(0), Some("x.txt"));
        assert_eq!(msg.param_usize(1), Some(42));
        assert_eq!(msg.param_bool(2), Some(true));
        assert_eq!(msg.param_i64(3), Some(99));
        assert_eq!(msg.param(9), None);
    }

    #[test]
    fn wire_names_round_trip() {
        for cmd in [
            Command::ManifestReq,
            Command::ManifestData,
            Command::FileReq,
            Command::FileData,
            Command::FileDelete,
            Command::Mkdir,
            Command::Rmdir,
            Command::SyncComplete,
            Command::DirectionChange,
            Command::RoleNegotiate,
            Command::Ack,
            Command::Error,
            Command::Heartbeat,
            Command::HeartbeatAck,
            Command::SharedText,
        ] {
            assert_eq!(Command::from_wire(cmd.wire_name()), Some(cmd));
        }
    }

    #[test]
    fn shared_text_round_trip() {
        let text = "hello: [[world]]\nsecond line";
        let encoded = BASE64.encode(text.as_bytes());
        assert!(!encoded.contains(':'));
        assert_eq!(Wire::decode_shared_text(&encoded).unwrap(), text);
    }

    #[test]
    fn rel_path_escapes_are_rejected() {
        let base = Path::new("/sync");
        assert!(resolve_rel_path(base, "ok/file.txt").is_ok());
        assert!(resolve_rel_path(base, "").is_err());
        assert!(resolve_rel_path(base, "/etc/passwd").is_err());
        assert!(resolve_rel_path(base, "../outside").is_err());
        assert!(resolve_rel_path(base, "a/../../outside").is_err());
    }

    #[test]
    fn staging_path_is_a_sibling() {
        let p = staging_path(Path::new("/sync/a/b.txt"));
        assert_eq!(p, Path::new("/sync/a/b.txt.wsync-part"));
    }

    fn wire_pair() -> (Wire, Wire) {
        let (link_a, link_b) = ByteLink::pair();
        let bus = EventBus::new();
        (
            Wire::new(link_a, bus.clone()),
            Wire::new(link_b, bus),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manifest_exchange_round_trip() {
        use crate::manifest::FileRecord;

        let (wire_a, wire_b) = wire_pair();

        let mut manifest = Manifest::default();
        manifest.files.insert(
            "src/lib.rs".into(),
            FileRecord {
                path: "src/lib.rs".into(),
                size: 42,
                last_modified: 1_700_000_000_123,
                md5: Some("0123456789abcdef0123456789abcdef".into()),
            },
        );
        manifest.empty_dirs.insert("assets/raw".into());
        let expected = manifest.clone();

        let sender = tokio::spawn(async move { wire_a.send_manifest(&manifest).await });

        let announce = wire_b.wait_for(Command::ManifestData).await.unwrap();
        let size = announce.param_usize(0).unwrap();
        wire_b.send(Command::Ack, &[]).await.unwrap();
        let received = wire_b.receive_manifest(size).await.unwrap();

        sender.await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_transfer_round_trip_restores_mtime() {
        let (wire_a, wire_b) = wire_pair();

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let body = "compress me ".repeat(2000);
        std::fs::create_dir_all(src.path().join("notes")).unwrap();
        std::fs::write(src.path().join("notes/data.txt"), &body).unwrap();

        let src_root = src.path().to_path_buf();
        let sender =
            tokio::spawn(async move { wire_a.send_file(&src_root, "notes/data.txt").await });

        let announce = wire_b.wait_for(Command::FileData).await.unwrap();
        assert_eq!(announce.param(0), Some("notes/data.txt"));
        let byte_count = announce.param_usize(1).unwrap();
        let compressed = announce.param_bool(2).unwrap();
        let modified = announce.param_i64(3).unwrap();
        assert!(compressed);
        assert!(byte_count < body.len());

        wire_b.send(Command::Ack, &[]).await.unwrap();
        wire_b
            .receive_file(dst.path(), "notes/data.txt", byte_count, compressed, modified)
            .await
            .unwrap();

        let was_compressed = sender.await.unwrap().unwrap();
        assert!(was_compressed);

        let target = dst.path().join("notes/data.txt");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), body);

        let restored = std::fs::metadata(&target)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        assert_eq!(restored, modified);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_answers_with_error() {
        let (wire_a, wire_b) = wire_pair();
        let src = tempfile::tempdir().unwrap();

        let src_root = src.path().to_path_buf();
        let sender = tokio::spawn(async move { wire_a.send_file(&src_root, "ghost.txt").await });

        let reply = wire_b.wait_for(Command::Error).await.unwrap();
        assert!(reply.param(0).unwrap().contains("ghost.txt"));
        assert!(!sender.await.unwrap().unwrap());
    }
}
