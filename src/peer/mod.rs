//! Peer controller.
//!
//! Owns the byte link and all process-wide connection state. One reader task
//! drains inbound control lines and dispatches them; a heartbeat supervisor
//! keeps liveness honest; role negotiation elects exactly one sender per
//! peer pair. Subsystems that need the wire (framed transfers, a running
//! sync session) claim it through the `fbt_active` flag, which the reader
//! and the supervisor cooperatively yield to.

pub mod session;
mod shared_text;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::event::{EventBus, SyncEvent};
use crate::link::ByteLink;
use crate::manifest::{generate_manifest, ScanOptions};
use crate::protocol::{resolve_rel_path, Command, ControlMessage, Wire};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const INITIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const INITIAL_HEARTBEAT_INTERVAL_MS: i64 = 2000;
const STOP_GRACE: Duration = Duration::from_secs(2);
const READER_IDLE_SLEEP: Duration = Duration::from_millis(100);
const READER_CLOSED_SLEEP: Duration = Duration::from_millis(500);
const READER_LINE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The sender is the peer with the strictly higher priority; on the
/// (vanishingly unlikely) tie both keep the receiver role.
pub(crate) fn elect_sender(local_priority: i64, remote_priority: i64) -> bool {
    local_priority > remote_priority
}

// ── ConnectionState ───────────────────────────────────────────────

/// Process-wide connection state. The controller is the only writer; other
/// subsystems observe through the getters.
#[derive(Debug)]
pub struct ConnectionState {
    running: AtomicBool,
    connection_alive: AtomicBool,
    role_negotiated: AtomicBool,
    is_sender: AtomicBool,
    syncing: AtomicBool,
    fbt_active: AtomicBool,
    local_priority: AtomicI64,
    last_hb_sent: AtomicI64,
    last_hb_received: AtomicI64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            connection_alive: AtomicBool::new(false),
            role_negotiated: AtomicBool::new(false),
            is_sender: AtomicBool::new(true),
            syncing: AtomicBool::new(false),
            fbt_active: AtomicBool::new(false),
            local_priority: AtomicI64::new(0),
            last_hb_sent: AtomicI64::new(0),
            last_hb_received: AtomicI64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connection_alive(&self) -> bool {
        self.connection_alive.load(Ordering::SeqCst)
    }

    pub fn is_role_negotiated(&self) -> bool {
        self.role_negotiated.load(Ordering::SeqCst)
    }

    pub fn is_sender(&self) -> bool {
        self.is_sender.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn is_fbt_active(&self) -> bool {
        self.fbt_active.load(Ordering::SeqCst)
    }

    pub fn local_priority(&self) -> i64 {
        self.local_priority.load(Ordering::SeqCst)
    }

    /// Any well-formed inbound traffic proves the peer is there.
    pub fn touch_received(&self) {
        self.last_hb_received.store(now_millis(), Ordering::SeqCst);
    }

    fn refresh_priority(&self) {
        let priority = now_millis() * 1000 + rand::thread_rng().gen_range(0..1000);
        self.local_priority.store(priority, Ordering::SeqCst);
    }

    /// Commit the wire to a block transfer or a sync session. The reader
    /// loop and heartbeat supervisor stay off the wire until the claim
    /// drops.
    pub(crate) fn claim_wire(&self) -> WireClaim<'_> {
        self.fbt_active.store(true, Ordering::SeqCst);
        WireClaim(self)
    }
}

pub(crate) struct WireClaim<'a>(&'a ConnectionState);

impl Drop for WireClaim<'_> {
    fn drop(&mut self) {
        self.0.fbt_active.store(false, Ordering::SeqCst);
    }
}

// ── Settings ──────────────────────────────────────────────────────

/// User-tunable sync behaviour, mutable at runtime.
#[derive(Debug, Default)]
struct Settings {
    sync_folder: RwLock<Option<PathBuf>>,
    manifest_cache: RwLock<Option<PathBuf>>,
    strict_mode: AtomicBool,
    respect_gitignore: AtomicBool,
    quick_mode: AtomicBool,
}

// ── Peer ──────────────────────────────────────────────────────────

/// Top-level controller for one end of the link.
pub struct Peer {
    pub(crate) link: ByteLink,
    pub(crate) wire: Wire,
    pub(crate) events: Arc<EventBus>,
    pub(crate) state: Arc<ConnectionState>,
    settings: Settings,
    pub(crate) pending_text: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(link: ByteLink, events: Arc<EventBus>) -> Arc<Self> {
        let state = Arc::new(ConnectionState::new());
        let hook = {
            let state = state.clone();
            Arc::new(move || state.touch_received()) as Arc<dyn Fn() + Send + Sync>
        };
        let wire = Wire::new(link.clone(), events.clone()).with_activity_hook(hook);
        Arc::new(Self {
            link,
            wire,
            events,
            state,
            settings: Settings::default(),
            pending_text: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    // ── Settings ──────────────────────────────────────────────────

    pub fn set_sync_folder(&self, folder: Option<PathBuf>) {
        *self.settings.sync_folder.write().unwrap() = folder;
    }

    pub fn sync_folder(&self) -> Option<PathBuf> {
        self.settings.sync_folder.read().unwrap().clone()
    }

    pub fn set_manifest_cache(&self, path: Option<PathBuf>) {
        *self.settings.manifest_cache.write().unwrap() = path;
    }

    pub(crate) fn manifest_cache(&self) -> Option<PathBuf> {
        self.settings.manifest_cache.read().unwrap().clone()
    }

    pub fn set_strict_mode(&self, strict: bool) {
        self.settings.strict_mode.store(strict, Ordering::SeqCst);
    }

    pub fn strict_mode(&self) -> bool {
        self.settings.strict_mode.load(Ordering::SeqCst)
    }

    pub fn set_respect_gitignore(&self, respect: bool) {
        self.settings
            .respect_gitignore
            .store(respect, Ordering::SeqCst);
    }

    pub fn respect_gitignore(&self) -> bool {
        self.settings.respect_gitignore.load(Ordering::SeqCst)
    }

    pub fn set_quick_mode(&self, quick: bool) {
        self.settings.quick_mode.store(quick, Ordering::SeqCst);
    }

    pub fn quick_mode(&self) -> bool {
        self.settings.quick_mode.load(Ordering::SeqCst)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Start the reader loop and heartbeat supervisor.
    pub fn start(self: &Arc<Self>) {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.connection_alive.store(false, Ordering::SeqCst);
        self.state.role_negotiated.store(false, Ordering::SeqCst);
        self.state.last_hb_received.store(0, Ordering::SeqCst);
        self.state.last_hb_sent.store(now_millis(), Ordering::SeqCst);
        self.state.refresh_priority();

        let reader = tokio::spawn(reader_loop(Arc::clone(self)));
        let supervisor = tokio::spawn(heartbeat_loop(Arc::clone(self)));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(reader);
        tasks.push(supervisor);
    }

    /// Stop listening. Tasks get a short grace period to observe the flag
    /// before being cancelled outright.
    pub async fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.connection_alive.store(false, Ordering::SeqCst);
        self.state.role_negotiated.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut handle in handles {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }

    /// Block until the first liveness transition, sending heartbeats on an
    /// accelerated cadence.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let _ = self.send_heartbeat_now().await;

        while self.state.is_running() && !self.state.is_connection_alive() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            let last_sent = self.state.last_hb_sent.load(Ordering::SeqCst);
            if now_millis() - last_sent >= INITIAL_HEARTBEAT_INTERVAL_MS {
                let _ = self.send_heartbeat_now().await;
            }
        }
        self.state.is_connection_alive()
    }

    async fn send_heartbeat_now(&self) -> Result<()> {
        self.wire.send(Command::Heartbeat, &[]).await?;
        self.state.last_hb_sent.store(now_millis(), Ordering::SeqCst);
        Ok(())
    }

    // ── Roles ─────────────────────────────────────────────────────

    /// Force the local role (user override) and mark negotiation settled.
    pub fn set_sender(&self, is_sender: bool) {
        self.state.is_sender.store(is_sender, Ordering::SeqCst);
        self.state.role_negotiated.store(true, Ordering::SeqCst);
        self.events.post(SyncEvent::Direction { is_sender });
    }

    /// Tell the peer which way the next session flows.
    pub async fn notify_direction_change(&self) {
        let is_sender = self.state.is_sender();
        if let Err(e) = self
            .wire
            .send(Command::DirectionChange, &[&is_sender.to_string()])
            .await
        {
            self.events
                .error(format!("Failed to notify direction change: {e}"));
        }
    }

    async fn send_role_negotiation(&self) {
        if self.state.is_role_negotiated() || !self.state.is_connection_alive() {
            return;
        }
        let priority = self.state.local_priority();
        if let Err(e) = self
            .wire
            .send(Command::RoleNegotiate, &[&priority.to_string()])
            .await
        {
            self.events
                .error(format!("Failed to send role negotiation: {e}"));
        }
    }

    async fn handle_role_negotiate(&self, remote_priority: i64) -> Result<()> {
        if self.state.is_role_negotiated() {
            return Ok(());
        }
        let mine = self.state.local_priority();
        let is_sender = elect_sender(mine, remote_priority);
        self.state.is_sender.store(is_sender, Ordering::SeqCst);
        self.state.role_negotiated.store(true, Ordering::SeqCst);

        self.events.post(SyncEvent::Direction { is_sender });
        self.events.log(format!(
            "Role negotiated: {}",
            if is_sender { "Sender" } else { "Receiver" }
        ));

        // Echo our priority so the peer can settle its side too.
        self.wire
            .send(Command::RoleNegotiate, &[&mine.to_string()])
            .await
    }

    // ── Liveness ──────────────────────────────────────────────────

    async fn mark_alive_if_needed(&self) {
        self.state.touch_received();
        if !self.state.connection_alive.swap(true, Ordering::SeqCst) {
            self.events.post(SyncEvent::Connection { alive: true });
            self.events.log("Connection restored");
            // Every (re)connect elects roles afresh with a new priority.
            self.state.refresh_priority();
            self.state.role_negotiated.store(false, Ordering::SeqCst);
            self.send_role_negotiation().await;
        }
    }

    fn mark_connection_lost(&self, reason: &str) {
        if self.state.connection_alive.swap(false, Ordering::SeqCst) {
            self.events.post(SyncEvent::Connection { alive: false });
            self.events.log(format!("Connection lost - {reason}"));
        }
    }

    // ── Sync initiation ───────────────────────────────────────────

    /// Kick off one sender-driven sync round in the background.
    pub fn start_sync(self: &Arc<Self>) {
        if !self.state.is_sender() {
            self.events
                .error("Cannot initiate sync as receiver. Change direction first.");
            return;
        }
        if !self.state.is_connection_alive() {
            self.events.error("Cannot initiate sync while disconnected");
            return;
        }
        if self.state.is_syncing() {
            self.events.error("Sync already in progress");
            return;
        }
        let folder = self.sync_folder();
        if folder.map_or(true, |f| !f.is_dir()) {
            self.events.error("Please select a sync folder first");
            return;
        }

        self.state.syncing.store(true, Ordering::SeqCst);
        let peer = Arc::clone(self);
        let handle = tokio::spawn(session::run(peer));
        self.tasks.lock().unwrap().push(handle);
    }

    // ── Dispatch ──────────────────────────────────────────────────

    async fn dispatch(&self, msg: ControlMessage) -> Result<()> {
        match msg.command {
            Command::ManifestReq => self.handle_manifest_request(&msg).await,
            // Consumed inside a sender's session; stray copies are stale.
            Command::ManifestData => {
                tracing::debug!("ignoring MANIFEST_DATA outside a sync session");
                Ok(())
            }
            Command::FileReq => self.handle_file_request(&msg).await,
            Command::FileData => self.handle_file_data(&msg).await,
            Command::FileDelete => self.handle_file_delete(&msg).await,
            Command::Mkdir => self.handle_mkdir(&msg).await,
            Command::Rmdir => self.handle_rmdir(&msg).await,
            Command::SyncComplete => {
                self.state.syncing.store(false, Ordering::SeqCst);
                self.state.touch_received();
                self.events.post(SyncEvent::SyncComplete);
                self.flush_shared_text().await;
                Ok(())
            }
            Command::DirectionChange => {
                let remote_is_sender = msg.param_bool(0).unwrap_or(false);
                let is_sender = !remote_is_sender;
                self.state.is_sender.store(is_sender, Ordering::SeqCst);
                self.events.post(SyncEvent::Direction { is_sender });
                Ok(())
            }
            Command::RoleNegotiate => {
                let remote_priority = msg.param_i64(0).ok_or_else(|| {
                    SyncError::Protocol("ROLE_NEGOTIATE without priority".into())
                })?;
                self.handle_role_negotiate(remote_priority).await
            }
            Command::Heartbeat => {
                self.wire.send(Command::HeartbeatAck, &[]).await?;
                self.mark_alive_if_needed().await;
                Ok(())
            }
            Command::HeartbeatAck => {
                self.mark_alive_if_needed().await;
                Ok(())
            }
            Command::SharedText => {
                self.handle_incoming_shared_text(msg.param(0).unwrap_or(""));
                Ok(())
            }
            Command::Error => {
                self.events
                    .error(format!("Remote error: {}", msg.param(0).unwrap_or("")));
                Ok(())
            }
            Command::Ack => {
                tracing::debug!("ignoring stray ACK");
                Ok(())
            }
        }
    }

    // ── Command handlers ──────────────────────────────────────────

    async fn handle_manifest_request(&self, msg: &ControlMessage) -> Result<()> {
        let Some(folder) = self.sync_folder().filter(|f| f.is_dir()) else {
            return self
                .wire
                .send(Command::Error, &["Sync folder not configured"])
                .await;
        };

        // The requester's manifest options win so both sides diff the same
        // kind of snapshot.
        let respect = msg.param_bool(0).unwrap_or_else(|| self.respect_gitignore());
        let quick = msg.param_bool(1).unwrap_or_else(|| self.quick_mode());

        self.events.log("Sending manifest...");
        let options = ScanOptions {
            respect_gitignore: respect,
            quick_mode: quick,
            cache_path: self.manifest_cache(),
            persist: self.manifest_cache().is_some(),
            ..Default::default()
        };
        let manifest = tokio::task::spawn_blocking(move || generate_manifest(&folder, &options))
            .await
            .map_err(|e| SyncError::Protocol(format!("manifest scan task failed: {e}")))??;

        {
            let _claim = self.state.claim_wire();
            self.wire.send_manifest(&manifest).await?;
        }

        self.events.log(manifest_summary("Manifest sent", &manifest));
        Ok(())
    }

    async fn handle_file_request(&self, msg: &ControlMessage) -> Result<()> {
        let Some(folder) = self.sync_folder() else {
            return self
                .wire
                .send(Command::Error, &["Sync folder not configured"])
                .await;
        };
        let relative = msg
            .param(0)
            .ok_or_else(|| SyncError::Protocol("FILE_REQ without path".into()))?;

        self.events.log(format!("Sending file: {relative}"));
        let _claim = self.state.claim_wire();
        self.wire.send_file(&folder, relative).await?;
        Ok(())
    }

    async fn handle_file_data(&self, msg: &ControlMessage) -> Result<()> {
        let Some(folder) = self.sync_folder() else {
            return Ok(());
        };
        let relative = msg
            .param(0)
            .ok_or_else(|| SyncError::Protocol("FILE_DATA without path".into()))?;
        let byte_count = msg
            .param_usize(1)
            .ok_or_else(|| SyncError::Protocol("FILE_DATA without byte count".into()))?;
        let compressed = msg.param_bool(2).unwrap_or(false);
        let modified = msg.param_i64(3).unwrap_or(0);

        self.state.syncing.store(true, Ordering::SeqCst);
        self.events.log(format!("Receiving file: {relative}"));

        let result = {
            let _claim = self.state.claim_wire();
            self.wire.send(Command::Ack, &[]).await?;
            self.wire
                .receive_file(&folder, relative, byte_count, compressed, modified)
                .await
        };
        if let Err(e) = result {
            // A failed transfer ends this round on our side; the sender
            // decides whether to retry.
            self.state.syncing.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.events.log(format!("File received: {relative}"));
        self.state.touch_received();
        Ok(())
    }

    async fn handle_file_delete(&self, msg: &ControlMessage) -> Result<()> {
        let Some(folder) = self.sync_folder() else {
            return Ok(());
        };
        let relative = msg
            .param(0)
            .ok_or_else(|| SyncError::Protocol("FILE_DELETE without path".into()))?;
        let path = resolve_rel_path(&folder, relative)?;
        if !path.is_file() {
            return Ok(());
        }

        self.events.log(format!("Deleting file: {relative}"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.events.log(format!("File deleted: {relative}"));
                if let Some(parent) = path.parent() {
                    cleanup_empty_parents(parent, &folder);
                }
            }
            Err(e) => self
                .events
                .error(format!("Failed to delete file: {relative} ({e})")),
        }
        Ok(())
    }

    async fn handle_mkdir(&self, msg: &ControlMessage) -> Result<()> {
        let Some(folder) = self.sync_folder() else {
            return Ok(());
        };
        let relative = msg
            .param(0)
            .ok_or_else(|| SyncError::Protocol("MKDIR without path".into()))?;
        let path = resolve_rel_path(&folder, relative)?;
        if path.exists() {
            return Ok(());
        }

        self.events.log(format!("Creating directory: {relative}"));
        match tokio::fs::create_dir_all(&path).await {
            Ok(()) => self.events.log(format!("Directory created: {relative}")),
            Err(e) => self
                .events
                .error(format!("Failed to create directory: {relative} ({e})")),
        }
        Ok(())
    }

    async fn handle_rmdir(&self, msg: &ControlMessage) -> Result<()> {
        let Some(folder) = self.sync_folder() else {
            return Ok(());
        };
        let relative = msg
            .param(0)
            .ok_or_else(|| SyncError::Protocol("RMDIR without path".into()))?;
        let path = resolve_rel_path(&folder, relative)?;
        if !path.is_dir() {
            return Ok(());
        }

        self.events.log(format!("Deleting directory: {relative}"));
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                self.events.log(format!("Directory deleted: {relative}"));
                if let Some(parent) = path.parent() {
                    cleanup_empty_parents(parent, &folder);
                }
            }
            Err(e) => self
                .events
                .error(format!("Failed to delete directory: {relative} ({e})")),
        }
        Ok(())
    }
}

pub(crate) fn manifest_summary(prefix: &str, manifest: &crate::manifest::Manifest) -> String {
    if manifest.empty_dir_count() > 0 {
        format!(
            "{prefix} ({} files, {} empty dirs)",
            manifest.file_count(),
            manifest.empty_dir_count()
        )
    } else {
        format!("{prefix} ({} files)", manifest.file_count())
    }
}

/// Remove directories left empty by a delete, walking up to (but never
/// including) the sync root.
fn cleanup_empty_parents(start: &Path, root: &Path) {
    let mut current = start.to_path_buf();
    loop {
        if current == root || !current.starts_with(root) {
            return;
        }
        let empty = matches!(
            std::fs::read_dir(&current).map(|mut it| it.next().is_none()),
            Ok(true)
        );
        if !empty || std::fs::remove_dir(&current).is_err() {
            return;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return,
        }
    }
}

// ── Background loops ──────────────────────────────────────────────

/// Sole consumer of inbound control lines (outside claimed-wire windows).
async fn reader_loop(peer: Arc<Peer>) {
    while peer.state.is_running() {
        if !peer.link.is_open() {
            tokio::time::sleep(READER_CLOSED_SLEEP).await;
            continue;
        }
        // A block transfer or session owns the wire; stay off it.
        if peer.state.is_fbt_active() {
            tokio::time::sleep(READER_IDLE_SLEEP).await;
            continue;
        }
        if peer.link.available() == 0 {
            tokio::time::sleep(READER_IDLE_SLEEP).await;
            continue;
        }

        match peer.wire.recv(READER_LINE_TIMEOUT).await {
            Ok(Some(msg)) => {
                if let Err(e) = peer.dispatch(msg).await {
                    if peer.state.is_running() {
                        peer.events.error(format!("Communication error: {e}"));
                    }
                }
            }
            Ok(None) => {}
            Err(SyncError::Timeout(_)) => {}
            Err(SyncError::LinkClosed) => {
                tokio::time::sleep(READER_CLOSED_SLEEP).await;
            }
            Err(e) => {
                if peer.state.is_running() {
                    peer.events.error(format!("Communication error: {e}"));
                }
                tokio::time::sleep(READER_IDLE_SLEEP).await;
            }
        }
    }
}

/// Periodic liveness check and keepalive.
async fn heartbeat_loop(peer: Arc<Peer>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !peer.state.is_running() {
            break;
        }
        if !peer.link.is_open() || peer.state.is_fbt_active() {
            continue;
        }

        let now = now_millis();
        let state = &peer.state;

        let last_received = state.last_hb_received.load(Ordering::SeqCst);
        if state.is_connection_alive()
            && last_received > 0
            && !state.is_syncing()
            && now - last_received > HEARTBEAT_TIMEOUT.as_millis() as i64
        {
            peer.mark_connection_lost("no heartbeat response");
        }

        let last_sent = state.last_hb_sent.load(Ordering::SeqCst);
        if !state.is_syncing() && now - last_sent >= HEARTBEAT_INTERVAL.as_millis() as i64 {
            match peer.wire.send(Command::Heartbeat, &[]).await {
                Ok(()) => state.last_hb_sent.store(now, Ordering::SeqCst),
                Err(e) => peer.mark_connection_lost(&format!("heartbeat send failed: {e}")),
            }
        }
    }
}
