//! Typed event fan-out.
//!
//! Subsystems post [`SyncEvent`]s; subscribers observe them. Listeners run
//! synchronously on the posting task, so a UI adapter is responsible for
//! marshalling onto its own thread.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Everything the core reports to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Informational progress line.
    Log(String),
    /// A failure the user should see.
    Error(String),
    /// Connection liveness transition.
    Connection { alive: bool },
    /// Local role changed.
    Direction { is_sender: bool },
    /// A sender-driven sync round began.
    SyncStarted,
    /// A sync round finished (either side).
    SyncComplete,
    /// All file payloads of a round were delivered.
    TransferComplete,
    /// Per-operation progress within a sync round.
    FileProgress {
        current: usize,
        total: usize,
        name: String,
    },
    /// Per-block progress within one framed transfer.
    TransferProgress {
        block: usize,
        total_blocks: Option<usize>,
    },
    /// Shared text arrived from the peer.
    SharedText(String),
}

type Listener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Observer-style event bus. Cheap to clone via `Arc`.
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Register a listener invoked synchronously for every event.
    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Register a channel subscriber. Dropped receivers are tolerated.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    pub fn post(&self, event: SyncEvent) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(&event);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.post(SyncEvent::Log(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.post(SyncEvent::Error(message));
    }
}
