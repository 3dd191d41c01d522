//! Shared-text channel.
//!
//! A single debounced slot: queueing overwrites any unsent text, and the
//! flush is back-pressured while a sync session or block transfer owns the
//! wire. The slot drains on queue, and again whenever a session goes idle.

use crate::event::SyncEvent;
use crate::peer::Peer;
use crate::protocol::Wire;

impl Peer {
    /// Store `text` for delivery and flush immediately if the wire is idle.
    pub async fn queue_shared_text(&self, text: impl Into<String>) {
        *self.pending_text.lock().unwrap() = Some(text.into());
        self.flush_shared_text().await;
    }

    pub(crate) async fn flush_shared_text(&self) {
        let Some(text) = self.pending_text.lock().unwrap().clone() else {
            return;
        };
        if !self.state.is_running() || !self.state.is_connection_alive() {
            self.events.error("Cannot send shared text - not connected");
            return;
        }
        if self.state.is_syncing() || self.state.is_fbt_active() {
            // Stays queued; the session-idle hook retries.
            return;
        }

        match self.wire.send_shared_text(&text).await {
            Ok(()) => {
                // Clear only if the user did not type something newer while
                // the send was in flight.
                let mut slot = self.pending_text.lock().unwrap();
                if slot.as_deref() == Some(text.as_str()) {
                    *slot = None;
                }
            }
            Err(e) => self
                .events
                .error(format!("Failed to send shared text: {e}")),
        }
    }

    pub(crate) fn handle_incoming_shared_text(&self, payload: &str) {
        match Wire::decode_shared_text(payload) {
            Ok(text) => self.events.post(SyncEvent::SharedText(text)),
            Err(e) => self
                .events
                .error(format!("Discarding undecodable shared text: {e}")),
        }
    }
}
