//! Error types for the sync core.
//!
//! All fallible operations return `Result<T, SyncError>`. Low-level transport
//! errors carry a composed diagnostic string (retry counts, elapsed time,
//! pending byte counts) so a failed transfer can be analysed post-mortem.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// The canonical error type for the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    // ── Transport ────────────────────────────────────────────────
    /// The underlying byte link reported an I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No bytes arrived within the per-call deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The byte link was closed while an operation was in flight.
    #[error("link closed")]
    LinkClosed,

    // ── Block protocol ───────────────────────────────────────────
    /// A frame failed structural validation.
    #[error("frame corruption: {0}")]
    Corruption(&'static str),

    /// The peer aborted the transfer with CAN.
    #[error("transfer cancelled by peer")]
    Cancelled,

    /// The block-transfer handshake never completed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Retries were exhausted; the message is the last diagnostic.
    #[error("block transfer failed: {0}")]
    Transfer(String),

    // ── Control plane ────────────────────────────────────────────
    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The remote peer reported an error over the control channel.
    #[error("remote error: {0}")]
    Remote(String),

    // ── Local ────────────────────────────────────────────────────
    /// A precondition on local configuration failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Manifest (de)serialization failed.
    #[error("manifest encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bytes on the wire were not valid UTF-8 where text was expected.
    #[error("invalid utf-8 on the wire: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}
