//! wiresync: peer-to-peer directory synchronisation over a single
//! half-duplex serial byte stream.
//!
//! Two peers, each holding a local directory tree, converge to a
//! sender-authoritative state by exchanging manifests, streaming changed
//! files through a reliable block protocol, and optionally pruning
//! extraneous entries on the receiver.
//!
//! ```text
//! +------------+   [[SYNC:...]] lines + XMODEM-CRC frames   +------------+
//! |  Peer (A)  | <----------------------------------------> |  Peer (B)  |
//! | reader loop|          one shared byte link              | reader loop|
//! | heartbeat  |                                            | heartbeat  |
//! | session    |                                            | dispatch   |
//! +------------+                                            +------------+
//! ```

pub mod compress;
pub mod error;
pub mod event;
pub mod fbt;
pub mod link;
pub mod manifest;
pub mod peer;
pub mod protocol;

pub use error::{Result, SyncError};
pub use event::{EventBus, SyncEvent};
pub use link::ByteLink;
pub use manifest::{
    compute_changes, generate_manifest, ChangeSet, FileRecord, GitignoreSet, Manifest, ScanOptions,
};
pub use peer::{ConnectionState, Peer};
pub use protocol::{Command, ControlMessage, Wire};
