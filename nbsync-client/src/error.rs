//! Error taxonomy.
//!
//! | Error               | Handling                                         |
//! |---------------------|--------------------------------------------------|
//! | `Transport`         | retried by the supervisor; surfaced on first open |
//! | `Decode`            | fatal for the session                            |
//! | `RejectedMutation`  | fatal for one update, never retried              |
//! | `ReconnectRejected` | fatal, needs a manual refresh                    |
//!
//! Stale diffs are not errors: the ordering guard logs and drops them.

use std::time::Duration;

use nbsync_core::{CodecError, PatchError};

/// Socket-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Socket closed before it opened")]
    ClosedBeforeOpen,

    #[error("Socket I/O error: {0}")]
    Io(String),
}

/// Errors surfaced to collaborators of the client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Corrupt frame: {0}")]
    Decode(#[from] CodecError),

    #[error("Update rejected by remote: {why_not}")]
    RejectedMutation { why_not: String },

    #[error("Out of sync: the resumed session was rejected, please refresh")]
    ReconnectRejected,

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No handshake reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Remote serves notebook {found}, expected {expected}")]
    NotebookMismatch { expected: String, found: String },

    #[error("Session closed")]
    SessionClosed,
}

impl ClientError {
    /// Whether the session can no longer be trusted after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Decode(_) | ClientError::ReconnectRejected | ClientError::SessionClosed
        )
    }
}
