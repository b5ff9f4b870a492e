//! # nbsync-client — Notebook synchronization client
//!
//! Keeps a local copy of a notebook consistent with an authoritative remote
//! party over an unreliable, reconnecting transport, while local edits show up
//! immediately.
//!
//! ## Architecture
//!
//! ```text
//!  NotebookClient::update_notebook(f)
//!        │  UpdateSequencer (FIFO) ─ IdleGate / BondBuffer
//!        ▼
//!  diff_notebook ──patch──► Session ──► Correlator ──► Channel ──► Transport
//!                              ▲                          │
//!  apply_notebook ◄─ OrderingGuard ◄─ SessionHandler ◄── Supervisor
//! ```
//!
//! ## Modules
//!
//! - [`transport`] — the `Transport` interface; [`websocket`], [`memory`] and
//!   [`loopback`] implement it
//! - [`channel`] — open/send/receive with a grace period before failing
//! - [`correlator`] — request ids, reply matching, unrequested updates
//! - `supervisor` — reconnection loop and connection status
//! - [`session`] — per-`open()` session object and its callbacks
//! - [`client`] — `NotebookClient`: optimistic updates, inbound diffs, resync
//! - [`ordering`], [`idle`], [`sequencer`] — the consistency rules

pub mod channel;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod idle;
pub mod loopback;
pub mod memory;
pub mod ordering;
pub mod protocol;
pub mod sequencer;
pub mod session;
mod supervisor;
pub mod transport;
pub mod websocket;

pub use client::{NotebookClient, UpdateOutcome};
pub use config::{ClientConfig, RejectionPolicy};
pub use correlator::PendingReply;
pub use error::{ClientError, TransportError};
pub use loopback::LoopbackTransport;
pub use memory::{MemoryTransport, RemotePeer};
pub use protocol::{Envelope, MessageType, RouteMetadata};
pub use session::{ConnectionStatus, Session, SessionHandler};
pub use transport::{Connection, SocketState, Transport};
pub use websocket::WebSocketTransport;
