//! Transport interface.
//!
//! A transport turns an address into one [`Connection`]: a duplex pipe of
//! pre-encoded frames plus the observable socket state. The real socket
//! ([`crate::websocket`]), the in-memory mock ([`crate::memory`]) and the local
//! execution stub ([`crate::loopback`]) implement it independently; everything
//! above this layer depends only on the trait.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;

/// Socket state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One duplex connection handed out by a [`Transport`].
#[derive(Debug)]
pub struct Connection {
    /// Frames to the remote party. Dropping every sender closes the socket.
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames from the remote party, in arrival order.
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    pub state: watch::Receiver<SocketState>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting. The returned connection may still be `Connecting`.
    async fn connect(&self, address: &str) -> Result<Connection, TransportError>;
}

/// Remote side of an in-process [`Connection`].
#[derive(Debug)]
pub struct RemoteEnd {
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
    pub state: watch::Sender<SocketState>,
}

/// Connected pair for in-process transports.
pub fn pipe(initial: SocketState) -> (Connection, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(initial);
    (
        Connection {
            outgoing: out_tx,
            incoming: in_rx,
            state: state_rx,
        },
        RemoteEnd {
            from_client: out_rx,
            to_client: in_tx,
            state: state_tx,
        },
    )
}
