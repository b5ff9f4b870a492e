//! In-memory transport with a scriptable remote end.
//!
//! Every successful `connect` produces a [`RemotePeer`] that the test (or an
//! embedding application) picks up with [`MemoryTransport::accept`] and drives
//! by hand: read what the client sent, answer, flip the socket state, drop the
//! connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nbsync_core::{CodecError, Value};
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::protocol::Envelope;
use crate::transport::{pipe, Connection, RemoteEnd, SocketState, Transport};

/// Sender id used by the scripted remote party.
pub const REMOTE_ID: &str = "memory-remote";

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    accepted_tx: mpsc::UnboundedSender<RemotePeer>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<RemotePeer>>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryInner {
                accepted_tx,
                accepted_rx: Mutex::new(accepted_rx),
                refuse: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Next connection made by a client.
    pub async fn accept(&self) -> Option<RemotePeer> {
        self.inner.accepted_rx.lock().await.recv().await
    }

    /// Make subsequent connects fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect calls so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        let (connection, end) = pipe(SocketState::Open);
        let peer = RemotePeer {
            address: address.to_string(),
            end,
        };
        self.inner
            .accepted_tx
            .send(peer)
            .map_err(|_| TransportError::ClosedBeforeOpen)?;
        Ok(connection)
    }
}

/// The remote side of one in-memory connection.
pub struct RemotePeer {
    address: String,
    end: RemoteEnd,
}

impl RemotePeer {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next raw frame from the client.
    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        self.end.from_client.recv().await
    }

    /// Next envelope from the client. `None` once the client dropped the socket.
    pub async fn recv(&mut self) -> Option<Result<Envelope, CodecError>> {
        self.recv_frame().await.map(|frame| Envelope::decode(&frame))
    }

    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope
            .encode()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.send_raw(frame)
    }

    /// Push arbitrary bytes, e.g. a corrupt frame.
    pub fn send_raw(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.end
            .to_client
            .send(frame)
            .map_err(|_| TransportError::Io("client side is gone".into()))
    }

    pub fn reply(&self, request: &Envelope, body: Value) -> Result<(), TransportError> {
        self.send(&Envelope::reply(request, REMOTE_ID, body))
    }

    pub fn set_state(&self, state: SocketState) {
        self.end.state.send_replace(state);
    }

    /// Tear the connection down from the remote side.
    pub fn close(self) {
        self.set_state(SocketState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_connect_hands_out_remote_peer() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("mem://nb").await.unwrap();
        let mut peer = transport.accept().await.unwrap();
        assert_eq!(peer.address(), "mem://nb");

        let env = Envelope::new(MessageType::Ping, "c", Value::Nil);
        conn.outgoing.send(env.encode().unwrap()).unwrap();
        assert_eq!(peer.recv().await.unwrap().unwrap(), env);

        peer.reply(&env, Value::from(1)).unwrap();
        let frame = conn.incoming.recv().await.unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap().body, Value::from(1));
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let transport = MemoryTransport::new();
        transport.refuse_connections(true);
        assert!(matches!(
            transport.connect("mem://nb").await,
            Err(TransportError::Connect { .. })
        ));
        assert_eq!(transport.connect_attempts(), 1);
    }
}
