//! Local execution stub.
//!
//! An in-process authoritative party for running the client without a server:
//! it keeps the canonical notebook, applies submitted patches to it,
//! acknowledges them, answers resync requests and broadcasts every committed
//! change to the other connected clients. It never executes code; cell results
//! only change through [`LoopbackTransport::update`].

use std::sync::Arc;

use async_trait::async_trait;
use nbsync_core::{apply_notebook, diff_notebook, ensure_client_writable, Notebook, Patch, PatchError, Value};
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::protocol::{
    updates_from_body, Envelope, MessageType, NotebookDiff, RouteMetadata, SharedState, UpdateAck,
};
use crate::transport::{pipe, Connection, RemoteEnd, SocketState, Transport};

/// Sender id of the stub.
pub const LOOPBACK_ID: &str = "loopback";

#[derive(Clone)]
pub struct LoopbackTransport {
    authority: Arc<Mutex<Authority>>,
}

struct Peer {
    client_id: String,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
}

struct Authority {
    notebook: Notebook,
    counter: u64,
    peers: Vec<Peer>,
}

impl LoopbackTransport {
    pub fn new(notebook: Notebook) -> Self {
        Self {
            authority: Arc::new(Mutex::new(Authority {
                notebook,
                counter: 0,
                peers: Vec::new(),
            })),
        }
    }

    /// Canonical notebook.
    pub async fn notebook(&self) -> Notebook {
        self.authority.lock().await.notebook.clone()
    }

    pub async fn counter(&self) -> u64 {
        self.authority.lock().await.counter
    }

    /// Change the canonical notebook and broadcast the diff to every client,
    /// the way a remote recomputation would. Returns the new counter.
    pub async fn update<F>(&self, mutate: F) -> Result<u64, PatchError>
    where
        F: FnOnce(&mut Notebook),
    {
        let mut authority = self.authority.lock().await;
        let change = diff_notebook(&authority.notebook, mutate)?;
        if !change.patch.is_empty() {
            authority.commit(change.snapshot, change.patch, None);
        }
        Ok(authority.counter)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        log::debug!("Loopback connection for {address}");
        let (connection, end) = pipe(SocketState::Open);
        tokio::spawn(serve(self.authority.clone(), end));
        Ok(connection)
    }
}

async fn serve(authority: Arc<Mutex<Authority>>, mut end: RemoteEnd) {
    while let Some(frame) = end.from_client.recv().await {
        let request = match Envelope::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Loopback closing connection after corrupt frame: {e}");
                break;
            }
        };
        let body = authority.lock().await.handle(&request, &end.to_client);
        let (Some(body), Some(_)) = (body, request.request_id.as_ref()) else {
            continue;
        };
        match Envelope::reply(&request, LOOPBACK_ID, body).encode() {
            Ok(reply) => {
                if end.to_client.send(reply).is_err() {
                    break;
                }
            }
            Err(e) => log::error!("Loopback failed to encode reply: {e}"),
        }
    }
    end.state.send_replace(SocketState::Closed);
}

impl Authority {
    /// Reply body for `request`, if it has one.
    fn handle(&mut self, request: &Envelope, to_client: &mpsc::UnboundedSender<Vec<u8>>) -> Option<Value> {
        match request.msg_type {
            MessageType::Connect => {
                self.peers.retain(|p| p.client_id != request.client_id);
                self.peers.push(Peer {
                    client_id: request.client_id.clone(),
                    to_client: to_client.clone(),
                });
                Some(Value::map_from([(
                    "notebook_id",
                    Value::from(self.notebook.notebook_id.as_str()),
                )]))
            }
            MessageType::ResetSharedState => Some(
                SharedState {
                    notebook: self.notebook.clone(),
                    counter: self.counter,
                }
                .to_body(),
            ),
            MessageType::UpdateNotebook => Some(self.submit(request).to_body()),
            MessageType::RunMultipleCells => Some(Value::map()),
            MessageType::Ping
            | MessageType::Pong
            | MessageType::InterruptAll
            | MessageType::NotebookDiff => None,
        }
    }

    fn submit(&mut self, request: &Envelope) -> UpdateAck {
        if let Some(id) = request.notebook_id.as_deref() {
            if id != self.notebook.notebook_id {
                return UpdateAck::rejected(format!("unknown notebook {id}"));
            }
        }
        let result = updates_from_body(&request.body)
            .and_then(|patch| Ok(ensure_client_writable(&patch).map(|_| patch)?))
            .and_then(|patch| Ok((apply_notebook(&self.notebook, &patch)?, patch)));
        match result {
            Ok((next, patch)) => {
                self.commit(next, patch, Some(&request.client_id));
                UpdateAck::accepted()
            }
            Err(e) => {
                log::debug!("Loopback refusing update from {}: {e}", request.client_id);
                UpdateAck::rejected(e.to_string())
            }
        }
    }

    /// Make `next` canonical and tell everyone but the initiator.
    fn commit(&mut self, next: Notebook, patch: Patch, initiator: Option<&str>) {
        self.notebook = next;
        self.counter += 1;

        let body = NotebookDiff {
            counter: self.counter,
            patch,
        }
        .to_body();
        let route = RouteMetadata::notebook(self.notebook.notebook_id.clone());
        let frame = match Envelope::broadcast(MessageType::NotebookDiff, LOOPBACK_ID, initiator, body)
            .with_route(&route)
            .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Loopback failed to encode diff: {e}");
                return;
            }
        };

        self.peers.retain(|p| !p.to_client.is_closed());
        for peer in &self.peers {
            if Some(peer.client_id.as_str()) == initiator {
                continue;
            }
            let _ = peer.to_client.send(frame.clone());
        }
    }
}
