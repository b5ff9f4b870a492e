//! Request/response correlation.
//!
//! Outgoing requests get a fresh random `request_id`; the stable session
//! `client_id` is stamped on everything. Inbound envelopes are either replies
//! to this client (`initiator_id == client_id` with a `request_id`) or
//! unrequested updates. Replies nobody waits for are dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::error::ClientError;
use crate::protocol::Envelope;

/// Where an inbound envelope went.
#[derive(Debug)]
pub enum Routed {
    /// Handed to the waiting caller.
    Resolved,
    /// A reply with no pending request.
    Dropped,
    Unrequested { envelope: Envelope, by_me: bool },
}

/// Reply to one request.
///
/// Carries no timeout of its own; race it against `tokio::time::timeout` when
/// a bound is needed. A connection drop alone leaves it pending. It fails only
/// when the session ends: with the fatal error that ended it (a corrupt frame,
/// a rejected reconnect), or with [`ClientError::SessionClosed`].
#[derive(Debug)]
pub struct PendingReply {
    request_id: String,
    rx: oneshot::Receiver<Result<Envelope, ClientError>>,
}

impl PendingReply {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingReply {
    type Output = Result<Envelope, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|reply| match reply {
            Ok(result) => result,
            Err(_) => Err(ClientError::SessionClosed),
        })
    }
}

pub struct Correlator {
    client_id: String,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Envelope, ClientError>>>>,
}

impl Correlator {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Stamp `envelope` with this client's id, and with a fresh request id
    /// when a reply is wanted.
    pub async fn stamp(&self, envelope: &mut Envelope, wants_response: bool) -> Option<PendingReply> {
        envelope.client_id = self.client_id.clone();
        if !wants_response {
            envelope.request_id = None;
            return None;
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        // callers that gave up on their reply
        pending.retain(|_, waiter| !waiter.is_closed());
        pending.insert(request_id.clone(), tx);
        envelope.request_id = Some(request_id.clone());
        Some(PendingReply { request_id, rx })
    }

    /// Forget a request whose frame never left.
    pub async fn forget(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    pub async fn route(&self, envelope: Envelope) -> Routed {
        if !envelope.is_reply_for(&self.client_id) {
            let by_me = envelope.initiator_id.as_deref() == Some(self.client_id.as_str());
            return Routed::Unrequested { envelope, by_me };
        }

        let request_id = envelope.request_id.clone().unwrap_or_default();
        let waiter = self.pending.lock().await.remove(&request_id);
        match waiter {
            Some(waiter) => {
                if waiter.send(Ok(envelope)).is_err() {
                    log::debug!("Caller of request {request_id} no longer listens");
                }
                Routed::Resolved
            }
            None => {
                log::debug!(
                    "Dropping {:?} reply to unknown request {request_id}",
                    envelope.msg_type
                );
                Routed::Dropped
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Fail every pending request with `SessionClosed`.
    pub async fn close_all(&self) {
        self.fail_all(&ClientError::SessionClosed).await;
    }

    /// Fail every pending request with `error`.
    pub async fn fail_all(&self, error: &ClientError) {
        let abandoned = std::mem::take(&mut *self.pending.lock().await);
        if !abandoned.is_empty() {
            log::debug!("Failing {} pending requests: {error}", abandoned.len());
        }
        for (_, waiter) in abandoned {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}
