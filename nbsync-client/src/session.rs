//! Session: one per `open()` call.
//!
//! A session owns the stable client id, the request correlator, the sender of
//! the currently installed channel and the connection status. Collaborators
//! receive it by handle (it is cheap to clone); nothing is process-wide.
//!
//! ```text
//!  caller ──send/request──► Session ──frame──► Channel ──► Transport
//!                              ▲                  │
//!        SessionHandler ◄──────┴── supervisor ◄───┘ (frames, failures)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nbsync_core::Value;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::correlator::{Correlator, PendingReply};
use crate::error::ClientError;
use crate::protocol::{Envelope, MessageType, RouteMetadata};
use crate::supervisor::Supervisor;
use crate::transport::Transport;

/// Connection status as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Opening or reopening the channel (initial state).
    Reconnecting,
    Connected,
    /// The channel failed; a reopen follows immediately.
    Disconnected,
    /// The resumed session was refused. Terminal: refresh manually.
    OutOfSync,
    /// A corrupt frame arrived. Terminal.
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionStatus::OutOfSync | ConnectionStatus::Failed | ConnectionStatus::Closed
        )
    }
}

/// Callbacks of a session.
///
/// Callbacks run on the session's receive loop: they may send, but must not
/// wait for a reply themselves (spawn a task for that), or the reply they wait
/// for can never be delivered.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// An envelope that is not a reply to one of our requests.
    /// `by_me` is true when our own client caused it.
    async fn on_unrequested_update(&self, session: &Session, envelope: Envelope, by_me: bool);

    /// `connected` flips on every transition; `hopeless` marks terminal failures.
    fn on_connection_status(&self, connected: bool, hopeless: bool) {
        log::debug!("Connection status: connected={connected} hopeless={hopeless}");
    }

    /// Decide whether a resumed session may continue. Runs after every reopen,
    /// before the session is declared connected again; replies are delivered
    /// while it runs.
    async fn on_reconnect(&self, _session: &Session) -> bool {
        true
    }

    fn on_fatal_error(&self, error: &ClientError) {
        log::error!("Session failed: {error}");
    }
}

pub(crate) struct SessionInner {
    pub(crate) config: ClientConfig,
    route: RouteMetadata,
    correlator: Correlator,
    outgoing: RwLock<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    status: watch::Sender<ConnectionStatus>,
    connect_info: RwLock<Value>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a live session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session: connect, handshake, then keep the connection alive
    /// until [`Session::close`] or a terminal failure.
    ///
    /// A failure before the first successful handshake is returned here and
    /// never retried.
    pub async fn open(
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        route: RouteMetadata,
        config: ClientConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Session, ClientError> {
        let address = address.into();
        let channel = Channel::open(transport.as_ref(), &address, config.grace_period).await?;

        let session = Session::new(route, config);
        log::info!("Session {} opened {address}", session.client_id());

        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = Supervisor::new(session.clone(), transport, address, handler);
        let driver = tokio::spawn(supervisor.run(channel, ready_tx));
        session.track(driver);

        match ready_rx.await {
            Ok(Ok(())) => {
                session.spawn_keepalive();
                Ok(session)
            }
            Ok(Err(e)) => {
                session.close().await;
                Err(e)
            }
            Err(_) => {
                session.close().await;
                Err(ClientError::SessionClosed)
            }
        }
    }

    pub(crate) fn new(route: RouteMetadata, config: ClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Reconnecting);
        Self {
            inner: Arc::new(SessionInner {
                config,
                route,
                correlator: Correlator::new(Uuid::new_v4().to_string()),
                outgoing: RwLock::new(None),
                status,
                connect_info: RwLock::new(Value::Nil),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Stable id of this session, stamped on every envelope.
    pub fn client_id(&self) -> &str {
        self.inner.correlator.client_id()
    }

    pub fn route(&self) -> &RouteMetadata {
        &self.inner.route
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Body of the last handshake reply.
    pub async fn connect_info(&self) -> Value {
        self.inner.connect_info.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send one envelope. With `wants_response` the returned reply resolves
    /// exactly once; without it the send is fire-and-forget.
    ///
    /// `route` fields left unset default to the session's routing metadata.
    /// While no channel is installed the frame is dropped with a warning.
    pub async fn send(
        &self,
        msg_type: MessageType,
        body: Value,
        route: Option<&RouteMetadata>,
        wants_response: bool,
    ) -> Result<Option<PendingReply>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        let route = route.cloned().unwrap_or_default().or(&self.inner.route);
        let mut envelope = Envelope::new(msg_type, "", body).with_route(&route);
        let pending = self.inner.correlator.stamp(&mut envelope, wants_response).await;

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(pending) = &pending {
                    self.inner.correlator.forget(pending.request_id()).await;
                }
                return Err(e.into());
            }
        };
        self.transmit(msg_type, frame).await;
        Ok(pending)
    }

    /// Send and expect a reply.
    pub async fn request(
        &self,
        msg_type: MessageType,
        body: Value,
        route: Option<&RouteMetadata>,
    ) -> Result<PendingReply, ClientError> {
        self.send(msg_type, body, route, true)
            .await?
            .ok_or(ClientError::SessionClosed)
    }

    async fn transmit(&self, msg_type: MessageType, frame: Vec<u8>) {
        let outgoing = self.inner.outgoing.read().await;
        let delivered = outgoing.as_ref().is_some_and(|tx| tx.send(frame).is_ok());
        if !delivered {
            log::warn!("Not connected, dropping {msg_type:?} frame");
        }
    }

    /// Close the session. Best effort: frames still queued may never leave.
    /// Pending requests fail with [`ClientError::SessionClosed`].
    pub async fn close(&self) {
        self.shut_down(&ClientError::SessionClosed).await;
    }

    /// Close after a fatal error; pending requests fail with `cause`.
    pub(crate) async fn close_with(&self, cause: &ClientError) {
        self.shut_down(cause).await;
    }

    async fn shut_down(&self, cause: &ClientError) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing session {}", self.client_id());
        self.inner.outgoing.write().await.take();
        self.inner.correlator.fail_all(cause).await;
        self.inner.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = ConnectionStatus::Closed;
                true
            }
        });
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }

    // ── supervisor side ──────────────────────────────────────────

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.inner.status.send_replace(status);
    }

    pub(crate) async fn install(&self, sender: mpsc::UnboundedSender<Vec<u8>>) {
        *self.inner.outgoing.write().await = Some(sender);
    }

    pub(crate) async fn uninstall(&self) {
        self.inner.outgoing.write().await.take();
    }

    pub(crate) async fn set_connect_info(&self, info: Value) {
        *self.inner.connect_info.write().await = info;
    }

    fn track(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }

    fn spawn_keepalive(&self) {
        let Some(every) = self.inner.config.ping_interval else {
            return;
        };
        let session = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if session.status() != ConnectionStatus::Connected {
                    continue;
                }
                if session
                    .send(MessageType::Ping, Value::map(), None, false)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        self.track(task);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id())
            .field("status", &self.status())
            .finish()
    }
}
