//! Reconnection supervisor.
//!
//! Drives one session for its whole life:
//!
//! ```text
//!            open + handshake
//! RECONNECTING ─────────────► CONNECTED
//!      ▲                          │ channel failed
//!      │ reopen (backoff)         ▼
//!      └──────────────────── DISCONNECTED
//!
//! reopened ─► handshake ─► on_reconnect() ─┬─ true  ─► CONNECTED
//!                                          └─ false ─► OUT_OF_SYNC (terminal)
//! ```
//!
//! Only one reopen attempt is in flight at a time. Frames keep flowing while
//! the handshake and the acceptance predicate run, so both may use requests.
//! A corrupt frame ends the session at any point.

use std::future::Future;
use std::sync::Arc;

use nbsync_core::Value;
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelEvent};
use crate::correlator::Routed;
use crate::error::{ClientError, TransportError};
use crate::protocol::{Envelope, MessageType};
use crate::session::{ConnectionStatus, Session, SessionHandler};
use crate::transport::Transport;

enum Recovery {
    Resumed(Channel),
    Rejected,
    Fatal(ClientError),
}

pub(crate) struct Supervisor {
    session: Session,
    transport: Arc<dyn Transport>,
    address: String,
    handler: Arc<dyn SessionHandler>,
}

impl Supervisor {
    pub(crate) fn new(
        session: Session,
        transport: Arc<dyn Transport>,
        address: String,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        Self {
            session,
            transport,
            address,
            handler,
        }
    }

    pub(crate) async fn run(
        self,
        mut channel: Channel,
        ready: oneshot::Sender<Result<(), ClientError>>,
    ) {
        self.session.install(channel.sender()).await;
        if let Err(e) = self.handshake(&mut channel, false).await {
            log::error!("Handshake with {} failed: {e}", self.address);
            self.session.uninstall().await;
            let _ = ready.send(Err(e));
            return;
        }
        self.connected();
        let _ = ready.send(Ok(()));

        loop {
            if let Err(e) = self.pump(&mut channel).await {
                self.fail(e).await;
                return;
            }

            log::warn!("Connection to {} lost", self.address);
            self.session.uninstall().await;
            self.session.set_status(ConnectionStatus::Disconnected);
            self.handler.on_connection_status(false, false);

            channel = match self.recover().await {
                Recovery::Resumed(channel) => channel,
                Recovery::Rejected => {
                    self.reject().await;
                    return;
                }
                Recovery::Fatal(e) => {
                    self.fail(e).await;
                    return;
                }
            };
            self.connected();
        }
    }

    fn connected(&self) {
        log::info!("Session {} connected to {}", self.session.client_id(), self.address);
        self.session.set_status(ConnectionStatus::Connected);
        self.handler.on_connection_status(true, false);
    }

    async fn recover(&self) -> Recovery {
        let config = self.session.config().clone();
        let mut attempt = 0u32;
        loop {
            let delay = config.reconnect_backoff(attempt);
            attempt = attempt.saturating_add(1);
            if !delay.is_zero() {
                log::info!("Reopening {} in {delay:?}", self.address);
                tokio::time::sleep(delay).await;
            }
            self.session.set_status(ConnectionStatus::Reconnecting);

            let mut channel =
                match Channel::open(self.transport.as_ref(), &self.address, config.grace_period).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        log::warn!("Reopen attempt {attempt} failed: {e}");
                        continue;
                    }
                };
            self.session.install(channel.sender()).await;

            match self.handshake(&mut channel, true).await {
                Ok(true) => return Recovery::Resumed(channel),
                Ok(false) => return Recovery::Rejected,
                Err(e) if e.is_fatal() => return Recovery::Fatal(e),
                Err(e) => {
                    log::warn!("Resuming session failed on attempt {attempt}: {e}");
                    self.session.uninstall().await;
                }
            }
        }
    }

    /// `Connect` round trip, then the acceptance predicate when resuming.
    async fn handshake(&self, channel: &mut Channel, resumed: bool) -> Result<bool, ClientError> {
        let reply = self
            .session
            .request(MessageType::Connect, Value::map(), None)
            .await?;
        let limit = self.session.config().handshake_timeout;
        let envelope = tokio::time::timeout(limit, self.pump_until(channel, reply))
            .await
            .map_err(|_| ClientError::HandshakeTimeout(limit))??;
        self.session.set_connect_info(envelope.body).await;

        if !resumed {
            return Ok(true);
        }
        let accepted = self
            .pump_until(channel, async {
                Ok(self.handler.on_reconnect(&self.session).await)
            })
            .await?;
        if accepted {
            log::info!("Resumed session {} accepted", self.session.client_id());
        }
        Ok(accepted)
    }

    /// Deliver inbound frames until `fut` completes.
    async fn pump_until<F, T>(&self, channel: &mut Channel, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                result = &mut fut => return result,
                event = channel.next_event() => match event {
                    ChannelEvent::Frame(frame) => self.dispatch(frame).await?,
                    ChannelEvent::Failed => {
                        return Err(TransportError::Io("connection lost during handshake".into()).into())
                    }
                },
            }
        }
    }

    /// Deliver inbound frames until the channel fails.
    async fn pump(&self, channel: &mut Channel) -> Result<(), ClientError> {
        loop {
            match channel.next_event().await {
                ChannelEvent::Frame(frame) => self.dispatch(frame).await?,
                ChannelEvent::Failed => return Ok(()),
            }
        }
    }

    async fn dispatch(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        let envelope = Envelope::decode(&frame).map_err(|e| {
            log::error!("Corrupt frame of {} bytes: {e}", frame.len());
            ClientError::from(e)
        })?;
        log::debug!(
            "Received {:?} from {} (request {:?})",
            envelope.msg_type,
            envelope.client_id,
            envelope.request_id
        );
        if let Routed::Unrequested { envelope, by_me } =
            self.session.correlator().route(envelope).await
        {
            self.handler
                .on_unrequested_update(&self.session, envelope, by_me)
                .await;
        }
        Ok(())
    }

    async fn reject(&self) {
        log::error!(
            "Resumed session {} was rejected, refresh required",
            self.session.client_id()
        );
        self.session.set_status(ConnectionStatus::OutOfSync);
        self.handler.on_connection_status(false, true);
        let cause = ClientError::ReconnectRejected;
        self.handler.on_fatal_error(&cause);
        self.session.close_with(&cause).await;
    }

    async fn fail(&self, error: ClientError) {
        log::error!("Session {} failed: {error}", self.session.client_id());
        self.session.set_status(ConnectionStatus::Failed);
        self.handler.on_connection_status(false, true);
        self.handler.on_fatal_error(&error);
        self.session.close_with(&error).await;
    }
}
