//! Transport channel.
//!
//! Wraps one [`Connection`]: resolves once the socket is open, forwards
//! frames, and turns socket teardown into at most one hard failure. When the
//! socket leaves the open state the channel waits `grace_period` and looks
//! again; a socket that recovered in the meantime is used as if nothing
//! happened.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::transport::{Connection, SocketState, Transport};

/// What the channel produced next.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(Vec<u8>),
    /// The socket is gone for good. Every later call returns this again.
    Failed,
}

pub struct Channel {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    state: watch::Receiver<SocketState>,
    grace_period: Duration,
    grace_deadline: Option<Instant>,
    failed: bool,
}

impl Channel {
    /// Connect and wait until the socket is open.
    pub async fn open(
        transport: &dyn Transport,
        address: &str,
        grace_period: Duration,
    ) -> Result<Self, TransportError> {
        let Connection {
            outgoing,
            incoming,
            mut state,
        } = transport.connect(address).await?;

        let reached = state
            .wait_for(|s| *s != SocketState::Connecting)
            .await
            .map(|s| *s);
        if !matches!(reached, Ok(SocketState::Open)) {
            log::debug!("Socket to {address} closed before it opened ({reached:?})");
            return Err(TransportError::ClosedBeforeOpen);
        }

        Ok(Self {
            outgoing,
            incoming,
            state,
            grace_period,
            grace_deadline: None,
            failed: false,
        })
    }

    /// Sender half, for installing into a session.
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.outgoing.clone()
    }

    /// Fire-and-forget send. Returns false when the socket is already gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outgoing.send(frame).is_ok()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Next inbound frame or the hard failure. Cancel safe.
    pub async fn next_event(&mut self) -> ChannelEvent {
        if self.failed {
            return ChannelEvent::Failed;
        }
        loop {
            let deadline = self.grace_deadline;
            tokio::select! {
                biased;
                frame = self.incoming.recv() => match frame {
                    Some(frame) => return ChannelEvent::Frame(frame),
                    None => {
                        log::debug!("Inbound stream ended");
                        return self.fail();
                    }
                },
                _ = grace_expired(deadline) => {
                    self.grace_deadline = None;
                    let current = *self.state.borrow_and_update();
                    if current == SocketState::Open {
                        continue;
                    }
                    log::debug!("Socket still {current:?} after {:?}", self.grace_period);
                    return self.fail();
                }
                changed = self.state.changed() => {
                    if changed.is_err() {
                        log::debug!("Socket state publisher dropped");
                        return self.fail();
                    }
                    let current = *self.state.borrow_and_update();
                    if current == SocketState::Open {
                        if self.grace_deadline.take().is_some() {
                            log::debug!("Socket recovered within the grace period");
                        }
                    } else if self.grace_deadline.is_none() {
                        log::debug!("Socket went {current:?}, re-checking in {:?}", self.grace_period);
                        self.grace_deadline = Some(Instant::now() + self.grace_period);
                    }
                }
            }
        }
    }

    fn fail(&mut self) -> ChannelEvent {
        self.failed = true;
        ChannelEvent::Failed
    }
}

async fn grace_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
