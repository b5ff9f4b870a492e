//! WebSocket transport.
//!
//! One binary WebSocket message per frame. A writer task forwards outgoing
//! frames and sends a close frame once every sender is gone; a reader task
//! forwards binary messages and publishes the socket state.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::transport::{Connection, SocketState, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        log::debug!("WebSocket to {address} open");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (state_tx, state_rx) = watch::channel(SocketState::Open);
        let state_tx = Arc::new(state_tx);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Writer task: outgoing channel -> socket
        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(frame.into())).await {
                    log::debug!("WebSocket write failed: {e}");
                    writer_state.send_replace(SocketState::Closed);
                    return;
                }
            }
            writer_state.send_replace(SocketState::Closing);
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: socket -> incoming channel
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        state_tx.send_replace(SocketState::Closing);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("WebSocket read failed: {e}");
                        break;
                    }
                }
            }
            state_tx.send_replace(SocketState::Closed);
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
            state: state_rx,
        })
    }
}
