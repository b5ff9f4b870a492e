//! The client over a real WebSocket.
//!
//! The server side bridges every accepted socket to a loopback connection,
//! so the frames cross an actual TCP connection end to end.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use nbsync_client::{
    ClientConfig, ClientError, LoopbackTransport, NotebookClient, Transport, TransportError,
    UpdateOutcome, WebSocketTransport,
};
use nbsync_core::Notebook;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

const T: Duration = Duration::from_secs(5);

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Serve `stub` over WebSocket, return the URL.
async fn start_bridge(stub: LoopbackTransport) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let stub = stub.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let Ok(mut conn) = stub.connect("bridge").await else {
                    return;
                };
                let (mut ws_writer, mut ws_reader) = ws.split();
                let outgoing = conn.outgoing.clone();
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = ws_reader.next().await {
                        if let Message::Binary(data) = msg {
                            if outgoing.send(data.into()).is_err() {
                                break;
                            }
                        }
                    }
                });
                while let Some(frame) = conn.incoming.recv().await {
                    if ws_writer.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    format!("ws://127.0.0.1:{port}")
}

fn notebook() -> Notebook {
    let mut nb = Notebook::new("ws-nb");
    nb.insert_cell(0, "A", "1+1");
    nb
}

fn config() -> ClientConfig {
    ClientConfig {
        ping_interval: None,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_update_over_websocket() {
    let stub = LoopbackTransport::new(notebook());
    let url = start_bridge(stub.clone()).await;
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new());

    let client = timeout(T, NotebookClient::open(transport, &url, "ws-nb", config()))
        .await
        .expect("open timed out")
        .expect("open failed");
    assert_eq!(client.notebook().code("A"), Some("1+1"));

    let outcome = timeout(
        T,
        client.update_notebook(|nb| {
            if let Some(input) = nb.cell_inputs.get_mut("A") {
                input.code = "6*7".into();
            }
        }),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(outcome, UpdateOutcome::Acknowledged(_)));
    assert_eq!(stub.notebook().await.code("A"), Some("6*7"));

    client.close().await;
}

#[tokio::test]
async fn test_remote_changes_over_websocket() {
    let stub = LoopbackTransport::new(notebook());
    let url = start_bridge(stub.clone()).await;
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new());
    let client = timeout(T, NotebookClient::open(transport, &url, "ws-nb", config()))
        .await
        .unwrap()
        .unwrap();

    stub.update(|nb| {
        nb.add_cell("remote cell");
    })
    .await
    .unwrap();

    let mut rx = client.subscribe();
    let reached = matches!(
        timeout(T, rx.wait_for(|nb| nb.cell_order.len() == 2)).await,
        Ok(Ok(_))
    );
    assert!(reached, "remote cell never arrived");
}

#[tokio::test]
async fn test_refused_connection_is_a_transport_error() {
    let port = free_port().await;
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new());
    let result = NotebookClient::open(
        transport,
        &format!("ws://127.0.0.1:{port}"),
        "ws-nb",
        config(),
    )
    .await;
    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Connect { .. }))
    ));
}
