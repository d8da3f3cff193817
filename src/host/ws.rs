//! WebSocket front-end for the command channel.
//!
//! Used by dev tooling and the functional-test harness: each text frame
//! carries one command line, and each command produces exactly one text
//! frame back with the JSON response. Non-text frames are ignored.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use super::Host;

/// Accept WebSocket connections on `addr` and serve the command channel on
/// each, one task per connection.
pub async fn serve(host: Arc<Host>, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "websocket channel listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let host = host.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(host, stream).await {
                tracing::warn!(%peer, "websocket connection error: {err}");
            }
        });
    }
}

async fn handle_connection(host: Arc<Host>, stream: TcpStream) -> anyhow::Result<()> {
    let mut socket = accept_async(stream).await?;

    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => {
                let response = host.dispatch(text.as_str());
                let payload = serde_json::to_string(&response)?;
                socket.send(Message::Text(payload.into())).await?;
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; binary frames are
            // not part of the channel contract.
            _ => {}
        }
    }

    Ok(())
}
