// WebSocket Backend
//
// Connects a broker connection to a remote extension host. Port messages go
// out as JSON text frames; incoming text frames are parsed back to JSON.

use super::backend::SpawnError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Socket {
    url: String,
    write: SplitSink<WsConnection, WsMessage>,
    read: SplitStream<WsConnection>,
}

impl Socket {
    /// Open the socket. Resolves once the opening handshake completed.
    pub async fn connect(url: &str) -> Result<Self, SpawnError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SpawnError::Socket(e.to_string()))?;
        let (write, read) = stream.split();

        log::info!("WebSocket open: {}", url);

        Ok(Self {
            url: url.to_string(),
            write,
            read,
        })
    }

    pub async fn send(&mut self, message: Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(&message)?;
        self.write.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Next JSON message, `None` once the socket closed
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.read.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => log::warn!("Dropping non-JSON frame from {}: {}", self.url, e),
                },
                Some(Ok(WsMessage::Binary(data))) => match serde_json::from_slice(&data) {
                    Ok(message) => return Some(message),
                    Err(e) => log::warn!("Dropping non-JSON frame from {}: {}", self.url, e),
                },
                Some(Ok(WsMessage::Close(_))) => {
                    log::info!("WebSocket closed by server: {}", self.url);
                    return None;
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error on {}: {}", self.url, e);
                    return None;
                }
                None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.write.send(WsMessage::Close(None)).await {
            log::debug!("WebSocket {} already closed: {}", self.url, e);
        }
        let _ = self.write.close().await;
    }
}
