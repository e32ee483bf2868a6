//! WebSocket client for a single physical connection
//!
//! Handles connection, frame writes, and message reception.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, SyncError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the venue sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Data frame for the adapter
    Text(String),
    /// Protocol-level ping or pong; counts as liveness only
    Heartbeat,
}

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: WsStream,
    url: String,
}

impl WebSocketClient {
    /// Connect to the WebSocket endpoint
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to WebSocket");

        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        info!(url = %url, status = ?response.status(), "WebSocket connected");

        Ok(Self {
            stream,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receive the next message
    ///
    /// `Ok(None)` is returned for frames that carry nothing for the caller.
    /// Pings are answered by tungstenite on the next read or write.
    pub async fn recv(&mut self) -> Result<Option<Inbound>> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!(len = text.len(), "Received text message");
                Ok(Some(Inbound::Text(text)))
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).to_string();
                Ok(Some(Inbound::Text(text)))
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                trace!("Received heartbeat");
                Ok(Some(Inbound::Heartbeat))
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(url = %self.url, frame = ?frame, "Received close frame");
                Err(SyncError::Transport("Connection closed".to_string()))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(url = %self.url, error = %e, "WebSocket error");
                Err(e.into())
            }
            None => {
                warn!(url = %self.url, "WebSocket stream ended");
                Err(SyncError::Transport("Stream ended".to_string()))
            }
        }
    }

    /// Write one text frame
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        debug!(url = %self.url, frame = %text, "Sending frame");
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Send a protocol ping to keep connection alive
    pub async fn ping(&mut self) -> Result<()> {
        self.stream.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    /// Close the connection
    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
