// ===============================
// src/transport/ws.rs
// ===============================
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::{StreamConnection, StreamConnector};
use crate::error::{BridgeError, Result};

/// WebSocket connector for one fixed endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Rejects a malformed URL up front instead of on every reconnect.
    pub fn new(url: &str) -> Result<Self> {
        Url::parse(url).map_err(|e| BridgeError::ConnectionFailed(format!("bad ws url {url}: {e}")))?;
        Ok(Self { url: url.to_string() })
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        info!(url = %self.url, "ws connecting");
        let (ws, _resp) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("{}: {e}", self.url)))?;
        Ok(Box::new(WsConnection { ws }))
    }
}

pub struct WsConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send(&mut self, frame: &str) -> Result<()> {
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("ws send: {e}")))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        // StreamExt::next is cancel-safe
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Text(t)) => return Ok(Some(t)),
                Ok(Message::Binary(b)) => {
                    return String::from_utf8(b)
                        .map(Some)
                        .map_err(|e| BridgeError::Decode(format!("binary frame is not utf-8: {e}")))
                }
                Ok(Message::Close(reason)) => {
                    debug!(?reason, "ws close frame");
                    return Ok(None);
                }
                // pong replies are queued by tungstenite; surface as keep-alive
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => return Ok(Some(String::new())),
                Ok(_) => continue,
                Err(e) => return Err(BridgeError::ConnectionFailed(format!("ws read: {e}"))),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
