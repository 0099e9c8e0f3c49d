// ===============================
// src/stream/protocol.rs
// ===============================
use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{StreamEvent, Subscription, SubscriptionMode};
use crate::error::{BridgeError, Result};
use crate::transport::StreamConnection;

/// Broker wire protocol for one persistent connection. The connection
/// manager owns lifecycle and bookkeeping; the protocol only shapes and
/// reads frames.
#[async_trait]
pub trait StreamProtocol: Send + Sync {
    /// Connection label used in logs and metrics ("market", "orders", ...).
    fn label(&self) -> &str;

    fn supports(&self, mode: SubscriptionMode) -> bool;

    /// Auth / login / listen frames. Runs under the handshake timeout.
    async fn handshake(&self, conn: &mut dyn StreamConnection) -> Result<()>;

    fn subscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>>;

    fn unsubscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>>;

    /// One inbound frame to zero or more normalized events.
    fn decode(&self, frame: &str) -> Result<Vec<StreamEvent>>;
}

/// Next non-keepalive frame parsed as JSON; a closed connection during a
/// handshake is a `ConnectionFailed`.
pub async fn recv_json(conn: &mut dyn StreamConnection) -> Result<Value> {
    loop {
        match conn.recv().await? {
            Some(frame) if frame.is_empty() => continue,
            Some(frame) => return Ok(serde_json::from_str(&frame)?),
            None => return Err(BridgeError::ConnectionFailed("closed during handshake".into())),
        }
    }
}
