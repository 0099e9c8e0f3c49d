// ===============================
// src/brokers/paper/client.rs
// ===============================
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::exchange::SESSION_HEADER;
use super::types::PaperReply;
use crate::error::{BridgeError, Result};
use crate::metrics::{BROKER_CALLS, BROKER_CALL_MS};
use crate::transport::{HttpRequest, HttpResponse, Method, OrderTransport};

pub const BROKER: &str = "paper";

/// REST side of the paper venue. Holds the session (uid, susertoken)
/// issued at login; the feed handshake reuses it.
pub struct PaperClient {
    transport: Arc<dyn OrderTransport>,
    base_url: String,
    session: RwLock<Option<(String, String)>>,
}

impl PaperClient {
    pub fn new(transport: Arc<dyn OrderTransport>, base_url: &str) -> Self {
        Self { transport, base_url: base_url.trim_end_matches('/').to_string(), session: RwLock::new(None) }
    }

    pub fn session(&self) -> Option<(String, String)> {
        self.session.read().map(|s| s.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn set_session(&self, uid: &str, token: &str) {
        let value = Some((uid.to_string(), token.to_string()));
        match self.session.write() {
            Ok(mut g) => *g = value,
            Err(p) => *p.into_inner() = value,
        }
    }

    pub fn uid(&self) -> String {
        self.session().map(|(uid, _)| uid).unwrap_or_default()
    }

    pub fn request(&self, method: Method, path: &str) -> HttpRequest {
        let req = HttpRequest::new(method, format!("{}{}", self.base_url, path));
        match self.session() {
            Some((_, token)) => req.header(SESSION_HEADER, token),
            None => req,
        }
    }

    pub async fn call(&self, op: &str, request: HttpRequest) -> Result<String> {
        debug!(broker = BROKER, op, method = request.method.as_str(), path = %request.path(), "rest call");
        let t0 = Instant::now();
        let outcome = self.transport.execute(request).await;
        BROKER_CALL_MS
            .with_label_values(&[BROKER, op])
            .observe(t0.elapsed().as_secs_f64() * 1000.0);

        let result = outcome.and_then(classify);
        let label = match &result {
            Ok(_) => "ok",
            Err(BridgeError::BrokerRejected { .. }) => "rejected",
            Err(BridgeError::AuthenticationFailed(_)) => "auth",
            Err(_) => "error",
        };
        BROKER_CALLS.with_label_values(&[BROKER, op, label]).inc();
        if let Err(e) = &result {
            warn!(broker = BROKER, op, error = %e, "rest call failed");
        }
        result
    }

    pub async fn call_json<T: DeserializeOwned>(&self, op: &str, request: HttpRequest) -> Result<T> {
        let body = self.call(op, request).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// `stat: Not_Ok` is a rejection even under a 2xx; `emsg` is kept verbatim.
pub fn classify(resp: HttpResponse) -> Result<String> {
    let emsg = || {
        serde_json::from_str::<PaperReply>(&resp.body)
            .ok()
            .and_then(|r| r.emsg)
            .unwrap_or_else(|| resp.body.trim().to_string())
    };
    match resp.status {
        s if (200..300).contains(&s) => match serde_json::from_str::<PaperReply>(&resp.body) {
            Ok(r) if !r.is_ok() => Err(BridgeError::BrokerRejected { reason: r.emsg.unwrap_or(r.stat) }),
            _ => Ok(resp.body),
        },
        401 => Err(BridgeError::AuthenticationFailed(emsg())),
        429 => Err(BridgeError::Transport(format!("rate limited: {}", emsg()))),
        s if s >= 500 => Err(BridgeError::Transport(format!("http {s}: {}", emsg()))),
        _ => Err(BridgeError::BrokerRejected { reason: emsg() }),
    }
}
