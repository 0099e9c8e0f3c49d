// ===============================
// src/brokers/alpaca/client.rs
// ===============================
//
// REST plumbing shared by the adapter and the contract source:
// key headers, response classification, call metrics.
//
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::{AlpacaConfig, Credentials};
use crate::error::{BridgeError, Result};
use crate::metrics::{BROKER_CALLS, BROKER_CALL_MS};
use crate::transport::{HttpRequest, HttpResponse, Method, OrderTransport};

pub const BROKER: &str = "alpaca";

pub struct AlpacaClient {
    transport: Arc<dyn OrderTransport>,
    endpoints: AlpacaConfig,
    credentials: RwLock<Credentials>,
}

impl AlpacaClient {
    pub fn new(transport: Arc<dyn OrderTransport>, endpoints: AlpacaConfig, credentials: Credentials) -> Self {
        Self { transport, endpoints, credentials: RwLock::new(credentials) }
    }

    pub fn endpoints(&self) -> &AlpacaConfig {
        &self.endpoints
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.read().map(|c| c.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn set_credentials(&self, creds: Credentials) {
        match self.credentials.write() {
            Ok(mut g) => *g = creds,
            Err(p) => *p.into_inner() = creds,
        }
    }

    pub fn rest(&self, method: Method, path: &str) -> HttpRequest {
        HttpRequest::new(method, format!("{}{}", self.endpoints.rest_url.trim_end_matches('/'), path))
    }

    pub fn data(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{}{}", self.endpoints.data_url.trim_end_matches('/'), path))
    }

    /// Signs with the current credentials, sends, classifies.
    pub async fn call(&self, op: &str, request: HttpRequest) -> Result<String> {
        let creds = self.credentials();
        self.call_as(op, request, &creds).await
    }

    pub async fn call_as(&self, op: &str, request: HttpRequest, creds: &Credentials) -> Result<String> {
        let request = request
            .header("APCA-API-KEY-ID", creds.api_key.clone())
            .header("APCA-API-SECRET-KEY", creds.api_secret.clone())
            .header("Accept", "application/json");
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

/// 401 is an auth failure; 4xx business errors carry Alpaca's own message
/// verbatim; throttling and 5xx are transport errors the caller may retry.
pub fn classify(resp: HttpResponse) -> Result<String> {
    match resp.status {
        s if (200..300).contains(&s) => Ok(resp.body),
        401 => Err(BridgeError::AuthenticationFailed(reason(&resp.body))),
        429 => Err(BridgeError::Transport(format!("rate limited: {}", reason(&resp.body)))),
        s if s >= 500 => Err(BridgeError::Transport(format!("http {s}: {}", reason(&resp.body)))),
        _ => Err(BridgeError::BrokerRejected { reason: reason(&resp.body) }),
    }
}

fn reason(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify(HttpResponse::new(200, "{}")).unwrap(), "{}");
        assert!(matches!(
            classify(HttpResponse::new(403, r#"{"code":40310000,"message":"insufficient buying power"}"#)),
            Err(BridgeError::BrokerRejected { reason }) if reason == "insufficient buying power"
        ));
        assert!(matches!(classify(HttpResponse::new(422, "qty must be > 0")), Err(BridgeError::BrokerRejected { reason }) if reason == "qty must be > 0"));
        assert!(matches!(classify(HttpResponse::new(401, "{}")), Err(BridgeError::AuthenticationFailed(_))));
        assert!(matches!(classify(HttpResponse::new(503, "")), Err(BridgeError::Transport(_))));
        assert!(matches!(classify(HttpResponse::new(429, "")), Err(BridgeError::Transport(_))));
    }
}
