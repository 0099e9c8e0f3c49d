// ===============================
// src/transport/http.rs
// ===============================
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use super::{HttpRequest, HttpResponse, Method, OrderTransport};
use crate::config::HttpPolicy;
use crate::error::{BridgeError, Result};

/// reqwest-backed transport with the broker's timeout and pacing.
/// Calls are spaced by `min_interval`; a call past its deadline fails with
/// `Transport` and is not retried here.
pub struct ReqwestTransport {
    http: reqwest::Client,
    policy: HttpPolicy,
    last_call: Mutex<Option<Instant>>,
}

impl ReqwestTransport {
    pub fn new(policy: HttpPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .map_err(|e| BridgeError::Transport(format!("http client: {e}")))?;
        Ok(Self { http, policy, last_call: Mutex::new(None) })
    }

    async fn pace(&self) {
        if self.policy.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.policy.min_interval {
                sleep(self.policy.min_interval - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl OrderTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.pace().await;

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut rb = self.http.request(method, &request.url);
        if !request.query.is_empty() {
            rb = rb.query(&request.query);
        }
        for (k, v) in &request.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            rb = rb.json(body);
        }

        let rsp = rb.send().await.map_err(|e| {
            if e.is_timeout() {
                BridgeError::Transport(format!("{} {} timed out after {:?}", request.method.as_str(), request.path(), self.policy.timeout))
            } else {
                BridgeError::Transport(format!("{} {}: {e}", request.method.as_str(), request.path()))
            }
        })?;
        let status = rsp.status().as_u16();
        let body = rsp
            .text()
            .await
            .map_err(|e| BridgeError::Transport(format!("reading body: {e}")))?;
        debug!(method = request.method.as_str(), path = %request.path(), status, "http call");
        Ok(HttpResponse { status, body })
    }
}
