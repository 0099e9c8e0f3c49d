// ===============================
// src/transport/mod.rs
// ===============================
//
// Network collaborators. Adapters shape payloads and parse responses; the
// actual I/O sits behind these traits:
// - OrderTransport   : one request in, raw status + body out
// - StreamConnector  : opens a persistent connection
// - StreamConnection : send / cancel-safe recv / close on that connection
//
pub mod http;
pub mod mock;
pub mod ws;

use async_trait::async_trait;

use crate::error::Result;

pub use http::ReqwestTransport;
pub use ws::WsConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self { method, url: url.into(), query: Vec::new(), headers: Vec::new(), body: None }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn query(mut self, k: &str, v: impl Into<String>) -> Self {
        self.query.push((k.to_string(), v.into()));
        self
    }

    pub fn header(mut self, k: &str, v: impl Into<String>) -> Self {
        self.headers.push((k.to_string(), v.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header_value(&self, k: &str) -> Option<&str> {
        self.headers.iter().find(|(hk, _)| hk.eq_ignore_ascii_case(k)).map(|(_, v)| v.as_str())
    }

    pub fn query_value(&self, k: &str) -> Option<&str> {
        self.query.iter().find(|(qk, _)| qk == k).map(|(_, v)| v.as_str())
    }

    /// Path part of `url` (scheme and host stripped).
    pub fn path(&self) -> &str {
        let rest = self.url.split_once("://").map(|(_, r)| r).unwrap_or(&self.url);
        let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
        path.split('?').next().unwrap_or(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A timeout or network failure is `Transport`; non-2xx is NOT an error
/// here, classification belongs to the adapter.
#[async_trait]
pub trait OrderTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>>;
}

#[async_trait]
pub trait StreamConnection: Send {
    async fn send(&mut self, frame: &str) -> Result<()>;

    /// Next text frame; `Ok(None)` when the peer closed. An empty string is
    /// a keep-alive (ping/pong). Cancel-safe: it is raced against commands
    /// and timeouts.
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_strips_host_and_query() {
        let r = HttpRequest::get("https://paper-api.alpaca.markets/v2/orders?status=all");
        assert_eq!(r.path(), "/v2/orders");
        assert_eq!(HttpRequest::get("paper://venue").path(), "/");
        assert_eq!(HttpRequest::get("paper://venue/orders/7").path(), "/orders/7");
    }
}
