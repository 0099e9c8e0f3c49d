// ===============================
// src/transport/mock.rs
// ===============================
//
// Scripted transports for tests and dry runs:
// - MockHttpTransport : routes by (method, path), records every request
// - MockConnector     : refused connects, injected frames, forced drops,
//                       recorded outbound frames, optional auto-responder
//
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use super::{HttpRequest, HttpResponse, Method, OrderTransport, StreamConnection, StreamConnector};
use crate::error::{BridgeError, Result};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

enum Scripted {
    Reply(HttpResponse),
    Fail(String),
}

struct Route {
    method: Method,
    path: String,
    replies: VecDeque<Scripted>,
}

/// Replies are consumed in order; the last one repeats. Unknown routes get
/// a 404 with a JSON message.
#[derive(Default)]
pub struct MockHttpTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, reply: Scripted) {
        let mut routes = lock(&self.routes);
        match routes.iter_mut().find(|r| r.method == method && r.path == path) {
            Some(r) => r.replies.push_back(reply),
            None => routes.push(Route { method, path: path.to_string(), replies: VecDeque::from([reply]) }),
        }
    }

    pub fn on(&self, method: Method, path: &str, status: u16, body: impl Into<String>) -> &Self {
        self.push(method, path, Scripted::Reply(HttpResponse::new(status, body)));
        self
    }

    pub fn on_json(&self, method: Method, path: &str, status: u16, body: serde_json::Value) -> &Self {
        self.on(method, path, status, body.to_string())
    }

    /// Network-level failure (e.g. a timeout).
    pub fn fail(&self, method: Method, path: &str, reason: &str) -> &Self {
        self.push(method, path, Scripted::Fail(reason.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self, method: Method, path: &str) -> usize {
        lock(&self.requests).iter().filter(|r| r.method == method && r.path() == path).count()
    }

    pub fn last_request(&self, method: Method, path: &str) -> Option<HttpRequest> {
        lock(&self.requests).iter().rev().find(|r| r.method == method && r.path() == path).cloned()
    }
}

#[async_trait]
impl OrderTransport for MockHttpTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let path = request.path().to_string();
        let method = request.method;
        lock(&self.requests).push(request);

        let mut routes = lock(&self.routes);
        let Some(route) = routes.iter_mut().find(|r| r.method == method && r.path == path) else {
            return Ok(HttpResponse::new(404, format!(r#"{{"message":"no mock route for {} {}"}}"#, method.as_str(), path)));
        };
        let reply = if route.replies.len() > 1 { route.replies.pop_front() } else { None };
        let reply = match &reply {
            Some(r) => r,
            None => match route.replies.front() {
                Some(r) => r,
                None => return Ok(HttpResponse::new(404, "{}")),
            },
        };
        match reply {
            Scripted::Reply(r) => Ok(r.clone()),
            Scripted::Fail(reason) => Err(BridgeError::Transport(reason.clone())),
        }
    }
}

enum Inbound {
    Frame(String),
    Drop,
}

type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

#[derive(Default)]
struct ConnectorState {
    attempts: u32,
    fail_next: u32,
    refuse_all: bool,
    sessions: Vec<MockSession>,
}

/// Each successful `connect()` creates a `MockSession` the test can drive.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    responder: Option<Responder>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames returned by `responder` are delivered as inbound frames right
    /// after the matching `send` (e.g. handshake acks).
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        Self { state: Arc::default(), responder: Some(Arc::new(responder)) }
    }

    pub fn fail_next(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    pub fn refuse_all(&self, on: bool) {
        lock(&self.state).refuse_all = on;
    }

    /// Every call to `connect()`, refused ones included.
    pub fn attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn session(&self, i: usize) -> Option<MockSession> {
        lock(&self.state).sessions.get(i).cloned()
    }

    pub fn latest(&self) -> Option<MockSession> {
        lock(&self.state).sessions.last().cloned()
    }

    /// Waits until at least `n` sessions were opened; returns the n-th.
    pub async fn wait_for_session(&self, n: usize, within: Duration) -> Option<MockSession> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(s) = self.session(n.saturating_sub(1)) {
                if self.session_count() >= n {
                    return Some(s);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        let mut st = lock(&self.state);
        st.attempts += 1;
        if st.refuse_all {
            return Err(BridgeError::ConnectionFailed("mock: connection refused".into()));
        }
        if st.fail_next > 0 {
            st.fail_next -= 1;
            return Err(BridgeError::ConnectionFailed("mock: connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let session = MockSession { tx: tx.clone(), sent: Arc::default(), closed: Arc::default() };
        st.sessions.push(session.clone());
        Ok(Box::new(MockConnection { rx, session, responder: self.responder.clone() }))
    }
}

/// Test-side handle on one mock connection.
#[derive(Clone)]
pub struct MockSession {
    tx: mpsc::UnboundedSender<Inbound>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockSession {
    /// Delivers one inbound frame, as if the broker sent it.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.tx.send(Inbound::Frame(frame.into()));
    }

    /// Breaks the connection from the broker side.
    pub fn drop_connection(&self) {
        let _ = self.tx.send(Inbound::Drop);
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn sent_matching(&self, needle: &str) -> usize {
        lock(&self.sent).iter().filter(|f| f.contains(needle)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_sent(&self, needle: &str, count: usize, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if self.sent_matching(needle) >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

struct MockConnection {
    rx: mpsc::UnboundedReceiver<Inbound>,
    session: MockSession,
    responder: Option<Responder>,
}

#[async_trait]
impl StreamConnection for MockConnection {
    async fn send(&mut self, frame: &str) -> Result<()> {
        if self.session.is_closed() {
            return Err(BridgeError::ConnectionFailed("mock: send on closed connection".into()));
        }
        lock(&self.session.sent).push(frame.to_string());
        if let Some(responder) = &self.responder {
            for reply in responder(frame) {
                let _ = self.session.tx.send(Inbound::Frame(reply));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.rx.recv().await {
            Some(Inbound::Frame(f)) => Ok(Some(f)),
            Some(Inbound::Drop) => {
                self.session.closed.store(true, Ordering::SeqCst);
                Err(BridgeError::ConnectionFailed("mock: connection reset".into()))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.session.closed.store(true, Ordering::SeqCst);
    }
}
