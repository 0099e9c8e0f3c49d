// ===============================
// src/brokers/paper/exchange.rs
// ===============================
//
// In-process front door of the simulated venue. Implements the same
// transport traits as the network stack, so the adapter goes through the
// full encode / classify / decode path:
// - OrderTransport  : REST-style routes under paper://venue
// - StreamConnector : feed connections (commands in, frames out)
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::types::{PaperLogin, PaperModifyRequest, PaperOrderRequest, PaperReply};
use super::venue::{Inbound, Reject, Venue};
use crate::error::{BridgeError, Result};
use crate::transport::{HttpRequest, HttpResponse, Method, OrderTransport, StreamConnection, StreamConnector};

pub const SESSION_HEADER: &str = "x-susertoken";

fn lock(m: &Mutex<Venue>) -> MutexGuard<'_, Venue> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn reply<T: Serialize>(status: u16, body: &T) -> HttpResponse {
    match serde_json::to_string(body) {
        Ok(s) => HttpResponse::new(status, s),
        Err(e) => HttpResponse::new(500, format!(r#"{{"stat":"Not_Ok","emsg":"{e}"}}"#)),
    }
}

fn rejected((status, emsg): Reject) -> HttpResponse {
    reply(status, &PaperReply::not_ok(emsg))
}

fn body<T: DeserializeOwned>(req: &HttpRequest) -> std::result::Result<T, Reject> {
    let v = req.body.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(v).map_err(|e| (400, format!("Invalid Input : {e}")))
}

/// Shared handle; clones talk to the same venue.
#[derive(Clone)]
pub struct PaperExchange {
    venue: Arc<Mutex<Venue>>,
    tick_interval: Duration,
    ticker: Arc<AtomicBool>,
}

impl PaperExchange {
    /// An empty `password` accepts any password at login.
    pub fn new(starting_cash: Decimal, password: &str, tick_interval: Duration) -> Self {
        Self {
            venue: Arc::new(Mutex::new(Venue::new(starting_cash, password))),
            tick_interval,
            ticker: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Moves a price by hand (tests, demos). Returns false for unknown
    /// instruments.
    pub fn set_price(&self, tsym_or_token: &str, px: Decimal) -> bool {
        lock(&self.venue).set_price(tsym_or_token, px, 1)
    }

    pub fn last_price(&self, tsym_or_token: &str) -> Option<Decimal> {
        lock(&self.venue).last_price(tsym_or_token)
    }

    /// The next `n` feed connects are refused.
    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.venue).fail_connects = n;
    }

    pub fn refuse_connects(&self, on: bool) {
        lock(&self.venue).refuse_connects = on;
    }

    /// Breaks every open feed connection from the venue side.
    pub fn drop_connections(&self) {
        lock(&self.venue).drop_feeds();
    }

    pub fn open_feeds(&self) -> usize {
        lock(&self.venue).feed_count()
    }

    /// Random-walk ticker, started on first use when an interval is set.
    /// Holds a weak handle and ends once the venue is gone.
    fn ensure_ticker(&self) {
        if self.tick_interval.is_zero() || self.ticker.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.ticker.store(false, Ordering::SeqCst);
            return;
        };
        let venue: Weak<Mutex<Venue>> = Arc::downgrade(&self.venue);
        let every = self.tick_interval;
        handle.spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(v) = venue.upgrade() else { break };
                lock(&v).random_walk(&mut rng);
            }
            debug!("paper venue: ticker stopped");
        });
        info!(interval_ms = every.as_millis() as u64, "paper venue: ticker started");
    }

    fn route(&self, req: &HttpRequest) -> HttpResponse {
        let path = req.path().trim_end_matches('/');
        let mut venue = lock(&self.venue);

        match (req.method, path) {
            (Method::Post, "/user") => {
                let login: PaperLogin = match body(req) {
                    Ok(l) => l,
                    Err(rej) => return rejected(rej),
                };
                return match venue.login(&login.uid, &login.pwd) {
                    Ok(token) => reply(
                        200,
                        &PaperReply { susertoken: Some(token), uname: Some(login.uid), ..PaperReply::ok() },
                    ),
                    Err(rej) => rejected(rej),
                };
            }
            (Method::Get, "/instruments") => return reply(200, &venue.instruments()),
            _ => {}
        }

        if let Err(rej) = venue.check_session(req.header_value(SESSION_HEADER)) {
            return rejected(rej);
        }

        let order_id = path.strip_prefix("/orders/").filter(|id| !id.is_empty() && !id.contains('/'));
        match (req.method, path, order_id) {
            (Method::Get, "/orders", _) => reply(200, &venue.orders()),
            (Method::Post, "/orders", _) => {
                let order: PaperOrderRequest = match body(req) {
                    Ok(o) => o,
                    Err(rej) => return rejected(rej),
                };
                match venue.place(order) {
                    Ok(id) => reply(200, &PaperReply { norenordno: Some(id), ..PaperReply::ok() }),
                    Err(rej) => rejected(rej),
                }
            }
            (Method::Get, _, Some(id)) => match venue.order(id) {
                Ok(o) => reply(200, &o),
                Err(rej) => rejected(rej),
            },
            (Method::Put, _, Some(id)) => {
                let changes: PaperModifyRequest = match body(req) {
                    Ok(c) => c,
                    Err(rej) => return rejected(rej),
                };
                match venue.modify(id, changes) {
                    Ok(()) => reply(200, &PaperReply { norenordno: Some(id.to_string()), ..PaperReply::ok() }),
                    Err(rej) => rejected(rej),
                }
            }
            (Method::Delete, _, Some(id)) => match venue.cancel(id) {
                Ok(()) => reply(200, &PaperReply { norenordno: Some(id.to_string()), ..PaperReply::ok() }),
                Err(rej) => rejected(rej),
            },
            (Method::Get, "/trades", _) => reply(200, &venue.fills()),
            (Method::Get, "/positions", _) => reply(200, &venue.positions()),
            (Method::Get, "/holdings", _) => reply(200, &venue.holdings()),
            (Method::Get, "/funds", _) => reply(200, &venue.funds()),
            (Method::Get, "/quotes", _) => reply(200, &venue.quotes(req.query_value("k").unwrap_or_default())),
            _ => rejected((404, format!("no route for {} {path}", req.method.as_str()))),
        }
    }
}

#[async_trait]
impl OrderTransport for PaperExchange {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.ensure_ticker();
        Ok(self.route(&request))
    }
}

#[async_trait]
impl StreamConnector for PaperExchange {
    async fn connect(&self) -> Result<Box<dyn StreamConnection>> {
        self.ensure_ticker();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = lock(&self.venue).open_feed(tx).map_err(BridgeError::ConnectionFailed)?;
        debug!(feed = id, "paper venue: feed connected");
        Ok(Box::new(PaperConnection { id, rx, venue: self.venue.clone(), closed: false }))
    }
}

struct PaperConnection {
    id: u64,
    rx: mpsc::UnboundedReceiver<Inbound>,
    venue: Arc<Mutex<Venue>>,
    closed: bool,
}

#[async_trait]
impl StreamConnection for PaperConnection {
    async fn send(&mut self, frame: &str) -> Result<()> {
        if self.closed {
            return Err(BridgeError::ConnectionFailed("paper venue: send on closed feed".into()));
        }
        lock(&self.venue).handle_command(self.id, frame);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.rx.recv().await {
            Some(Inbound::Frame(f)) => Ok(Some(f)),
            Some(Inbound::Drop) => {
                self.closed = true;
                Err(BridgeError::ConnectionFailed("paper venue: connection reset".into()))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        lock(&self.venue).close_feed(self.id);
    }
}

impl Drop for PaperConnection {
    fn drop(&mut self) {
        lock(&self.venue).close_feed(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn exchange() -> PaperExchange {
        PaperExchange::new(dec!(100000), "pw", Duration::ZERO)
    }

    async fn login(x: &PaperExchange) -> String {
        let req = HttpRequest::new(Method::Post, "paper://venue/user").json(json!({"uid": "U1", "pwd": "pw"}));
        let r = x.execute(req).await.unwrap();
        let rep: PaperReply = serde_json::from_str(&r.body).unwrap();
        rep.susertoken.unwrap()
    }

    #[tokio::test]
    async fn wrong_password_and_missing_session_are_401() {
        let x = exchange();
        let req = HttpRequest::new(Method::Post, "paper://venue/user").json(json!({"uid": "U1", "pwd": "nope"}));
        let r = x.execute(req).await.unwrap();
        assert_eq!(r.status, 401);
        assert!(r.body.contains("Wrong Password"));

        let r = x.execute(HttpRequest::get("paper://venue/orders")).await.unwrap();
        assert_eq!(r.status, 401);
        assert_eq!(x.execute(HttpRequest::get("paper://venue/instruments")).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn order_round_trip_over_routes() {
        let x = exchange();
        let token = login(&x).await;
        let place = HttpRequest::new(Method::Post, "paper://venue/orders")
            .header(SESSION_HEADER, token.clone())
            .json(json!({"uid": "U1", "exch": "NSQ", "tsym": "AAPL-EQ", "qty": "5", "prc": "180.00",
                         "prd": "C", "trantype": "B", "prctyp": "LMT", "ret": "DAY"}));
        let r = x.execute(place).await.unwrap();
        assert_eq!(r.status, 200, "{}", r.body);
        let id = serde_json::from_str::<PaperReply>(&r.body).unwrap().norenordno.unwrap();

        let cancel = HttpRequest::new(Method::Delete, format!("paper://venue/orders/{id}")).header(SESSION_HEADER, token.clone());
        assert_eq!(x.execute(cancel.clone()).await.unwrap().status, 200);
        let again = x.execute(cancel).await.unwrap();
        assert_eq!(again.status, 400);
        assert!(again.body.contains("CANCELED"));
    }

    #[tokio::test]
    async fn feed_connects_can_be_refused_and_dropped() {
        let x = exchange();
        x.fail_next_connects(1);
        assert!(x.connect().await.is_err());
        let mut conn = x.connect().await.unwrap();
        assert_eq!(x.open_feeds(), 1);
        x.drop_connections();
        assert!(conn.recv().await.is_err());
        assert_eq!(x.open_feeds(), 0);
    }
}
