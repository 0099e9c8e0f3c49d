// ===============================
// src/brokers/alpaca/stream.rs
// ===============================
//
// Two persistent connections:
// - market data (v2 iex/sip): trades -> LTP, quotes -> QUOTE, no depth
// - trading (trade_updates): account order updates
//
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::client::AlpacaClient;
use super::transform::order_update_from;
use super::types::{StreamMessage, TradeUpdate, TradingEnvelope};
use crate::domain::{LtpTick, Quote, StreamEvent, Subscription, SubscriptionMode};
use crate::error::{BridgeError, Result};
use crate::metrics::STREAM_DECODE_ERRORS;
use crate::stream::protocol::recv_json;
use crate::stream::StreamProtocol;
use crate::symbols::SymbolCache;
use crate::transform::BrokerVocabulary;
use crate::transport::StreamConnection;

/// Market-data frames are arrays of messages; accept a bare object too.
/// A message that does not parse is skipped, the rest of the batch is kept.
fn messages(v: Value) -> Vec<StreamMessage> {
    let items = match v {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|m| match serde_json::from_value(m) {
            Ok(msg) => Some(msg),
            Err(e) => {
                STREAM_DECODE_ERRORS.with_label_values(&["alpaca", "market"]).inc();
                warn!(broker = "alpaca", error = %e, "market message skipped");
                None
            }
        })
        .collect()
}

fn control_error(m: &StreamMessage) -> BridgeError {
    let text = format!("{} (code {})", m.msg.as_deref().unwrap_or("error"), m.code.unwrap_or_default());
    match m.code {
        Some(401) | Some(402) => BridgeError::AuthenticationFailed(text),
        _ => BridgeError::ConnectionFailed(text),
    }
}

pub struct MarketDataProtocol {
    client: Arc<AlpacaClient>,
    contracts: Arc<SymbolCache>,
}

impl MarketDataProtocol {
    pub fn new(client: Arc<AlpacaClient>, contracts: Arc<SymbolCache>) -> Self {
        Self { client, contracts }
    }

    /// Reads until a success message with `expected`, failing on an error one.
    async fn expect_success(&self, conn: &mut dyn StreamConnection, expected: &str) -> Result<()> {
        loop {
            for m in messages(recv_json(conn).await?) {
                match m.kind.as_str() {
                    "success" if m.msg.as_deref() == Some(expected) => return Ok(()),
                    "error" => return Err(control_error(&m)),
                    _ => {}
                }
            }
        }
    }

    fn frame(action: &str, subs: &[Subscription]) -> Vec<String> {
        let pick = |mode: SubscriptionMode| -> Vec<&str> {
            subs.iter()
                .filter(|s| s.key.mode == mode)
                .map(|s| s.instrument.broker_symbol.as_str())
                .collect()
        };
        let trades = pick(SubscriptionMode::Ltp);
        let quotes = pick(SubscriptionMode::Quote);
        if trades.is_empty() && quotes.is_empty() {
            return Vec::new();
        }
        vec![json!({ "action": action, "trades": trades, "quotes": quotes }).to_string()]
    }
}

#[async_trait]
impl StreamProtocol for MarketDataProtocol {
    fn label(&self) -> &str {
        "market"
    }

    fn supports(&self, mode: SubscriptionMode) -> bool {
        matches!(mode, SubscriptionMode::Ltp | SubscriptionMode::Quote)
    }

    async fn handshake(&self, conn: &mut dyn StreamConnection) -> Result<()> {
        self.expect_success(conn, "connected").await?;
        let creds = self.client.credentials();
        let auth = json!({ "action": "auth", "key": creds.api_key, "secret": creds.api_secret });
        conn.send(&auth.to_string()).await?;
        self.expect_success(conn, "authenticated").await
    }

    fn subscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>> {
        Ok(Self::frame("subscribe", subs))
    }

    fn unsubscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>> {
        Ok(Self::frame("unsubscribe", subs))
    }

    fn decode(&self, frame: &str) -> Result<Vec<StreamEvent>> {
        let mut out = Vec::new();
        for m in messages(serde_json::from_str(frame)?) {
            let Some(sym) = m.symbol.as_deref() else {
                if m.kind == "error" {
                    warn!(broker = "alpaca", error = %control_error(&m), "market stream error message");
                }
                continue;
            };
            let (symbol, exchange) = match self.contracts.resolve_broker_symbol(sym) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(broker = "alpaca", symbol = sym, error = %e, "stream message for unmapped symbol");
                    continue;
                }
            };
            match m.kind.as_str() {
                "t" => {
                    let Some(ltp) = m.p else { continue };
                    out.push(StreamEvent::Ltp(LtpTick { symbol, exchange, ltp, quantity: m.s, timestamp: m.t }));
                }
                "q" => out.push(StreamEvent::Quote(Quote {
                    symbol,
                    exchange,
                    bid: m.bp,
                    ask: m.ap,
                    bid_qty: m.bs,
                    ask_qty: m.as_,
                    timestamp: m.t,
                    ..Quote::default()
                })),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Account channel; nothing to subscribe, `listen` happens in the handshake.
pub struct TradingProtocol {
    client: Arc<AlpacaClient>,
    contracts: Arc<SymbolCache>,
    vocab: Arc<BrokerVocabulary>,
}

impl TradingProtocol {
    pub fn new(client: Arc<AlpacaClient>, contracts: Arc<SymbolCache>, vocab: Arc<BrokerVocabulary>) -> Self {
        Self { client, contracts, vocab }
    }

    async fn expect(&self, conn: &mut dyn StreamConnection, stream: &str) -> Result<Value> {
        loop {
            let env: TradingEnvelope = serde_json::from_value(recv_json(conn).await?)?;
            if env.stream == stream {
                return Ok(env.data);
            }
        }
    }
}

#[async_trait]
impl StreamProtocol for TradingProtocol {
    fn label(&self) -> &str {
        "orders"
    }

    fn supports(&self, _mode: SubscriptionMode) -> bool {
        false
    }

    async fn handshake(&self, conn: &mut dyn StreamConnection) -> Result<()> {
        let creds = self.client.credentials();
        let auth = json!({
            "action": "authenticate",
            "data": { "key_id": creds.api_key, "secret_key": creds.api_secret }
        });
        conn.send(&auth.to_string()).await?;
        let data = self.expect(conn, "authorization").await?;
        if data.get("status").and_then(Value::as_str) != Some("authorized") {
            return Err(BridgeError::AuthenticationFailed(format!("trading stream: {data}")));
        }
        conn.send(&json!({ "action": "listen", "data": { "streams": ["trade_updates"] } }).to_string())
            .await?;
        self.expect(conn, "listening").await?;
        Ok(())
    }

    fn subscribe_frames(&self, _subs: &[Subscription]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn unsubscribe_frames(&self, _subs: &[Subscription]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn decode(&self, frame: &str) -> Result<Vec<StreamEvent>> {
        let env: TradingEnvelope = serde_json::from_str(frame)?;
        if env.stream != "trade_updates" {
            return Ok(Vec::new());
        }
        let update: TradeUpdate = serde_json::from_value(env.data)?;
        let ev = order_update_from(&update, &self.contracts, &self.vocab)?;
        Ok(vec![StreamEvent::OrderUpdate(ev)])
    }
}
