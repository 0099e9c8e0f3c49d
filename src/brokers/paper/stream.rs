// ===============================
// src/brokers/paper/stream.rs
// ===============================
//
// One feed connection carries market data (l / q / d) and order events.
// Handshake: c (session) -> ck, then o (order events) -> ok.
//
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::client::PaperClient;
use super::transform::order_update_from;
use super::types::{PaperCommand, PaperFrame, PaperLevel};
use crate::domain::{Depth, DepthLevel, LtpTick, Quote, StreamEvent, Subscription, SubscriptionMode};
use crate::error::{BridgeError, Result};
use crate::stream::protocol::recv_json;
use crate::stream::StreamProtocol;
use crate::symbols::SymbolCache;
use crate::transform::BrokerVocabulary;
use crate::transport::StreamConnection;

const DEFAULT_DEPTH: u8 = 5;

fn mode_code(mode: SubscriptionMode) -> &'static str {
    match mode {
        SubscriptionMode::Ltp => "l",
        SubscriptionMode::Quote => "q",
        SubscriptionMode::Depth => "d",
    }
}

fn encode(cmd: &PaperCommand) -> Result<String> {
    Ok(serde_json::to_string(cmd)?)
}

pub struct PaperProtocol {
    client: Arc<PaperClient>,
    contracts: Arc<SymbolCache>,
    vocab: Arc<BrokerVocabulary>,
}

impl PaperProtocol {
    pub fn new(client: Arc<PaperClient>, contracts: Arc<SymbolCache>, vocab: Arc<BrokerVocabulary>) -> Self {
        Self { client, contracts, vocab }
    }

    async fn next_frame(conn: &mut dyn StreamConnection) -> Result<PaperFrame> {
        Ok(serde_json::from_value(recv_json(conn).await?)?)
    }

    /// One command per mode, keys joined with '#'.
    fn frames(subs: &[Subscription], subscribe: bool) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for mode in [SubscriptionMode::Ltp, SubscriptionMode::Quote, SubscriptionMode::Depth] {
            let group: Vec<&Subscription> = subs.iter().filter(|s| s.key.mode == mode).collect();
            if group.is_empty() {
                continue;
            }
            let k = group
                .iter()
                .map(|s| format!("{}|{}", s.instrument.broker_exchange, s.instrument.broker_token))
                .collect::<Vec<_>>()
                .join("#");
            let m = mode_code(mode).to_string();
            let cmd = if subscribe {
                let lv = group.iter().map(|s| s.depth_level).max().filter(|l| *l > 0).unwrap_or(DEFAULT_DEPTH);
                PaperCommand::Subscribe { m, k, lv }
            } else {
                PaperCommand::Unsubscribe { m, k }
            };
            out.push(encode(&cmd)?);
        }
        Ok(out)
    }

    fn canonical(&self, token: &str, exch: &str) -> Option<(String, String)> {
        match self.contracts.resolve_to_canonical(token, exch) {
            Ok(pair) => Some(pair),
            Err(e) => {
                debug!(broker = "paper", token, exch, error = %e, "feed frame for unmapped token");
                None
            }
        }
    }
}

#[async_trait]
impl StreamProtocol for PaperProtocol {
    fn label(&self) -> &str {
        "market"
    }

    fn supports(&self, _mode: SubscriptionMode) -> bool {
        true
    }

    async fn handshake(&self, conn: &mut dyn StreamConnection) -> Result<()> {
        let Some((uid, susertoken)) = self.client.session() else {
            return Err(BridgeError::AuthenticationFailed("paper: no session, authenticate first".into()));
        };
        conn.send(&encode(&PaperCommand::Connect { uid: uid.clone(), susertoken })?).await?;
        loop {
            match Self::next_frame(conn).await? {
                PaperFrame::ConnectAck { s } if s.eq_ignore_ascii_case("ok") => break,
                PaperFrame::ConnectAck { s } => {
                    return Err(BridgeError::AuthenticationFailed(format!("paper feed login: {s}")))
                }
                PaperFrame::Error { emsg } => return Err(BridgeError::ConnectionFailed(emsg)),
                _ => {}
            }
        }
        conn.send(&encode(&PaperCommand::Orders { uid })?).await?;
        loop {
            match Self::next_frame(conn).await? {
                PaperFrame::OrdersAck { .. } => return Ok(()),
                PaperFrame::Error { emsg } => return Err(BridgeError::ConnectionFailed(emsg)),
                _ => {}
            }
        }
    }

    fn subscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>> {
        Self::frames(subs, true)
    }

    fn unsubscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>> {
        Self::frames(subs, false)
    }

    fn decode(&self, frame: &str) -> Result<Vec<StreamEvent>> {
        let ev = match serde_json::from_str::<PaperFrame>(frame)? {
            PaperFrame::Ltp { e, tk, lp, v, ft } => self.canonical(&tk, &e).map(|(symbol, exchange)| {
                StreamEvent::Ltp(LtpTick { symbol, exchange, ltp: lp, quantity: v, timestamp: Some(ft) })
            }),
            PaperFrame::Quote { e, tk, lp, bp1, bq1, sp1, sq1, o, h, l, c, v, ft } => {
                self.canonical(&tk, &e).map(|(symbol, exchange)| {
                    StreamEvent::Quote(Quote {
                        symbol,
                        exchange,
                        ltp: Some(lp),
                        bid: Some(bp1),
                        ask: Some(sp1),
                        bid_qty: bq1,
                        ask_qty: sq1,
                        open: Some(o),
                        high: Some(h),
                        low: Some(l),
                        prev_close: Some(c),
                        volume: v,
                        timestamp: Some(ft),
                    })
                })
            }
            PaperFrame::Depth { e, tk, bids, asks, ft } => self.canonical(&tk, &e).map(|(symbol, exchange)| {
                let levels = |side: Vec<PaperLevel>| -> Vec<DepthLevel> {
                    side.into_iter().map(|l| DepthLevel { price: l.p, quantity: l.q }).collect()
                };
                StreamEvent::Depth(Depth { symbol, exchange, bids: levels(bids), asks: levels(asks), timestamp: Some(ft) })
            }),
            PaperFrame::Order(ev) => Some(StreamEvent::OrderUpdate(order_update_from(&ev, &self.contracts, &self.vocab)?)),
            PaperFrame::Error { emsg } => {
                warn!(broker = "paper", %emsg, "feed error frame");
                None
            }
            PaperFrame::ConnectAck { .. }
            | PaperFrame::OrdersAck { .. }
            | PaperFrame::SubscribeAck { .. }
            | PaperFrame::UnsubscribeAck { .. } => None,
        };
        Ok(ev.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::paper::exchange::PaperExchange;
    use crate::brokers::paper::transform::vocabulary;
    use crate::domain::{BrokerInstrument, SubscriptionKey};
    use crate::symbols::ContractEntry;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn protocol() -> PaperProtocol {
        let exchange = Arc::new(PaperExchange::new(dec!(1000), "", Duration::ZERO));
        let client = Arc::new(PaperClient::new(exchange, "paper://venue"));
        let cache = Arc::new(SymbolCache::new("paper"));
        cache.replace(vec![ContractEntry::equity("AAPL", "NASDAQ", "AAPL-EQ", "NSQ", "1001")]).unwrap();
        PaperProtocol::new(client, cache, Arc::new(vocabulary().unwrap()))
    }

    fn sub(mode: SubscriptionMode, depth_level: u8) -> Subscription {
        Subscription {
            key: SubscriptionKey::new("AAPL", "NASDAQ", mode),
            depth_level,
            instrument: BrokerInstrument {
                broker_symbol: "AAPL-EQ".into(),
                broker_token: "1001".into(),
                broker_exchange: "NSQ".into(),
            },
        }
    }

    #[test]
    fn one_command_per_mode() {
        let p = protocol();
        let frames = p.subscribe_frames(&[sub(SubscriptionMode::Depth, 0), sub(SubscriptionMode::Ltp, 0)]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], r#"{"t":"s","m":"l","k":"NSQ|1001","lv":5}"#);
        assert_eq!(frames[1], r#"{"t":"s","m":"d","k":"NSQ|1001","lv":5}"#);
        let un = p.unsubscribe_frames(&[sub(SubscriptionMode::Quote, 0)]).unwrap();
        assert_eq!(un, vec![r#"{"t":"u","m":"q","k":"NSQ|1001"}"#.to_string()]);
    }

    #[test]
    fn frames_decode_by_token() {
        let p = protocol();
        let ev = p.decode(r#"{"t":"lf","e":"NSQ","tk":"1001","lp":"190.25","v":7,"ft":"2024-03-01T15:30:00Z"}"#).unwrap();
        match &ev[..] {
            [StreamEvent::Ltp(t)] => assert_eq!((t.symbol.as_str(), t.ltp, t.quantity), ("AAPL", dec!(190.25), 7)),
            other => panic!("unexpected {other:?}"),
        }
        let depth = p
            .decode(r#"{"t":"df","e":"NSQ","tk":"1001","bids":[{"p":"190.24","q":100}],"asks":[{"p":"190.26","q":100}],"ft":"2024-03-01T15:30:00Z"}"#)
            .unwrap();
        assert!(matches!(&depth[..], [StreamEvent::Depth(d)] if d.bids[0].price == dec!(190.24)));
        assert!(p.decode(r#"{"t":"lf","e":"NSQ","tk":"9999","lp":"1","v":1,"ft":"2024-03-01T15:30:00Z"}"#).unwrap().is_empty());
        assert!(p.decode(r#"{"t":"sk","m":"l","k":"NSQ|1001"}"#).unwrap().is_empty());
    }
}
