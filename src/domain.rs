// ===============================
// src/domain.rs
// ===============================
//
// Canonical, broker-agnostic model. Every adapter translates to and from
// these types; nothing here knows about a particular broker.
//
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Closed set of canonical enum values with a stable wire name.
/// Broker vocabulary tables are checked against `ALL` when they are built.
pub trait CanonicalCode: Copy + Eq + std::fmt::Debug + 'static {
    const ALL: &'static [Self];
    fn as_str(&self) -> &'static str;

    fn position(&self) -> usize {
        Self::ALL.iter().position(|v| v == self).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
}
impl CanonicalCode for Side {
    const ALL: &'static [Self] = &[Side::Buy, Side::Sell];
    fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType { Market, Limit, Stop, StopLimit }
impl OrderType {
    pub fn needs_price(&self) -> bool { matches!(self, OrderType::Limit | OrderType::StopLimit) }
    pub fn needs_trigger(&self) -> bool { matches!(self, OrderType::Stop | OrderType::StopLimit) }
}
impl CanonicalCode for OrderType {
    const ALL: &'static [Self] = &[OrderType::Market, OrderType::Limit, OrderType::Stop, OrderType::StopLimit];
    fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Stop => "STOP",
            OrderType::StopLimit => "STOP_LIMIT",
        }
    }
}

/// CNC = cash & carry (delivery), MIS = intraday margin, NRML = carry-forward margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType { Cnc, Mis, Nrml }
impl CanonicalCode for ProductType {
    const ALL: &'static [Self] = &[ProductType::Cnc, ProductType::Mis, ProductType::Nrml];
    fn as_str(&self) -> &'static str {
        match self { ProductType::Cnc => "CNC", ProductType::Mis => "MIS", ProductType::Nrml => "NRML" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity { Day, Gtc, Ioc, Fok }
impl CanonicalCode for Validity {
    const ALL: &'static [Self] = &[Validity::Day, Validity::Gtc, Validity::Ioc, Validity::Fok];
    fn as_str(&self) -> &'static str {
        match self { Validity::Day => "DAY", Validity::Gtc => "GTC", Validity::Ioc => "IOC", Validity::Fok => "FOK" }
    }
}

/// Canonical order status. `Unmapped` carries an upper-cased broker status
/// nobody has mapped yet; it is passed through instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus { Pending, Open, Complete, Cancelled, Rejected, Unmapped(String) }
impl OrderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::Complete => "COMPLETE",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unmapped(raw) => raw,
        }
    }
    pub fn is_unmapped(&self) -> bool { matches!(self, OrderStatus::Unmapped(_)) }
    /// Still working at the broker (cancellable).
    pub fn is_working(&self) -> bool { matches!(self, OrderStatus::Pending | OrderStatus::Open) }
}
impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Desired order state as the application expresses it. Never mutated
/// after submission; a modify sends a new `CanonicalOrder`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalOrder {
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: u64,
    pub price: Decimal,
    pub trigger_price: Decimal,
    pub disclosed_quantity: u64,
    pub product: ProductType,
    pub validity: Validity,
    pub client_tag: Option<String>,
}

impl CanonicalOrder {
    pub fn market(symbol: &str, exchange: &str, side: Side, quantity: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: Decimal::ZERO,
            trigger_price: Decimal::ZERO,
            disclosed_quantity: 0,
            product: ProductType::Cnc,
            validity: Validity::Day,
            client_tag: None,
        }
    }

    pub fn limit(symbol: &str, exchange: &str, side: Side, quantity: u64, price: Decimal) -> Self {
        Self { order_type: OrderType::Limit, price, ..Self::market(symbol, exchange, side, quantity) }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.client_tag = Some(tag.to_string());
        self
    }

    /// Broker-independent sanity checks. Lot and tick checks need the
    /// contract and live in the transform pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() || self.exchange.trim().is_empty() {
            return Err(BridgeError::InvalidOrder("symbol and exchange are required".into()));
        }
        if self.quantity == 0 {
            return Err(BridgeError::InvalidOrder("quantity must be > 0".into()));
        }
        if self.price.is_sign_negative() || self.trigger_price.is_sign_negative() {
            return Err(BridgeError::InvalidOrder("prices must be >= 0".into()));
        }
        if self.order_type.needs_price() && self.price.is_zero() {
            return Err(BridgeError::InvalidOrder(format!("{} order needs a price", self.order_type.as_str())));
        }
        if self.order_type.needs_trigger() && self.trigger_price.is_zero() {
            return Err(BridgeError::InvalidOrder(format!("{} order needs a trigger price", self.order_type.as_str())));
        }
        if self.disclosed_quantity > self.quantity {
            return Err(BridgeError::InvalidOrder("disclosed quantity exceeds quantity".into()));
        }
        Ok(())
    }
}

/// Canonical mirror of a broker order record (order book row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub order: CanonicalOrder,
    pub status: OrderStatus,
    pub filled_quantity: u64,
    pub pending_quantity: u64,
    pub average_price: Decimal,
    pub rejection_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck { pub order_id: String, pub status: Option<OrderStatus> }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub product: ProductType,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: String,
    pub product: ProductType,
    /// Signed: long > 0, short < 0.
    pub quantity: i64,
    pub average_price: Decimal,
    pub ltp: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub average_price: Decimal,
    pub ltp: Option<Decimal>,
    pub market_value: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Funds {
    pub available_cash: Decimal,
    pub collateral: Decimal,
    pub utilised_debits: Decimal,
    pub m2m_unrealized: Decimal,
    pub m2m_realized: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub exchange: String,
    pub ltp: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub bid_qty: u64,
    pub ask_qty: u64,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub prev_close: Option<Decimal>,
    pub volume: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LtpTick {
    pub symbol: String,
    pub exchange: String,
    pub ltp: Decimal,
    pub quantity: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel { pub price: Decimal, pub quantity: u64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub symbol: String,
    pub exchange: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub symbol: String,
    pub exchange: String,
    pub status: OrderStatus,
    /// Broker event name (fill, partial_fill, canceled, ...), verbatim.
    pub event: String,
    pub filled_quantity: u64,
    pub average_price: Option<Decimal>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionMode { Ltp, Quote, Depth }
impl SubscriptionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LTP" | "1" => Some(SubscriptionMode::Ltp),
            "QUOTE" | "2" => Some(SubscriptionMode::Quote),
            "DEPTH" | "3" => Some(SubscriptionMode::Depth),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { SubscriptionMode::Ltp => "LTP", SubscriptionMode::Quote => "QUOTE", SubscriptionMode::Depth => "DEPTH" }
    }
}

/// Publication / tracking key: (symbol, exchange, mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey { pub symbol: String, pub exchange: String, pub mode: SubscriptionMode }
impl SubscriptionKey {
    pub fn new(symbol: &str, exchange: &str, mode: SubscriptionMode) -> Self {
        Self { symbol: symbol.to_ascii_uppercase(), exchange: exchange.to_ascii_uppercase(), mode }
    }
}
impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.mode.as_str())
    }
}

/// Broker-side identifiers for one canonical instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerInstrument { pub broker_symbol: String, pub broker_token: String, pub broker_exchange: String }

/// A live streaming request. `instrument` is resolved at subscribe time and
/// refreshed from the mapping cache on every replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub key: SubscriptionKey,
    pub depth_level: u8,
    pub instrument: BrokerInstrument,
}

/// Normalized real-time event, as delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent { Ltp(LtpTick), Quote(Quote), Depth(Depth), OrderUpdate(OrderUpdate) }
impl StreamEvent {
    /// Market events are keyed; order updates are account-level.
    pub fn key(&self) -> Option<SubscriptionKey> {
        match self {
            StreamEvent::Ltp(t) => Some(SubscriptionKey::new(&t.symbol, &t.exchange, SubscriptionMode::Ltp)),
            StreamEvent::Quote(q) => Some(SubscriptionKey::new(&q.symbol, &q.exchange, SubscriptionMode::Quote)),
            StreamEvent::Depth(d) => Some(SubscriptionKey::new(&d.symbol, &d.exchange, SubscriptionMode::Depth)),
            StreamEvent::OrderUpdate(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState { Disconnected, Connecting, Connected, Reconnecting, Failed }
impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Failed => "FAILED",
        }
    }
    /// Gauge encoding for metrics.
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Failed => 4,
        }
    }
}

/// `Pause` keeps the tracked subscriptions for a later `start()`;
/// `Shutdown` clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode { Pause, Shutdown }

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn validate_rejects_bad_orders() {
        let ok = CanonicalOrder::limit("AAPL", "NASDAQ", Side::Buy, 10, dec!(150.25));
        assert!(ok.validate().is_ok());

        let zero = CanonicalOrder { quantity: 0, ..ok.clone() };
        assert!(matches!(zero.validate(), Err(BridgeError::InvalidOrder(_))));

        let no_price = CanonicalOrder { price: Decimal::ZERO, ..ok.clone() };
        assert!(no_price.validate().is_err());

        let stop = CanonicalOrder { order_type: OrderType::Stop, ..ok.clone() };
        assert!(stop.validate().is_err(), "stop needs trigger");

        let disclosed = CanonicalOrder { disclosed_quantity: 11, ..ok };
        assert!(disclosed.validate().is_err());
    }

    #[test]
    fn key_is_case_normalized() {
        let k = SubscriptionKey::new("aapl", "nasdaq", SubscriptionMode::Quote);
        assert_eq!(k.to_string(), "NASDAQ:AAPL:QUOTE");
        assert_eq!(SubscriptionMode::parse("depth"), Some(SubscriptionMode::Depth));
        assert_eq!(SubscriptionMode::parse("bogus"), None);
    }

    #[test]
    fn canonical_positions_follow_all_order() {
        assert_eq!(Validity::Ioc.position(), 2);
        assert_eq!(OrderType::StopLimit.position(), 3);
    }
}
