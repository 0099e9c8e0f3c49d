// ===============================
// src/brokers/alpaca/types.rs
// ===============================
//
// Native Alpaca payloads. Numbers arrive as strings ("10", "190.05") or
// JSON numbers depending on the endpoint; both go through serde_lenient.
//
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::transform::num::serde_lenient;

// ---- REST: requests ----

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlpacaOrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: &'static str,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

/// PATCH /v2/orders/{id}; absent fields are left alone by the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlpacaReplaceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<String>,
}

// ---- REST: responses ----

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaOrder {
    pub id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub qty: u64,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub filled_qty: u64,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub filled_avg_price: Option<Decimal>,
    pub side: String,
    #[serde(rename = "type", alias = "order_type")]
    pub order_type: String,
    #[serde(default)]
    pub time_in_force: String,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub limit_price: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub stop_price: Option<Decimal>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaPosition {
    pub symbol: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default, deserialize_with = "serde_lenient::signed_quantity")]
    pub qty: i64,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub avg_entry_price: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub current_price: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub market_value: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub unrealized_pl: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub unrealized_intraday_pl: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub cash: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub buying_power: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub equity: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub last_equity: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub initial_margin: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaAsset {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub tradable: bool,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub min_trade_increment: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub price_increment: Option<Decimal>,
}

// ---- Market data snapshots (data API) ----

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotTrade {
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub p: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub s: u64,
    #[serde(default)]
    pub t: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotQuote {
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub bp: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub bs: u64,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub ap: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity", rename = "as")]
    pub as_: u64,
    #[serde(default)]
    pub t: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotBar {
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub o: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub h: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub l: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub c: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub v: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlpacaSnapshot {
    #[serde(default)]
    pub latest_trade: Option<SnapshotTrade>,
    #[serde(default)]
    pub latest_quote: Option<SnapshotQuote>,
    #[serde(default)]
    pub daily_bar: Option<SnapshotBar>,
    #[serde(default)]
    pub prev_daily_bar: Option<SnapshotBar>,
}

// ---- Streaming ----

/// One element of a market-data stream array. `T` is the message type:
/// "t" trade, "q" quote, "success"/"error"/"subscription" control.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(rename = "S", default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub p: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub s: u64,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub bp: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub bs: u64,
    #[serde(default, deserialize_with = "serde_lenient::decimal_opt")]
    pub ap: Option<Decimal>,
    #[serde(default, deserialize_with = "serde_lenient::quantity", rename = "as")]
    pub as_: u64,
    #[serde(default)]
    pub t: Option<DateTime<Utc>>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

/// Trading stream envelope: {"stream": "...", "data": {...}}.
#[derive(Debug, Clone, Deserialize)]
pub struct TradingEnvelope {
    pub stream: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeUpdate {
    pub event: String,
    pub order: AlpacaOrder,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}
