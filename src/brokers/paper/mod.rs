// ===============================
// src/brokers/paper/mod.rs
// ===============================
//
// Self-contained paper venue. Token-based codes, session login, a single
// feed connection for market data and order events. Runs in process, so
// the bridge works end to end without credentials or network.
//
pub mod client;
pub mod exchange;
pub mod stream;
pub mod transform;
pub mod types;
pub mod venue;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::adapter::{AdapterContext, AuthToken, BrokerAdapter, Capabilities};
use crate::config::Credentials;
use crate::domain::{CanonicalOrder, Funds, Holding, OrderAck, OrderRecord, Position, Quote, Trade};
use crate::error::{BridgeError, Result};
use crate::stream::StreamHub;
use crate::symbols::{ContractEntry, ContractSource, SymbolCache};
use crate::transform::{map_rows, reconcile, BrokerVocabulary};
use crate::transport::Method;

use client::{PaperClient, BROKER};
use exchange::PaperExchange;
use stream::PaperProtocol;
use types::{PaperFill, PaperFunds, PaperHolding, PaperInstrument, PaperOrder, PaperPosition, PaperQuote, PaperReply};

pub const BASE_URL: &str = "paper://venue";

/// Registry factory. The configured api secret doubles as the venue
/// password; leave it empty to accept any.
pub fn factory(ctx: AdapterContext) -> Result<Arc<dyn BrokerAdapter>> {
    let exchange = PaperExchange::new(
        ctx.config.paper.starting_cash,
        &ctx.config.credentials.api_secret,
        ctx.config.paper.tick_interval,
    );
    Ok(Arc::new(PaperAdapter::with_exchange(ctx, exchange)?))
}

pub struct PaperAdapter {
    exchange: PaperExchange,
    client: Arc<PaperClient>,
    vocab: Arc<BrokerVocabulary>,
    contracts: Arc<SymbolCache>,
    source: Arc<PaperContracts>,
    hub: Arc<StreamHub>,
}

impl PaperAdapter {
    pub fn with_exchange(ctx: AdapterContext, exchange: PaperExchange) -> Result<Self> {
        let vocab = Arc::new(transform::vocabulary()?);
        let venue = Arc::new(exchange.clone());
        let client = Arc::new(PaperClient::new(venue.clone(), BASE_URL));
        let protocol = Arc::new(PaperProtocol::new(client.clone(), ctx.contracts.clone(), vocab.clone()));
        let hub = StreamHub::new(BROKER, ctx.contracts.clone(), ctx.config.stream.clone(), venue, protocol);
        Ok(Self {
            exchange,
            source: Arc::new(PaperContracts::new(client.clone())),
            client,
            vocab,
            contracts: ctx.contracts,
            hub: Arc::new(hub),
        })
    }

    /// Handle on the simulated venue (prices, failure injection).
    pub fn exchange(&self) -> &PaperExchange {
        &self.exchange
    }

    fn order_path(order_id: &str) -> String {
        format!("/orders/{}", urlencoding::encode(order_id))
    }

    async fn fetch_order(&self, order_id: &str) -> Result<PaperOrder> {
        self.client.call_json("get_order", self.client.request(Method::Get, &Self::order_path(order_id))).await
    }

    /// Ack with the venue's status right after the call.
    async fn ack(&self, order_id: &str) -> Result<OrderAck> {
        let o = self.fetch_order(order_id).await?;
        Ok(OrderAck { order_id: o.norenordno, status: Some(self.vocab.status.map(&o.status)) })
    }
}

#[async_trait]
impl BrokerAdapter for PaperAdapter {
    fn name(&self) -> &str {
        BROKER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn contracts(&self) -> Arc<SymbolCache> {
        self.contracts.clone()
    }

    fn contract_source(&self) -> Arc<dyn ContractSource> {
        self.source.clone()
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken> {
        if credentials.api_key.trim().is_empty() {
            return Err(BridgeError::AuthenticationFailed("paper: user id (api key) is required".into()));
        }
        let req = self
            .client
            .request(Method::Post, "/user")
            .json(json!({ "uid": credentials.api_key, "pwd": credentials.api_secret }));
        let reply: PaperReply = self.client.call_json("authenticate", req).await?;
        let token = reply
            .susertoken
            .ok_or_else(|| BridgeError::AuthenticationFailed("paper: login reply without session token".into()))?;
        self.client.set_session(&credentials.api_key, &token);
        info!(broker = BROKER, uid = %credentials.api_key, "authenticated");
        Ok(AuthToken::new(token))
    }

    async fn place_order(&self, order: &CanonicalOrder) -> Result<OrderAck> {
        let payload = transform::to_broker_order(order, &self.client.uid(), &self.contracts, &self.vocab)?;
        let req = self.client.request(Method::Post, "/orders").json(serde_json::to_value(&payload)?);
        let reply: PaperReply = self.client.call_json("place_order", req).await?;
        let id = reply
            .norenordno
            .ok_or_else(|| BridgeError::Decode("paper: place reply without order id".into()))?;
        info!(broker = BROKER, order_id = %id, symbol = %order.symbol, side = ?order.side, qty = order.quantity, "order placed");
        self.ack(&id).await
    }

    async fn modify_order(&self, order_id: &str, desired: &CanonicalOrder) -> Result<OrderAck> {
        let current = self.fetch_order(order_id).await?;
        let current_rec = transform::from_broker_order(&current, &self.contracts, &self.vocab)?;
        let changes = reconcile(&current_rec.order, desired)?;
        if changes.is_empty() {
            debug!(broker = BROKER, order_id, "modify: nothing changed");
            return Ok(OrderAck { order_id: current.norenordno, status: Some(current_rec.status) });
        }
        let body = transform::to_modify_request(&changes, &self.vocab)?;
        let req = self.client.request(Method::Put, &Self::order_path(order_id)).json(serde_json::to_value(&body)?);
        self.client.call("modify_order", req).await?;
        info!(broker = BROKER, order_id, "order modified");
        self.ack(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderAck> {
        self.client.call("cancel_order", self.client.request(Method::Delete, &Self::order_path(order_id))).await?;
        self.ack(order_id).await
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>> {
        let raw: Vec<PaperOrder> = self.client.call_json("orders", self.client.request(Method::Get, "/orders")).await?;
        map_rows(BROKER, "order", &raw, |o| transform::from_broker_order(o, &self.contracts, &self.vocab))
    }

    async fn trade_book(&self) -> Result<Vec<Trade>> {
        let raw: Vec<PaperFill> = self.client.call_json("trades", self.client.request(Method::Get, "/trades")).await?;
        map_rows(BROKER, "trade", &raw, |f| transform::trade_from_fill(f, &self.contracts, &self.vocab))
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let raw: Vec<PaperPosition> =
            self.client.call_json("positions", self.client.request(Method::Get, "/positions")).await?;
        map_rows(BROKER, "position", &raw, |p| transform::position_from(p, &self.contracts, &self.vocab))
    }

    async fn holdings(&self) -> Result<Vec<Holding>> {
        let raw: Vec<PaperHolding> =
            self.client.call_json("holdings", self.client.request(Method::Get, "/holdings")).await?;
        map_rows(BROKER, "holding", &raw, |h| transform::holding_from(h, &self.contracts))
    }

    async fn quotes(&self, instruments: &[(String, String)]) -> Result<Vec<Quote>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        let mut resolved = Vec::with_capacity(instruments.len());
        for (symbol, exchange) in instruments {
            resolved.push(self.contracts.resolve_to_broker(symbol, exchange)?);
        }
        let k = resolved
            .iter()
            .map(|i| format!("{}|{}", i.broker_exchange, i.broker_token))
            .collect::<Vec<_>>()
            .join("#");
        let req = self.client.request(Method::Get, "/quotes").query("k", k);
        let raw: Vec<PaperQuote> = self.client.call_json("quotes", req).await?;
        resolved
            .iter()
            .map(|inst| {
                let q = raw
                    .iter()
                    .find(|q| q.token == inst.broker_token && q.exch.eq_ignore_ascii_case(&inst.broker_exchange))
                    .ok_or_else(|| BridgeError::BrokerRejected {
                        reason: format!("no quote for {}|{}", inst.broker_exchange, inst.broker_token),
                    })?;
                transform::quote_from(q, &self.contracts)
            })
            .collect()
    }

    async fn funds(&self) -> Result<Funds> {
        let raw: PaperFunds = self.client.call_json("funds", self.client.request(Method::Get, "/funds")).await?;
        Ok(transform::funds_from(&raw))
    }

    fn stream(&self) -> Option<Arc<StreamHub>> {
        Some(self.hub.clone())
    }
}

/// Instrument master from GET /instruments. Blank tokens are passed on and
/// dropped by the cache's row validation.
pub struct PaperContracts {
    client: Arc<PaperClient>,
}

impl PaperContracts {
    pub fn new(client: Arc<PaperClient>) -> Self {
        Self { client }
    }
}

pub fn contract_from_instrument(i: &PaperInstrument) -> Option<ContractEntry> {
    let exchange = transform::canonical_exchange(&i.exch)?;
    let mut c = ContractEntry::equity(&i.symname, exchange, &i.tsym, &i.exch, &i.token);
    c.name = i.cname.clone();
    c.lot_size = i.ls.max(1);
    c.tick_size = i.ti;
    c.instrument_type = i.instname.clone();
    Some(c)
}

#[async_trait]
impl ContractSource for PaperContracts {
    async fn fetch_contracts(&self) -> Result<Vec<ContractEntry>> {
        let raw: Vec<PaperInstrument> =
            self.client.call_json("instruments", self.client.request(Method::Get, "/instruments")).await?;
        let rows: Vec<ContractEntry> = raw.iter().filter_map(contract_from_instrument).collect();
        info!(instruments = raw.len(), rows = rows.len(), "paper: instrument master fetched");
        Ok(rows)
    }
}
