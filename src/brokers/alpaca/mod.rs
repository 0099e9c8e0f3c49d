// ===============================
// src/brokers/alpaca/mod.rs
// ===============================
//
// Alpaca (US equities) over REST + two websockets.
// - trading API  : account, orders, positions, assets
// - data API     : snapshots for quotes
// - market ws    : trades/quotes      (StreamHub market connection)
// - trading ws   : trade_updates      (auxiliary connection)
//
pub mod client;
pub mod contracts;
pub mod stream;
pub mod transform;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::adapter::{AdapterContext, AuthToken, BrokerAdapter, Capabilities, Capability};
use crate::config::Credentials;
use crate::domain::{CanonicalOrder, Funds, Holding, OrderAck, OrderRecord, Position, Quote, Trade};
use crate::error::{BridgeError, Result};
use crate::stream::StreamHub;
use crate::symbols::{ContractSource, SymbolCache};
use crate::transform::{map_rows, reconcile, BrokerVocabulary};
use crate::transport::{Method, OrderTransport, ReqwestTransport, StreamConnector, WsConnector};

use client::{AlpacaClient, BROKER};
use contracts::AlpacaContracts;
use stream::{MarketDataProtocol, TradingProtocol};
use types::{AlpacaAccount, AlpacaOrder, AlpacaPosition, AlpacaSnapshot};

pub struct AlpacaAdapter {
    client: Arc<AlpacaClient>,
    vocab: Arc<BrokerVocabulary>,
    contracts: Arc<SymbolCache>,
    source: Arc<AlpacaContracts>,
    hub: Arc<StreamHub>,
}

/// Registry factory: real HTTP and websocket transports.
pub fn factory(ctx: AdapterContext) -> Result<Arc<dyn BrokerAdapter>> {
    let transport = Arc::new(ReqwestTransport::new(ctx.config.http.clone())?);
    let market = Arc::new(WsConnector::new(&ctx.config.alpaca.market_ws_url)?);
    let trading = Arc::new(WsConnector::new(&ctx.config.alpaca.trading_ws_url)?);
    Ok(Arc::new(AlpacaAdapter::with_transports(ctx, transport, market, trading)?))
}

impl AlpacaAdapter {
    /// Any transports; tests pass mocks here.
    pub fn with_transports(
        ctx: AdapterContext,
        transport: Arc<dyn OrderTransport>,
        market: Arc<dyn StreamConnector>,
        trading: Arc<dyn StreamConnector>,
    ) -> Result<Self> {
        let vocab = Arc::new(transform::vocabulary()?);
        let client = Arc::new(AlpacaClient::new(transport, ctx.config.alpaca.clone(), ctx.config.credentials.clone()));
        let market_protocol = Arc::new(MarketDataProtocol::new(client.clone(), ctx.contracts.clone()));
        let trading_protocol = Arc::new(TradingProtocol::new(client.clone(), ctx.contracts.clone(), vocab.clone()));
        let hub = StreamHub::new(BROKER, ctx.contracts.clone(), ctx.config.stream.clone(), market, market_protocol)
            .with_auxiliary(trading, trading_protocol);
        Ok(Self {
            source: Arc::new(AlpacaContracts::new(client.clone())),
            client,
            vocab,
            contracts: ctx.contracts,
            hub: Arc::new(hub),
        })
    }

    async fn fetch_order(&self, order_id: &str) -> Result<AlpacaOrder> {
        let path = format!("/v2/orders/{}", urlencoding::encode(order_id));
        self.client.call_json("get_order", self.client.rest(Method::Get, &path)).await
    }

    async fn orders(&self, status: &str) -> Result<Vec<AlpacaOrder>> {
        let req = self
            .client
            .rest(Method::Get, "/v2/orders")
            .query("status", status)
            .query("limit", "500")
            .query("direction", "desc");
        self.client.call_json("orders", req).await
    }

    fn ack(&self, o: &AlpacaOrder) -> OrderAck {
        OrderAck { order_id: o.id.clone(), status: Some(self.vocab.status.map(&o.status)) }
    }
}

#[async_trait]
impl BrokerAdapter for AlpacaAdapter {
    fn name(&self) -> &str {
        BROKER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all().without(Capability::MarketDepth)
    }

    fn contracts(&self) -> Arc<SymbolCache> {
        self.contracts.clone()
    }

    fn contract_source(&self) -> Arc<dyn ContractSource> {
        self.source.clone()
    }

    /// Alpaca has no session login: the key pair is the credential. It is
    /// checked against /v2/account and kept for later calls and streams.
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthToken> {
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(BridgeError::AuthenticationFailed("api key and secret are required".into()));
        }
        let body = self
            .client
            .call_as("authenticate", self.client.rest(Method::Get, "/v2/account"), credentials)
            .await?;
        let account: AlpacaAccount = serde_json::from_str(&body)?;
        self.client.set_credentials(credentials.clone());
        info!(broker = BROKER, account = %account.id, status = %account.status, "authenticated");
        Ok(AuthToken::new(credentials.api_key.clone()))
    }

    async fn place_order(&self, order: &CanonicalOrder) -> Result<OrderAck> {
        let payload = transform::to_broker_order(order, &self.contracts, &self.vocab)?;
        let req = self.client.rest(Method::Post, "/v2/orders").json(serde_json::to_value(&payload)?);
        let placed: AlpacaOrder = self.client.call_json("place_order", req).await?;
        info!(broker = BROKER, order_id = %placed.id, symbol = %order.symbol, side = ?order.side, qty = order.quantity, "order placed");
        Ok(self.ack(&placed))
    }

    async fn modify_order(&self, order_id: &str, desired: &CanonicalOrder) -> Result<OrderAck> {
        let current = self.fetch_order(order_id).await?;
        let current_rec = transform::from_broker_order(&current, &self.contracts, &self.vocab)?;
        let changes = reconcile(&current_rec.order, desired)?;
        if changes.is_empty() {
            return Ok(self.ack(&current));
        }
        let body = transform::to_replace_request(&changes, &self.vocab)?;
        let path = format!("/v2/orders/{}", urlencoding::encode(order_id));
        let req = self.client.rest(Method::Patch, &path).json(serde_json::to_value(&body)?);
        // a replace creates a new order id
        let replaced: AlpacaOrder = self.client.call_json("modify_order", req).await?;
        info!(broker = BROKER, old = order_id, new = %replaced.id, "order replaced");
        Ok(self.ack(&replaced))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderAck> {
        let path = format!("/v2/orders/{}", urlencoding::encode(order_id));
        self.client.call("cancel_order", self.client.rest(Method::Delete, &path)).await?;
        Ok(OrderAck { order_id: order_id.to_string(), status: None })
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>> {
        let raw = self.orders("all").await?;
        map_rows(BROKER, "order", &raw, |o| transform::from_broker_order(o, &self.contracts, &self.vocab))
    }

    async fn trade_book(&self) -> Result<Vec<Trade>> {
        let raw = self.orders("closed").await?;
        let trades = map_rows(BROKER, "trade", &raw, |o| transform::trade_from_order(o, &self.contracts, &self.vocab))?;
        Ok(trades.into_iter().flatten().collect())
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let raw: Vec<AlpacaPosition> = self.client.call_json("positions", self.client.rest(Method::Get, "/v2/positions")).await?;
        map_rows(BROKER, "position", &raw, |p| transform::position_from(p, &self.contracts))
    }

    /// Long positions; Alpaca does not separate delivery holdings.
    async fn holdings(&self) -> Result<Vec<Holding>> {
        let raw: Vec<AlpacaPosition> = self.client.call_json("holdings", self.client.rest(Method::Get, "/v2/positions")).await?;
        map_rows(BROKER, "holding", raw.iter().filter(|p| p.qty > 0), |p| transform::holding_from(p, &self.contracts))
    }

    async fn quotes(&self, instruments: &[(String, String)]) -> Result<Vec<Quote>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        let mut resolved = Vec::with_capacity(instruments.len());
        for (symbol, exchange) in instruments {
            resolved.push((symbol, exchange, self.contracts.resolve_to_broker(symbol, exchange)?));
        }
        let symbols: Vec<&str> = resolved.iter().map(|(_, _, i)| i.broker_symbol.as_str()).collect();
        let req = self.client.data("/v2/stocks/snapshots").query("symbols", symbols.join(","));
        let snaps: std::collections::HashMap<String, AlpacaSnapshot> = self.client.call_json("quotes", req).await?;
        resolved
            .iter()
            .map(|(symbol, exchange, inst)| {
                snaps
                    .get(&inst.broker_symbol)
                    .map(|s| transform::quote_from(symbol, exchange, s))
                    .ok_or_else(|| BridgeError::BrokerRejected { reason: format!("no snapshot for {}", inst.broker_symbol) })
            })
            .collect()
    }

    async fn funds(&self) -> Result<Funds> {
        let account: AlpacaAccount = self.client.call_json("funds", self.client.rest(Method::Get, "/v2/account")).await?;
        Ok(transform::funds_from(&account))
    }

    fn stream(&self) -> Option<Arc<StreamHub>> {
        Some(self.hub.clone())
    }
}
