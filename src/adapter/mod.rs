// ===============================
// src/adapter/mod.rs
// ===============================
//
// Capability contract every broker implementation satisfies.
// Optional capabilities default to UnsupportedCapability so callers can
// ask `capabilities()` up front instead of discovering it via a failed call.
//
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{BridgeConfig, Credentials};
use crate::domain::{
    CanonicalOrder, Funds, Holding, OrderAck, OrderRecord, Position, ProductType, Quote, StopMode,
    Trade,
};
use crate::error::{BridgeError, Result};
use crate::stream::StreamHub;
use crate::symbols::{ContractSource, RefreshReport, SymbolCache};

pub use registry::{AdapterFactory, Registry, RegistryBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Authenticate,
    PlaceOrder,
    ModifyOrder,
    CancelOrder,
    OrderBook,
    TradeBook,
    Positions,
    Holdings,
    Quotes,
    Funds,
    Streaming,
    MarketDepth,
}

impl Capability {
    pub const ALL: [Capability; 12] = [
        Capability::Authenticate,
        Capability::PlaceOrder,
        Capability::ModifyOrder,
        Capability::CancelOrder,
        Capability::OrderBook,
        Capability::TradeBook,
        Capability::Positions,
        Capability::Holdings,
        Capability::Quotes,
        Capability::Funds,
        Capability::Streaming,
        Capability::MarketDepth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Authenticate => "authenticate",
            Capability::PlaceOrder => "place_order",
            Capability::ModifyOrder => "modify_order",
            Capability::CancelOrder => "cancel_order",
            Capability::OrderBook => "get_order_book",
            Capability::TradeBook => "get_trade_book",
            Capability::Positions => "get_positions",
            Capability::Holdings => "get_holdings",
            Capability::Quotes => "get_quotes",
            Capability::Funds => "get_funds",
            Capability::Streaming => "streaming",
            Capability::MarketDepth => "depth streaming",
        }
    }

    fn bit(&self) -> u16 {
        1 << (*self as u16)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed capability set of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    pub fn none() -> Self {
        Capabilities(0)
    }

    pub fn all() -> Self {
        Self::of(&Capability::ALL)
    }

    pub fn of(caps: &[Capability]) -> Self {
        Capabilities(caps.iter().fold(0, |acc, c| acc | c.bit()))
    }

    pub fn with(self, cap: Capability) -> Self {
        Capabilities(self.0 | cap.bit())
    }

    pub fn without(self, cap: Capability) -> Self {
        Capabilities(self.0 & !cap.bit())
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.supports(*c))
    }
}

/// Opaque bearer credential returned by `authenticate`.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        AuthToken(token.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// What a factory receives from the registry. One broker, one account.
#[derive(Clone)]
pub struct AdapterContext {
    pub config: Arc<BridgeConfig>,
    pub contracts: Arc<SymbolCache>,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn require(&self, cap: Capability) -> Result<()> {
        if self.capabilities().supports(cap) {
            Ok(())
        } else {
            Err(BridgeError::unsupported(self.name(), cap))
        }
    }

    /// Mapping cache owned by this adapter.
    fn contracts(&self) -> Arc<SymbolCache>;

    /// Master-contract collaborator used by `refresh_contracts`.
    fn contract_source(&self) -> Arc<dyn ContractSource>;

    async fn authenticate(&self, _credentials: &Credentials) -> Result<AuthToken> {
        Err(BridgeError::unsupported(self.name(), Capability::Authenticate))
    }

    async fn place_order(&self, _order: &CanonicalOrder) -> Result<OrderAck> {
        Err(BridgeError::unsupported(self.name(), Capability::PlaceOrder))
    }

    /// `desired` is the complete new state; only changed mutable fields are
    /// sent. Returns the broker's current record when nothing changed.
    async fn modify_order(&self, _order_id: &str, _desired: &CanonicalOrder) -> Result<OrderAck> {
        Err(BridgeError::unsupported(self.name(), Capability::ModifyOrder))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<OrderAck> {
        Err(BridgeError::unsupported(self.name(), Capability::CancelOrder))
    }

    async fn order_book(&self) -> Result<Vec<OrderRecord>> {
        Err(BridgeError::unsupported(self.name(), Capability::OrderBook))
    }

    async fn trade_book(&self) -> Result<Vec<Trade>> {
        Err(BridgeError::unsupported(self.name(), Capability::TradeBook))
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        Err(BridgeError::unsupported(self.name(), Capability::Positions))
    }

    async fn holdings(&self) -> Result<Vec<Holding>> {
        Err(BridgeError::unsupported(self.name(), Capability::Holdings))
    }

    async fn quotes(&self, _instruments: &[(String, String)]) -> Result<Vec<Quote>> {
        Err(BridgeError::unsupported(self.name(), Capability::Quotes))
    }

    async fn funds(&self) -> Result<Funds> {
        Err(BridgeError::unsupported(self.name(), Capability::Funds))
    }

    /// Streaming hub, if the broker streams at all.
    fn stream(&self) -> Option<Arc<StreamHub>> {
        None
    }

    fn stream_hub(&self) -> Result<Arc<StreamHub>> {
        match self.stream() {
            Some(hub) if self.capabilities().supports(Capability::Streaming) => Ok(hub),
            _ => Err(BridgeError::unsupported(self.name(), Capability::Streaming)),
        }
    }

    async fn start_stream(&self) -> Result<Arc<StreamHub>> {
        let hub = self.stream_hub()?;
        hub.start();
        Ok(hub)
    }

    async fn stop_stream(&self, mode: StopMode) -> Result<()> {
        let hub = self.stream_hub()?;
        hub.stop(mode).await;
        Ok(())
    }

    /// Full master-contract download and atomic swap into `contracts()`.
    async fn refresh_contracts(&self) -> Result<RefreshReport> {
        let source = self.contract_source();
        self.contracts().refresh(source.as_ref()).await
    }

    /// Cancels every PENDING/OPEN order in the book. Stops at the first
    /// failure; the error names the order.
    async fn cancel_all_orders(&self) -> Result<Vec<OrderAck>> {
        self.require(Capability::CancelOrder)?;
        let book = self.order_book().await?;
        let mut acks = Vec::new();
        for rec in book.iter().filter(|r| r.status.is_working()) {
            match self.cancel_order(&rec.order_id).await {
                Ok(ack) => acks.push(ack),
                Err(e) => {
                    warn!(broker = %self.name(), order_id = %rec.order_id, error = %e, "cancel_all: cancel failed");
                    return Err(e);
                }
            }
        }
        info!(broker = %self.name(), cancelled = acks.len(), "cancel_all done");
        Ok(acks)
    }

    /// Market order opposite to every non-zero position, same product.
    async fn close_all_positions(&self) -> Result<Vec<OrderAck>> {
        self.require(Capability::PlaceOrder)?;
        let positions = self.positions().await?;
        let mut acks = Vec::new();
        for p in positions.iter().filter(|p| p.quantity != 0) {
            let side = if p.quantity > 0 { crate::domain::Side::Sell } else { crate::domain::Side::Buy };
            let order = CanonicalOrder {
                product: p.product,
                ..CanonicalOrder::market(&p.symbol, &p.exchange, side, p.quantity.unsigned_abs())
            };
            acks.push(self.place_order(&order).await?);
        }
        info!(broker = %self.name(), closed = acks.len(), "close_all done");
        Ok(acks)
    }
}

/// Product used when a broker has no product concept.
pub const IMPLICIT_PRODUCT: ProductType = ProductType::Cnc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_set_queries() {
        let caps = Capabilities::of(&[Capability::PlaceOrder, Capability::Quotes]);
        assert!(caps.supports(Capability::PlaceOrder));
        assert!(!caps.supports(Capability::Streaming));
        assert!(caps.with(Capability::Streaming).supports(Capability::Streaming));
        assert!(!Capabilities::all().without(Capability::Funds).supports(Capability::Funds));
        assert_eq!(caps.iter().count(), 2);
    }

    #[test]
    fn token_debug_is_redacted() {
        let t = AuthToken::new("secret-key");
        assert_eq!(format!("{t:?}"), "AuthToken(***)");
        assert_eq!(t.as_str(), "secret-key");
    }
}
