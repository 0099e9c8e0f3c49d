// ===============================
// src/stream/mod.rs
// ===============================
//
// Streaming subscription manager.
// - StreamHub groups a broker's connections (market data first, then any
//   auxiliary ones such as an order-update channel) around one EventBus.
// - Canonical (symbol, exchange) is resolved to broker identifiers at
//   subscribe time and again for every replay after a reconnect.
//
pub mod backoff;
pub mod bus;
pub mod connection;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::StreamPolicy;
use crate::domain::{
    ConnectionState, OrderUpdate, StopMode, StreamEvent, Subscription, SubscriptionKey, SubscriptionMode,
};
use crate::error::{BridgeError, Result};
use crate::symbols::SymbolCache;
use crate::transport::StreamConnector;

pub use backoff::Backoff;
pub use bus::EventBus;
pub use connection::ConnectionManager;
pub use protocol::StreamProtocol;

pub struct StreamHub {
    broker: String,
    contracts: Arc<SymbolCache>,
    policy: StreamPolicy,
    bus: Arc<EventBus>,
    market: ConnectionManager,
    auxiliary: Vec<ConnectionManager>,
}

impl StreamHub {
    pub fn new(
        broker: &str,
        contracts: Arc<SymbolCache>,
        policy: StreamPolicy,
        connector: Arc<dyn StreamConnector>,
        protocol: Arc<dyn StreamProtocol>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(broker, policy.event_buffer));
        let market = ConnectionManager::new(broker, connector, protocol, contracts.clone(), policy.clone(), bus.clone());
        Self { broker: broker.to_string(), contracts, policy, bus, market, auxiliary: Vec::new() }
    }

    /// Extra connection sharing this hub's bus (e.g. order updates).
    pub fn with_auxiliary(mut self, connector: Arc<dyn StreamConnector>, protocol: Arc<dyn StreamProtocol>) -> Self {
        let conn = ConnectionManager::new(
            &self.broker,
            connector,
            protocol,
            self.contracts.clone(),
            self.policy.clone(),
            self.bus.clone(),
        );
        self.auxiliary.push(conn);
        self
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn market(&self) -> &ConnectionManager {
        &self.market
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionManager> {
        std::iter::once(&self.market).chain(self.auxiliary.iter())
    }

    /// State of the market-data connection.
    pub fn state(&self) -> ConnectionState {
        self.market.state()
    }

    pub fn connection_states(&self) -> Vec<(String, ConnectionState)> {
        self.connections().map(|c| (c.label().to_string(), c.state())).collect()
    }

    pub fn supports(&self, mode: SubscriptionMode) -> bool {
        self.market.supports(mode)
    }

    /// Resolves through the mapping cache (SymbolNotFound surfaces here),
    /// tracks the subscription and returns a receiver for its key. The
    /// receiver exists before the subscription is tracked, so it misses
    /// nothing.
    pub fn subscribe(
        &self,
        symbol: &str,
        exchange: &str,
        mode: SubscriptionMode,
        depth_level: u8,
    ) -> Result<broadcast::Receiver<StreamEvent>> {
        let instrument = self.contracts.resolve_to_broker(symbol, exchange)?;
        let key = SubscriptionKey::new(symbol, exchange, mode);
        let rx = self.bus.subscribe(&key);
        if let Err(e) = self.market.subscribe(Subscription { key: key.clone(), depth_level, instrument }) {
            drop(rx);
            self.bus.prune(&key);
            return Err(e);
        }
        Ok(rx)
    }

    pub fn unsubscribe(&self, symbol: &str, exchange: &str, mode: SubscriptionMode) -> Result<bool> {
        self.market.unsubscribe(&SubscriptionKey::new(symbol, exchange, mode))
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.market.subscriptions()
    }

    /// Another consumer for an existing (or future) key.
    pub fn events(&self, key: &SubscriptionKey) -> broadcast::Receiver<StreamEvent> {
        self.bus.subscribe(key)
    }

    pub fn firehose(&self) -> broadcast::Receiver<StreamEvent> {
        self.bus.firehose()
    }

    pub fn order_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.bus.order_updates()
    }

    pub fn start(&self) {
        for c in self.connections() {
            c.start();
        }
    }

    pub async fn stop(&self, mode: StopMode) {
        for c in self.connections() {
            c.stop(mode).await;
        }
    }

    pub async fn wait_for_state(&self, target: ConnectionState, within: Duration) -> bool {
        self.market.wait_for_state(target, within).await
    }

    /// Resolves with `StreamFailed` once the market connection gives up.
    pub async fn failed(&self) -> BridgeError {
        self.market.failure().await
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        for c in std::iter::once(&self.market).chain(self.auxiliary.iter()) {
            c.abort();
        }
    }
}
