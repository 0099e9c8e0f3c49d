// ===============================
// src/lib.rs
// ===============================
//
// broker_bridge: one canonical interface over heterogeneous brokers.
//
//   domain     canonical value types
//   symbols    contract table + symbol mapping cache
//   transform  vocabulary tables, numeric helpers, modify reconcile
//   adapter    capability contract + registry
//   stream     connection state machine, subscriptions, event bus
//   transport  HTTP / WebSocket collaborators (+ scripted mocks)
//   brokers    concrete adapters (alpaca, paper)
//
pub mod adapter;
pub mod brokers;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod positions;
pub mod recorder;
pub mod stream;
pub mod symbols;
pub mod transform;
pub mod transport;

pub use adapter::{BrokerAdapter, Capability, Registry};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
