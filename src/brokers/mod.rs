// ===============================
// src/brokers/mod.rs
// ===============================
//
// Concrete adapters and the built-in registry:
//   alpaca  US equities over REST + websockets
//   paper   in-process simulated venue
//
pub mod alpaca;
pub mod paper;

use crate::adapter::Registry;
use crate::error::Result;

/// Every adapter shipped with the crate, keyed by name.
pub fn builtin_registry() -> Result<Registry> {
    Ok(Registry::builder()
        .register(alpaca::client::BROKER, alpaca::factory)?
        .register(paper::client::BROKER, paper::factory)?
        .build())
}
