// ===============================
// src/brokers/alpaca/contracts.rs
// ===============================
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::client::AlpacaClient;
use super::types::AlpacaAsset;
use crate::error::Result;
use crate::symbols::{ContractEntry, ContractSource};
use crate::transport::Method;

/// Listing venue -> canonical exchange. Venues not listed here are skipped.
pub fn canonical_exchange(venue: &str) -> Option<&'static str> {
    match venue.trim().to_ascii_uppercase().as_str() {
        "NASDAQ" => Some("NASDAQ"),
        "NYSE" => Some("NYSE"),
        "AMEX" => Some("AMEX"),
        "ARCA" => Some("NYSE"),
        "BATS" | "IEX" => Some("NASDAQ"),
        _ => None,
    }
}

/// Active US equities from /v2/assets. Asset id is the token.
pub struct AlpacaContracts {
    client: Arc<AlpacaClient>,
}

impl AlpacaContracts {
    pub fn new(client: Arc<AlpacaClient>) -> Self {
        Self { client }
    }
}

pub fn contract_from_asset(a: &AlpacaAsset) -> Option<ContractEntry> {
    if !a.tradable || a.symbol.trim().is_empty() {
        return None;
    }
    let exchange = canonical_exchange(&a.exchange)?;
    let mut c = ContractEntry::equity(&a.symbol, exchange, &a.symbol, &a.exchange.to_ascii_uppercase(), &a.id);
    c.name = a.name.clone();
    c.instrument_type = "EQ".to_string();
    if let Some(tick) = a.price_increment.filter(|t| *t > Decimal::ZERO) {
        c.tick_size = tick;
    }
    Some(c)
}

#[async_trait]
impl ContractSource for AlpacaContracts {
    async fn fetch_contracts(&self) -> Result<Vec<ContractEntry>> {
        let req = self
            .client
            .rest(Method::Get, "/v2/assets")
            .query("status", "active")
            .query("asset_class", "us_equity");
        let assets: Vec<AlpacaAsset> = self.client.call_json("assets", req).await?;
        let total = assets.len();
        let rows: Vec<ContractEntry> = assets.iter().filter_map(contract_from_asset).collect();
        if rows.len() < total {
            debug!(skipped = total - rows.len(), "alpaca: non-tradable or unknown-venue assets skipped");
        }
        info!(assets = total, rows = rows.len(), "alpaca: asset list fetched");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(symbol: &str, exchange: &str, tradable: bool) -> AlpacaAsset {
        serde_json::from_value(serde_json::json!({
            "id": format!("id-{symbol}"), "symbol": symbol, "name": "Test Inc",
            "exchange": exchange, "tradable": tradable
        }))
        .unwrap()
    }

    #[test]
    fn venues_map_and_unknown_ones_skip() {
        let c = contract_from_asset(&asset("SPY", "ARCA", true)).unwrap();
        assert_eq!((c.canonical_exchange.as_str(), c.broker_exchange.as_str()), ("NYSE", "ARCA"));
        assert_eq!(c.broker_token, "id-SPY");
        assert!(contract_from_asset(&asset("X", "OTC", true)).is_none());
        assert!(contract_from_asset(&asset("Y", "NASDAQ", false)).is_none());
    }
}
