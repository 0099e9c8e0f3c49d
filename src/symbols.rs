// ===============================
// src/symbols.rs
// ===============================
//
// Symbol mapping cache.
// - ContractTable: immutable snapshot with all lookup indices built up front.
// - SymbolCache  : RwLock<Arc<ContractTable>>; a refresh builds a new table
//                  off to the side and swaps the Arc in one write.
// - Lookups never fall back to the raw input: a miss is SymbolNotFound.
//
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::BrokerInstrument;
use crate::error::{BridgeError, Result};
use crate::metrics::{CONTRACT_REFRESH, CONTRACT_ROWS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEntry {
    pub canonical_symbol: String,
    pub canonical_exchange: String,
    pub broker_symbol: String,
    pub broker_exchange: String,
    pub broker_token: String,
    pub name: String,
    pub lot_size: u32,
    pub tick_size: Decimal,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<Decimal>,
    pub instrument_type: String,
}

impl ContractEntry {
    /// Plain equity row: lot 1, tick 0.01.
    pub fn equity(symbol: &str, exchange: &str, broker_symbol: &str, broker_exchange: &str, token: &str) -> Self {
        Self {
            canonical_symbol: symbol.to_string(),
            canonical_exchange: exchange.to_string(),
            broker_symbol: broker_symbol.to_string(),
            broker_exchange: broker_exchange.to_string(),
            broker_token: token.to_string(),
            name: String::new(),
            lot_size: 1,
            tick_size: Decimal::new(1, 2),
            expiry: None,
            strike: None,
            instrument_type: "EQ".to_string(),
        }
    }

    pub fn instrument(&self) -> BrokerInstrument {
        BrokerInstrument {
            broker_symbol: self.broker_symbol.clone(),
            broker_token: self.broker_token.clone(),
            broker_exchange: self.broker_exchange.clone(),
        }
    }

    /// Name of the first required field that is missing, if any.
    fn missing_field(&self) -> Option<&'static str> {
        let required = [
            ("canonical_symbol", &self.canonical_symbol),
            ("canonical_exchange", &self.canonical_exchange),
            ("broker_symbol", &self.broker_symbol),
            ("broker_exchange", &self.broker_exchange),
            ("broker_token", &self.broker_token),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Some(*name);
        }
        if self.lot_size == 0 {
            return Some("lot_size");
        }
        if self.tick_size <= Decimal::ZERO {
            return Some("tick_size");
        }
        None
    }

    fn normalized(mut self) -> Self {
        self.canonical_symbol = norm(&self.canonical_symbol);
        self.canonical_exchange = norm(&self.canonical_exchange);
        self.broker_symbol = self.broker_symbol.trim().to_string();
        self.broker_exchange = norm(&self.broker_exchange);
        self.broker_token = self.broker_token.trim().to_string();
        self
    }
}

fn norm(s: &str) -> String {
    s.trim().to_ascii_uppercase()
}

/// Immutable contract snapshot. Only constructed through `build`, which
/// enforces both uniqueness constraints.
#[derive(Debug, Default)]
pub struct ContractTable {
    entries: Vec<ContractEntry>,
    by_canonical: HashMap<(String, String), usize>,
    by_token: HashMap<(String, String), usize>,
    by_broker_symbol: HashMap<(String, String), usize>,
    by_symbol_only: HashMap<String, Vec<usize>>,
}

impl ContractTable {
    pub fn build(rows: Vec<ContractEntry>) -> Result<Self> {
        let mut t = ContractTable::default();
        for row in rows {
            let row = row.normalized();
            let idx = t.entries.len();
            let canon = (row.canonical_symbol.clone(), row.canonical_exchange.clone());
            if t.by_canonical.insert(canon, idx).is_some() {
                return Err(BridgeError::RefreshFailed(format!(
                    "duplicate canonical key {}:{}",
                    row.canonical_exchange, row.canonical_symbol
                )));
            }
            let token = (row.broker_token.clone(), row.broker_exchange.clone());
            if t.by_token.insert(token, idx).is_some() {
                return Err(BridgeError::RefreshFailed(format!(
                    "duplicate broker token {}|{}",
                    row.broker_exchange, row.broker_token
                )));
            }
            // broker symbol is not a key; first row wins for the direct index
            t.by_broker_symbol
                .entry((norm(&row.broker_symbol), row.broker_exchange.clone()))
                .or_insert(idx);
            t.by_symbol_only.entry(norm(&row.broker_symbol)).or_default().push(idx);
            t.entries.push(row);
        }
        Ok(t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ContractEntry] {
        &self.entries
    }

    pub fn get(&self, symbol: &str, exchange: &str) -> Option<&ContractEntry> {
        self.by_canonical
            .get(&(norm(symbol), norm(exchange)))
            .map(|&i| &self.entries[i])
    }

    pub fn by_token(&self, token: &str, broker_exchange: &str) -> Option<&ContractEntry> {
        self.by_token
            .get(&(token.trim().to_string(), norm(broker_exchange)))
            .map(|&i| &self.entries[i])
    }

    pub fn by_broker_symbol(&self, broker_symbol: &str, broker_exchange: &str) -> Option<&ContractEntry> {
        self.by_broker_symbol
            .get(&(norm(broker_symbol), norm(broker_exchange)))
            .map(|&i| &self.entries[i])
    }
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub accepted: usize,
    pub skipped: usize,
    pub table_size: usize,
    pub refreshed_at: DateTime<Utc>,
}

/// Master-contract collaborator: one call, the broker's full instrument set.
#[async_trait]
pub trait ContractSource: Send + Sync {
    async fn fetch_contracts(&self) -> Result<Vec<ContractEntry>>;
}

pub struct SymbolCache {
    broker: String,
    table: RwLock<Arc<ContractTable>>,
    last_refresh: RwLock<Option<RefreshReport>>,
}

impl SymbolCache {
    pub fn new(broker: &str) -> Self {
        Self {
            broker: broker.to_string(),
            table: RwLock::new(Arc::new(ContractTable::default())),
            last_refresh: RwLock::new(None),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Current table; the read lock is held only for the Arc clone.
    pub fn snapshot(&self) -> Arc<ContractTable> {
        match self.table.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn last_refresh(&self) -> Option<RefreshReport> {
        self.last_refresh.read().ok().and_then(|g| g.clone())
    }

    pub fn contract(&self, symbol: &str, exchange: &str) -> Result<ContractEntry> {
        self.snapshot()
            .get(symbol, exchange)
            .cloned()
            .ok_or_else(|| BridgeError::symbol_not_found(symbol, exchange))
    }

    pub fn resolve_to_broker(&self, symbol: &str, exchange: &str) -> Result<BrokerInstrument> {
        self.contract(symbol, exchange).map(|c| c.instrument())
    }

    /// Token first, then broker symbol, within `broker_exchange`.
    pub fn resolve_to_canonical(&self, token_or_symbol: &str, broker_exchange: &str) -> Result<(String, String)> {
        let table = self.snapshot();
        table
            .by_token(token_or_symbol, broker_exchange)
            .or_else(|| table.by_broker_symbol(token_or_symbol, broker_exchange))
            .map(|c| (c.canonical_symbol.clone(), c.canonical_exchange.clone()))
            .ok_or_else(|| BridgeError::symbol_not_found(token_or_symbol, broker_exchange))
    }

    /// For payloads that carry a broker symbol but no exchange.
    pub fn resolve_broker_symbol(&self, broker_symbol: &str) -> Result<(String, String)> {
        let table = self.snapshot();
        let hits = table.by_symbol_only.get(&norm(broker_symbol));
        match hits.map(|v| v.as_slice()) {
            Some([one]) => {
                let c = &table.entries[*one];
                Ok((c.canonical_symbol.clone(), c.canonical_exchange.clone()))
            }
            Some(many) if !many.is_empty() => Err(BridgeError::AmbiguousSymbol {
                symbol: broker_symbol.to_string(),
                exchanges: many.iter().map(|&i| table.entries[i].canonical_exchange.clone()).collect(),
            }),
            _ => Err(BridgeError::symbol_not_found(broker_symbol, "*")),
        }
    }

    /// Case-insensitive match on canonical symbol (prefix first) and name.
    pub fn search(&self, query: &str, limit: usize) -> Vec<ContractEntry> {
        let q = norm(query);
        if q.is_empty() || limit == 0 {
            return Vec::new();
        }
        let table = self.snapshot();
        let mut prefix: Vec<&ContractEntry> = Vec::new();
        let mut other: Vec<&ContractEntry> = Vec::new();
        for c in table.entries() {
            if c.canonical_symbol.starts_with(&q) {
                prefix.push(c);
            } else if c.canonical_symbol.contains(&q) || c.name.to_ascii_uppercase().contains(&q) {
                other.push(c);
            }
        }
        prefix.sort_by(|a, b| a.canonical_symbol.len().cmp(&b.canonical_symbol.len()).then(a.canonical_symbol.cmp(&b.canonical_symbol)));
        prefix.into_iter().chain(other).take(limit).cloned().collect()
    }

    /// Validates and swaps in a complete table. Rows missing required fields
    /// are skipped; no valid rows or a key collision fail the whole swap and
    /// the previous table stays.
    pub fn replace(&self, rows: Vec<ContractEntry>) -> Result<RefreshReport> {
        let total = rows.len();
        let mut valid = Vec::with_capacity(total);
        for row in rows {
            match row.missing_field() {
                None => valid.push(row),
                Some(field) => debug!(broker = %self.broker, symbol = %row.canonical_symbol, field, "contract row skipped"),
            }
        }
        let skipped = total - valid.len();
        if valid.is_empty() {
            return Err(BridgeError::RefreshFailed(format!(
                "no valid contract rows ({total} received, {skipped} skipped)"
            )));
        }
        let table = Arc::new(ContractTable::build(valid)?);
        let report = RefreshReport {
            accepted: table.len(),
            skipped,
            table_size: table.len(),
            refreshed_at: Utc::now(),
        };
        match self.table.write() {
            Ok(mut g) => *g = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
        if let Ok(mut g) = self.last_refresh.write() {
            *g = Some(report.clone());
        }
        if skipped > 0 {
            warn!(broker = %self.broker, skipped, "contract rows with missing fields skipped");
        }
        Ok(report)
    }

    /// Fetch + replace. Any failure leaves the current table untouched.
    pub async fn refresh(&self, source: &dyn ContractSource) -> Result<RefreshReport> {
        let outcome = match source.fetch_contracts().await {
            Ok(rows) => self.replace(rows),
            Err(e) => Err(BridgeError::RefreshFailed(e.to_string())),
        };
        match &outcome {
            Ok(r) => {
                CONTRACT_REFRESH.with_label_values(&[self.broker.as_str(), "ok"]).inc();
                CONTRACT_ROWS.with_label_values(&[self.broker.as_str()]).set(r.table_size as i64);
                info!(broker = %self.broker, rows = r.accepted, skipped = r.skipped, "master contract refreshed");
            }
            Err(e) => {
                CONTRACT_REFRESH.with_label_values(&[self.broker.as_str(), "error"]).inc();
                error!(broker = %self.broker, error = %e, kept = self.len(), "master contract refresh failed, keeping previous table");
            }
        }
        outcome
    }
}

/// Periodic refresher. Failures are logged and the loop keeps going.
pub fn spawn_refresh_task(cache: Arc<SymbolCache>, source: Arc<dyn ContractSource>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately; the caller already refreshed once
        tick.tick().await;
        loop {
            tick.tick().await;
            let _ = cache.refresh(source.as_ref()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<ContractEntry> {
        vec![
            ContractEntry::equity("AAPL", "NASDAQ", "AAPL-EQ", "NSQ", "1001"),
            ContractEntry::equity("IBM", "NYSE", "IBM-EQ", "NYS", "2001"),
        ]
    }

    #[test]
    fn resolves_both_directions() {
        let cache = SymbolCache::new("t");
        cache.replace(rows()).unwrap();
        let bi = cache.resolve_to_broker("aapl", "nasdaq").unwrap();
        assert_eq!(bi.broker_token, "1001");
        assert_eq!(cache.resolve_to_canonical("1001", "NSQ").unwrap(), ("AAPL".into(), "NASDAQ".into()));
        assert_eq!(cache.resolve_to_canonical("IBM-EQ", "nys").unwrap(), ("IBM".into(), "NYSE".into()));
        assert!(matches!(cache.resolve_to_canonical("1001", "NYS"), Err(BridgeError::SymbolNotFound { .. })));
    }

    #[test]
    fn duplicate_token_is_rejected() {
        let mut r = rows();
        r.push(ContractEntry::equity("AAPL2", "NASDAQ", "AAPL2", "NSQ", "1001"));
        assert!(matches!(ContractTable::build(r), Err(BridgeError::RefreshFailed(_))));
    }

    #[test]
    fn rows_with_missing_fields_are_skipped() {
        let cache = SymbolCache::new("t");
        let mut r = rows();
        r.push(ContractEntry::equity("MSFT", "NASDAQ", "MSFT", "NSQ", ""));
        let report = cache.replace(r).unwrap();
        assert_eq!((report.accepted, report.skipped), (2, 1));
        assert!(cache.contract("MSFT", "NASDAQ").is_err());
    }

    #[test]
    fn ambiguous_broker_symbol() {
        let cache = SymbolCache::new("t");
        cache
            .replace(vec![
                ContractEntry::equity("XYZ", "NASDAQ", "XYZ", "NSQ", "1"),
                ContractEntry::equity("XYZ", "NYSE", "XYZ", "NYS", "2"),
                ContractEntry::equity("ABC", "NYSE", "ABC", "NYS", "3"),
            ])
            .unwrap();
        assert!(matches!(cache.resolve_broker_symbol("xyz"), Err(BridgeError::AmbiguousSymbol { .. })));
        assert_eq!(cache.resolve_broker_symbol("ABC").unwrap().1, "NYSE");
        assert!(matches!(cache.resolve_broker_symbol("NOPE"), Err(BridgeError::SymbolNotFound { .. })));
    }

    #[test]
    fn search_prefers_prefix_matches() {
        let cache = SymbolCache::new("t");
        let mut r = rows();
        let mut hooli = ContractEntry::equity("HOOL", "NASDAQ", "HOOL", "NSQ", "9");
        hooli.name = "Apple Hooli Corp".into();
        r.push(hooli);
        cache.replace(r).unwrap();
        let hits: Vec<String> = cache.search("a", 10).into_iter().map(|c| c.canonical_symbol).collect();
        assert_eq!(hits, vec!["AAPL".to_string(), "HOOL".to_string()]);
        assert!(cache.search("a", 0).is_empty());
    }
}
