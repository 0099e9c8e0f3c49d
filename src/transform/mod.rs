// ===============================
// src/transform/mod.rs
// ===============================
//
// Broker-independent half of the transform pipeline:
// - VocabTable / StatusTable: explicit per-broker enum tables, checked for
//   completeness when the adapter is built.
// - validate_against: lot / tick checks that need the contract.
// - reconcile: desired vs current order for modify.
// - map_rows: per-row book mapping that skips unlisted instruments.
//
// Broker-specific payload shaping lives next to each broker.
//
pub mod num;

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::{
    CanonicalCode, CanonicalOrder, OrderStatus, OrderType, ProductType, Side, Validity,
};
use crate::error::{BridgeError, Result};
use crate::metrics::{UNMAPPED_STATUS, UNMAPPED_SYMBOL};
use crate::symbols::{ContractEntry, SymbolCache};

/// Total canonical -> broker table for one enum. `None` marks a value the
/// broker does not offer; using it is an `InvalidOrder`, not a fallback.
#[derive(Debug, Clone)]
pub struct VocabTable<T: CanonicalCode> {
    kind: &'static str,
    to_broker: Vec<Option<&'static str>>,
    from_broker: HashMap<String, T>,
}

impl<T: CanonicalCode> VocabTable<T> {
    pub fn new(kind: &'static str, entries: &[(T, Option<&'static str>)]) -> Result<Self> {
        let mut to_broker: Vec<Option<Option<&'static str>>> = vec![None; T::ALL.len()];
        let mut from_broker = HashMap::new();
        for (value, code) in entries {
            let slot = &mut to_broker[value.position()];
            if slot.is_some() {
                return Err(BridgeError::Configuration(format!("{kind}: {} mapped twice", value.as_str())));
            }
            *slot = Some(*code);
            if let Some(code) = code {
                if from_broker.insert(code.to_ascii_lowercase(), *value).is_some() {
                    return Err(BridgeError::Configuration(format!("{kind}: broker code '{code}' used twice")));
                }
            }
        }
        let mut complete = Vec::with_capacity(T::ALL.len());
        for (i, slot) in to_broker.into_iter().enumerate() {
            match slot {
                Some(code) => complete.push(code),
                None => {
                    return Err(BridgeError::Configuration(format!(
                        "{kind}: no entry for {}",
                        T::ALL[i].as_str()
                    )))
                }
            }
        }
        Ok(Self { kind, to_broker: complete, from_broker })
    }

    /// Extra broker spelling understood on the way in only.
    pub fn alias(mut self, code: &str, value: T) -> Self {
        self.from_broker.entry(code.to_ascii_lowercase()).or_insert(value);
        self
    }

    pub fn to_broker(&self, value: T) -> Result<&'static str> {
        self.to_broker
            .get(value.position())
            .copied()
            .flatten()
            .ok_or_else(|| BridgeError::InvalidOrder(format!("{} {} is not offered by this broker", self.kind, value.as_str())))
    }

    pub fn from_broker(&self, code: &str) -> Result<T> {
        self.from_broker
            .get(&code.trim().to_ascii_lowercase())
            .copied()
            .ok_or_else(|| BridgeError::Decode(format!("unknown {} '{}'", self.kind, code)))
    }

    pub fn supports(&self, value: T) -> bool {
        self.to_broker(value).is_ok()
    }
}

/// Broker status -> canonical status. Unknown codes come back as
/// `Unmapped(UPPERCASE)` and are logged + counted.
#[derive(Debug, Clone)]
pub struct StatusTable {
    broker: String,
    map: HashMap<String, OrderStatus>,
}

impl StatusTable {
    pub fn new(broker: &str, entries: &[(&str, OrderStatus)]) -> Result<Self> {
        let mut map = HashMap::new();
        for (code, status) in entries {
            if status.is_unmapped() {
                return Err(BridgeError::Configuration(format!("status '{code}' mapped to an unmapped status")));
            }
            if map.insert(code.trim().to_ascii_lowercase(), status.clone()).is_some() {
                return Err(BridgeError::Configuration(format!("status '{code}' listed twice")));
            }
        }
        Ok(Self { broker: broker.to_string(), map })
    }

    pub fn map(&self, raw: &str) -> OrderStatus {
        if let Some(s) = self.map.get(&raw.trim().to_ascii_lowercase()) {
            return s.clone();
        }
        let upper = raw.trim().to_ascii_uppercase();
        warn!(broker = %self.broker, status = %upper, "unmapped broker order status, passing through");
        UNMAPPED_STATUS.with_label_values(&[self.broker.as_str(), upper.as_str()]).inc();
        OrderStatus::Unmapped(upper)
    }
}

/// Every translation table one broker needs.
#[derive(Debug, Clone)]
pub struct BrokerVocabulary {
    pub side: VocabTable<Side>,
    pub order_type: VocabTable<OrderType>,
    pub product: VocabTable<ProductType>,
    pub validity: VocabTable<Validity>,
    pub status: StatusTable,
}

impl BrokerVocabulary {
    /// Rejects canonical values this broker cannot express, before any I/O.
    pub fn check(&self, order: &CanonicalOrder) -> Result<()> {
        self.side.to_broker(order.side)?;
        self.order_type.to_broker(order.order_type)?;
        self.product.to_broker(order.product)?;
        self.validity.to_broker(order.validity)?;
        Ok(())
    }
}

/// Lot and tick checks against the instrument's contract.
pub fn validate_against(order: &CanonicalOrder, contract: &ContractEntry) -> Result<()> {
    let lot = u64::from(contract.lot_size.max(1));
    if order.quantity % lot != 0 {
        return Err(BridgeError::InvalidOrder(format!(
            "quantity {} is not a multiple of lot size {lot}",
            order.quantity
        )));
    }
    for (field, px) in [("price", order.price), ("trigger_price", order.trigger_price)] {
        if !px.is_zero() && !on_tick(px, contract.tick_size) {
            return Err(BridgeError::InvalidOrder(format!(
                "{field} {px} is not a multiple of tick size {}",
                contract.tick_size
            )));
        }
    }
    Ok(())
}

fn on_tick(px: Decimal, tick: Decimal) -> bool {
    tick <= Decimal::ZERO || (px % tick).is_zero()
}

/// Common front half of every `to_broker_order`: canonical checks,
/// contract lookup (SymbolNotFound propagates), lot / tick checks.
pub fn prepare_order(order: &CanonicalOrder, cache: &SymbolCache) -> Result<ContractEntry> {
    order.validate()?;
    let contract = cache.contract(&order.symbol, &order.exchange)?;
    validate_against(order, &contract)?;
    Ok(contract)
}

/// Mutable-field delta for a modify. Empty means nothing to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderChanges {
    pub quantity: Option<u64>,
    pub order_type: Option<OrderType>,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub disclosed_quantity: Option<u64>,
    pub validity: Option<Validity>,
}

impl OrderChanges {
    pub fn is_empty(&self) -> bool {
        *self == OrderChanges::default()
    }
}

/// Desired state vs the broker's current record. Symbol, exchange, side and
/// product are fixed once an order exists.
pub fn reconcile(current: &CanonicalOrder, desired: &CanonicalOrder) -> Result<OrderChanges> {
    let fixed = [
        ("symbol", current.symbol.eq_ignore_ascii_case(&desired.symbol)),
        ("exchange", current.exchange.eq_ignore_ascii_case(&desired.exchange)),
        ("side", current.side == desired.side),
        ("product", current.product == desired.product),
    ];
    if let Some((field, _)) = fixed.iter().find(|(_, same)| !same) {
        return Err(BridgeError::InvalidOrder(format!("{field} cannot change on modify")));
    }
    desired.validate()?;

    fn diff<T: PartialEq + Copy>(a: T, b: T) -> Option<T> {
        (a != b).then_some(b)
    }
    Ok(OrderChanges {
        quantity: diff(current.quantity, desired.quantity),
        order_type: diff(current.order_type, desired.order_type),
        price: diff(current.price, desired.price),
        trigger_price: diff(current.trigger_price, desired.trigger_price),
        disclosed_quantity: diff(current.disclosed_quantity, desired.disclosed_quantity),
        validity: diff(current.validity, desired.validity),
    })
}

/// Maps broker book rows one at a time. A row whose instrument is not in
/// the contract table is skipped with a warning and counted; any other
/// error fails the call.
pub fn map_rows<T, R>(
    broker: &str,
    kind: &str,
    rows: impl IntoIterator<Item = T>,
    mut f: impl FnMut(T) -> Result<R>,
) -> Result<Vec<R>> {
    let mut out = Vec::new();
    for row in rows {
        match f(row) {
            Ok(r) => out.push(r),
            Err(e @ (BridgeError::SymbolNotFound { .. } | BridgeError::AmbiguousSymbol { .. })) => {
                UNMAPPED_SYMBOL.with_label_values(&[broker, kind]).inc();
                warn!(broker = %broker, kind = %kind, error = %e, "row skipped, instrument not in contract table");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn map_rows_skips_only_unlisted_instruments() {
        let rows = ["AAPL", "GONE", "IBM"];
        let kept = map_rows("test", "order", rows, |s| {
            if s == "GONE" {
                Err(BridgeError::symbol_not_found(s, "*"))
            } else {
                Ok(s.to_string())
            }
        })
        .unwrap();
        assert_eq!(kept, vec!["AAPL".to_string(), "IBM".to_string()]);

        let err = map_rows("test", "order", rows, |s| {
            if s == "IBM" {
                Err(BridgeError::Decode("unknown side 'x'".into()))
            } else {
                Ok(s)
            }
        });
        assert!(matches!(err, Err(BridgeError::Decode(_))));
    }

    #[test]
    fn incomplete_table_is_a_construction_error() {
        let err = VocabTable::new("side", &[(Side::Buy, Some("buy"))]).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(m) if m.contains("SELL")));
    }

    #[test]
    fn unsupported_value_is_invalid_order() {
        let t = VocabTable::new(
            "validity",
            &[
                (Validity::Day, Some("DAY")),
                (Validity::Gtc, None),
                (Validity::Ioc, Some("IOC")),
                (Validity::Fok, None),
            ],
        )
        .unwrap();
        assert_eq!(t.to_broker(Validity::Day).unwrap(), "DAY");
        assert!(matches!(t.to_broker(Validity::Gtc), Err(BridgeError::InvalidOrder(_))));
        assert_eq!(t.from_broker("ioc").unwrap(), Validity::Ioc);
        assert!(t.from_broker("GTC").is_err());
    }

    #[test]
    fn status_passthrough_is_uppercased() {
        let t = StatusTable::new("t", &[("filled", OrderStatus::Complete)]).unwrap();
        assert_eq!(t.map("FILLED"), OrderStatus::Complete);
        assert_eq!(t.map("unknown_status"), OrderStatus::Unmapped("UNKNOWN_STATUS".into()));
    }

    #[test]
    fn lot_and_tick_checks() {
        let mut c = ContractEntry::equity("X", "NSE", "X-EQ", "NSE", "1");
        c.lot_size = 25;
        c.tick_size = dec!(0.05);
        let mut o = CanonicalOrder::limit("X", "NSE", Side::Buy, 50, dec!(101.35));
        assert!(validate_against(&o, &c).is_ok());
        o.quantity = 30;
        assert!(validate_against(&o, &c).is_err());
        o.quantity = 25;
        o.price = dec!(101.33);
        assert!(validate_against(&o, &c).is_err());
    }

    #[test]
    fn reconcile_sends_only_changes() {
        let cur = CanonicalOrder::limit("AAPL", "NASDAQ", Side::Buy, 10, dec!(150));
        assert!(reconcile(&cur, &cur).unwrap().is_empty());

        let want = CanonicalOrder { price: dec!(151), quantity: 12, ..cur.clone() };
        let ch = reconcile(&cur, &want).unwrap();
        assert_eq!(ch.price, Some(dec!(151)));
        assert_eq!(ch.quantity, Some(12));
        assert_eq!(ch.order_type, None);

        let flip = CanonicalOrder { side: Side::Sell, ..cur.clone() };
        assert!(matches!(reconcile(&cur, &flip), Err(BridgeError::InvalidOrder(_))));
    }
}
