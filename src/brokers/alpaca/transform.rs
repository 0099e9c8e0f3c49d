// ===============================
// src/brokers/alpaca/transform.rs
// ===============================
//
// Canonical <-> Alpaca. Pure functions over the vocabulary tables and the
// mapping cache; no I/O.
//
use rust_decimal::Decimal;

use super::types::{
    AlpacaAccount, AlpacaOrder, AlpacaOrderRequest, AlpacaPosition, AlpacaReplaceRequest, AlpacaSnapshot,
    TradeUpdate,
};
use crate::adapter::IMPLICIT_PRODUCT;
use crate::domain::{
    CanonicalOrder, Funds, Holding, OrderRecord, OrderStatus, OrderType, OrderUpdate, Position, ProductType,
    Quote, Side, Trade, Validity,
};
use crate::error::{BridgeError, Result};
use crate::symbols::SymbolCache;
use crate::transform::num::format_decimal;
use crate::transform::{prepare_order, BrokerVocabulary, OrderChanges, StatusTable, VocabTable};

pub fn vocabulary() -> Result<BrokerVocabulary> {
    Ok(BrokerVocabulary {
        side: VocabTable::new("side", &[(Side::Buy, Some("buy")), (Side::Sell, Some("sell"))])?,
        order_type: VocabTable::new(
            "order type",
            &[
                (OrderType::Market, Some("market")),
                (OrderType::Limit, Some("limit")),
                (OrderType::Stop, Some("stop")),
                (OrderType::StopLimit, Some("stop_limit")),
            ],
        )?
        .alias("trailing_stop", OrderType::Stop),
        // no product concept; everything is a cash account order
        product: VocabTable::new(
            "product",
            &[(ProductType::Cnc, Some("cash")), (ProductType::Mis, None), (ProductType::Nrml, None)],
        )?,
        validity: VocabTable::new(
            "validity",
            &[
                (Validity::Day, Some("day")),
                (Validity::Gtc, Some("gtc")),
                (Validity::Ioc, Some("ioc")),
                (Validity::Fok, Some("fok")),
            ],
        )?
        .alias("opg", Validity::Day)
        .alias("cls", Validity::Day),
        status: StatusTable::new(
            "alpaca",
            &[
                ("new", OrderStatus::Pending),
                ("pending_new", OrderStatus::Pending),
                ("pending_cancel", OrderStatus::Pending),
                ("pending_replace", OrderStatus::Pending),
                ("accepted", OrderStatus::Open),
                ("accepted_for_bidding", OrderStatus::Open),
                ("calculated", OrderStatus::Open),
                ("partially_filled", OrderStatus::Open),
                ("filled", OrderStatus::Complete),
                ("done_for_day", OrderStatus::Cancelled),
                ("canceled", OrderStatus::Cancelled),
                ("expired", OrderStatus::Cancelled),
                ("replaced", OrderStatus::Cancelled),
                ("stopped", OrderStatus::Cancelled),
                ("suspended", OrderStatus::Cancelled),
                ("rejected", OrderStatus::Rejected),
            ],
        )?,
    })
}

/// Canonical order -> POST /v2/orders body. SymbolNotFound and unsupported
/// vocabulary surface before anything is sent.
pub fn to_broker_order(order: &CanonicalOrder, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<AlpacaOrderRequest> {
    let contract = prepare_order(order, cache)?;
    vocab.check(order)?;
    if order.disclosed_quantity > 0 {
        return Err(BridgeError::InvalidOrder("alpaca has no disclosed quantity".into()));
    }
    Ok(AlpacaOrderRequest {
        symbol: contract.broker_symbol,
        qty: order.quantity.to_string(),
        side: vocab.side.to_broker(order.side)?,
        order_type: vocab.order_type.to_broker(order.order_type)?,
        time_in_force: vocab.validity.to_broker(order.validity)?,
        limit_price: order.order_type.needs_price().then(|| format_decimal(order.price)),
        stop_price: order.order_type.needs_trigger().then(|| format_decimal(order.trigger_price)),
        client_order_id: order.client_tag.clone(),
    })
}

/// Changed mutable fields -> PATCH body. The order type of a live order is
/// fixed on Alpaca.
pub fn to_replace_request(changes: &OrderChanges, vocab: &BrokerVocabulary) -> Result<AlpacaReplaceRequest> {
    if changes.order_type.is_some() {
        return Err(BridgeError::InvalidOrder("alpaca cannot change the type of a live order".into()));
    }
    if changes.disclosed_quantity.is_some_and(|q| q > 0) {
        return Err(BridgeError::InvalidOrder("alpaca has no disclosed quantity".into()));
    }
    Ok(AlpacaReplaceRequest {
        qty: changes.quantity.map(|q| q.to_string()),
        time_in_force: changes.validity.map(|v| vocab.validity.to_broker(v)).transpose()?,
        limit_price: changes.price.map(format_decimal),
        stop_price: changes.trigger_price.map(format_decimal),
    })
}

/// Alpaca payloads carry a symbol without an exchange.
fn canonical_instrument(cache: &SymbolCache, symbol: &str, exchange: &str) -> Result<(String, String)> {
    if exchange.is_empty() {
        cache.resolve_broker_symbol(symbol)
    } else {
        cache.resolve_to_canonical(symbol, exchange).or_else(|_| cache.resolve_broker_symbol(symbol))
    }
}

pub fn from_broker_order(o: &AlpacaOrder, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<OrderRecord> {
    let (symbol, exchange) = canonical_instrument(cache, &o.symbol, "")?;
    let status = vocab.status.map(&o.status);
    let order = CanonicalOrder {
        symbol,
        exchange,
        side: vocab.side.from_broker(&o.side)?,
        order_type: vocab.order_type.from_broker(&o.order_type)?,
        quantity: o.qty,
        price: o.limit_price.unwrap_or(Decimal::ZERO),
        trigger_price: o.stop_price.unwrap_or(Decimal::ZERO),
        disclosed_quantity: 0,
        product: IMPLICIT_PRODUCT,
        validity: vocab.validity.from_broker(&o.time_in_force)?,
        client_tag: o.client_order_id.clone(),
    };
    let pending = if status.is_working() { o.qty.saturating_sub(o.filled_qty) } else { 0 };
    Ok(OrderRecord {
        order_id: o.id.clone(),
        order,
        status,
        filled_quantity: o.filled_qty,
        pending_quantity: pending,
        average_price: o.filled_avg_price.unwrap_or(Decimal::ZERO),
        rejection_reason: None,
        updated_at: o.updated_at.or(o.created_at),
    })
}

/// Alpaca has no trade book; every order with fills stands in for one
/// aggregated trade.
pub fn trade_from_order(o: &AlpacaOrder, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<Option<Trade>> {
    if o.filled_qty == 0 {
        return Ok(None);
    }
    let (symbol, exchange) = canonical_instrument(cache, &o.symbol, "")?;
    Ok(Some(Trade {
        trade_id: o.id.clone(),
        order_id: o.id.clone(),
        symbol,
        exchange,
        side: vocab.side.from_broker(&o.side)?,
        quantity: o.filled_qty,
        price: o.filled_avg_price.unwrap_or(Decimal::ZERO),
        product: IMPLICIT_PRODUCT,
        timestamp: o.filled_at.or(o.updated_at),
    }))
}

pub fn position_from(p: &AlpacaPosition, cache: &SymbolCache) -> Result<Position> {
    let (symbol, exchange) = canonical_instrument(cache, &p.symbol, &p.exchange)?;
    Ok(Position {
        symbol,
        exchange,
        product: IMPLICIT_PRODUCT,
        quantity: p.qty,
        average_price: p.avg_entry_price,
        ltp: p.current_price,
        realized_pnl: Decimal::ZERO,
        unrealized_pnl: p.unrealized_pl,
    })
}

pub fn holding_from(p: &AlpacaPosition, cache: &SymbolCache) -> Result<Holding> {
    let (symbol, exchange) = canonical_instrument(cache, &p.symbol, &p.exchange)?;
    Ok(Holding {
        symbol,
        exchange,
        quantity: p.qty,
        average_price: p.avg_entry_price,
        ltp: p.current_price,
        market_value: p.market_value,
        pnl: p.unrealized_pl,
    })
}

pub fn funds_from(a: &AlpacaAccount) -> Funds {
    let unrealized = if a.equity > Decimal::ZERO && a.cash > Decimal::ZERO { a.equity - a.cash } else { Decimal::ZERO };
    let realized = if a.last_equity > Decimal::ZERO { a.equity - a.last_equity } else { Decimal::ZERO };
    Funds {
        available_cash: a.cash.round_dp(2),
        collateral: (a.buying_power - a.cash).round_dp(2),
        utilised_debits: a.initial_margin.round_dp(2),
        m2m_unrealized: unrealized.round_dp(2),
        m2m_realized: realized.round_dp(2),
    }
}

pub fn quote_from(symbol: &str, exchange: &str, s: &AlpacaSnapshot) -> Quote {
    let trade = s.latest_trade.clone().unwrap_or_default();
    let quote = s.latest_quote.clone().unwrap_or_default();
    let bar = s.daily_bar.clone().unwrap_or_default();
    Quote {
        symbol: symbol.to_string(),
        exchange: exchange.to_string(),
        ltp: trade.p,
        bid: quote.bp,
        ask: quote.ap,
        bid_qty: quote.bs,
        ask_qty: quote.as_,
        open: bar.o,
        high: bar.h,
        low: bar.l,
        prev_close: s.prev_daily_bar.as_ref().and_then(|b| b.c),
        volume: bar.v,
        timestamp: trade.t.or(quote.t),
    }
}

pub fn order_update_from(u: &TradeUpdate, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<OrderUpdate> {
    let (symbol, exchange) = canonical_instrument(cache, &u.order.symbol, "")?;
    Ok(OrderUpdate {
        order_id: u.order.id.clone(),
        symbol,
        exchange,
        status: vocab.status.map(&u.order.status),
        event: u.event.clone(),
        filled_quantity: u.order.filled_qty,
        average_price: u.order.filled_avg_price,
        timestamp: u.timestamp.or(u.order.updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::ContractEntry;
    use rust_decimal_macros::dec;

    fn cache() -> SymbolCache {
        let c = SymbolCache::new("alpaca");
        c.replace(vec![ContractEntry::equity("AAPL", "NASDAQ", "AAPL", "NASDAQ", "b0b6dd9d")]).unwrap();
        c
    }

    fn order_json(status: &str) -> AlpacaOrder {
        serde_json::from_value(serde_json::json!({
            "id": "ord-1",
            "client_order_id": "tag-1",
            "symbol": "AAPL",
            "qty": "10",
            "filled_qty": "4",
            "filled_avg_price": "190.05",
            "side": "buy",
            "type": "limit",
            "time_in_force": "day",
            "limit_price": "190.10",
            "stop_price": null,
            "status": status,
            "updated_at": "2024-03-01T15:30:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn limit_order_payload() {
        let v = vocabulary().unwrap();
        let o = CanonicalOrder::limit("AAPL", "NASDAQ", Side::Buy, 10, dec!(190.10)).with_tag("t1");
        let req = to_broker_order(&o, &cache(), &v).unwrap();
        assert_eq!(req.symbol, "AAPL");
        assert_eq!((req.side, req.order_type, req.time_in_force), ("buy", "limit", "day"));
        assert_eq!(req.limit_price.as_deref(), Some("190.1"));
        assert_eq!(req.stop_price, None);
        assert_eq!(req.qty, "10");
    }

    #[test]
    fn intraday_product_is_invalid() {
        let v = vocabulary().unwrap();
        let o = CanonicalOrder { product: ProductType::Mis, ..CanonicalOrder::market("AAPL", "NASDAQ", Side::Sell, 1) };
        assert!(matches!(to_broker_order(&o, &cache(), &v), Err(BridgeError::InvalidOrder(_))));
    }

    #[test]
    fn unknown_symbol_is_not_passed_through() {
        let v = vocabulary().unwrap();
        let o = CanonicalOrder::market("ZZZZ", "NASDAQ", Side::Buy, 1);
        assert!(matches!(to_broker_order(&o, &cache(), &v), Err(BridgeError::SymbolNotFound { .. })));
    }

    #[test]
    fn broker_order_maps_back() {
        let v = vocabulary().unwrap();
        let rec = from_broker_order(&order_json("partially_filled"), &cache(), &v).unwrap();
        assert_eq!(rec.status, OrderStatus::Open);
        assert_eq!((rec.filled_quantity, rec.pending_quantity), (4, 6));
        assert_eq!(rec.order.price, dec!(190.10));
        assert_eq!(rec.average_price, dec!(190.05));
        assert_eq!(rec.order.client_tag.as_deref(), Some("tag-1"));

        let done = from_broker_order(&order_json("replaced"), &cache(), &v).unwrap();
        assert_eq!(done.status, OrderStatus::Cancelled);
        assert_eq!(done.pending_quantity, 0);
    }

    #[test]
    fn replace_cannot_change_type() {
        let v = vocabulary().unwrap();
        let ch = OrderChanges { order_type: Some(OrderType::Market), ..OrderChanges::default() };
        assert!(to_replace_request(&ch, &v).is_err());
        let ch = OrderChanges { price: Some(dec!(191)), ..OrderChanges::default() };
        let body = serde_json::to_value(to_replace_request(&ch, &v).unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"limit_price": "191"}));
    }

    #[test]
    fn funds_follow_account_fields() {
        let a: AlpacaAccount = serde_json::from_value(serde_json::json!({
            "cash": "1000", "buying_power": "4000", "equity": "1250.5",
            "last_equity": "1200", "initial_margin": "10"
        }))
        .unwrap();
        let f = funds_from(&a);
        assert_eq!(f.available_cash, dec!(1000));
        assert_eq!(f.collateral, dec!(3000));
        assert_eq!(f.m2m_unrealized, dec!(250.5));
        assert_eq!(f.m2m_realized, dec!(50.5));
    }
}
