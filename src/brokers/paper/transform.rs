// ===============================
// src/brokers/paper/transform.rs
// ===============================
//
// Canonical <-> paper venue codes. Token based: every inbound record is
// resolved through (token, venue exchange).
//
use rust_decimal::Decimal;

use super::types::{
    PaperFill, PaperFunds, PaperHolding, PaperModifyRequest, PaperOrder, PaperOrderEvent, PaperOrderRequest,
    PaperPosition, PaperQuote,
};
use crate::domain::{
    CanonicalOrder, Funds, Holding, OrderRecord, OrderStatus, OrderType, OrderUpdate, Position, ProductType, Quote,
    Side, Trade, Validity,
};
use crate::error::Result;
use crate::symbols::SymbolCache;
use crate::transform::{prepare_order, BrokerVocabulary, OrderChanges, StatusTable, VocabTable};

/// Venue exchange code -> canonical exchange.
pub fn canonical_exchange(exch: &str) -> Option<&'static str> {
    match exch.trim().to_ascii_uppercase().as_str() {
        "NSQ" => Some("NASDAQ"),
        "NYS" => Some("NYSE"),
        "ASE" => Some("AMEX"),
        _ => None,
    }
}

pub fn vocabulary() -> Result<BrokerVocabulary> {
    Ok(BrokerVocabulary {
        side: VocabTable::new("side", &[(Side::Buy, Some("B")), (Side::Sell, Some("S"))])?,
        order_type: VocabTable::new(
            "order type",
            &[
                (OrderType::Market, Some("MKT")),
                (OrderType::Limit, Some("LMT")),
                (OrderType::Stop, Some("SL-MKT")),
                (OrderType::StopLimit, Some("SL-LMT")),
            ],
        )?,
        product: VocabTable::new(
            "product",
            &[(ProductType::Cnc, Some("C")), (ProductType::Mis, Some("I")), (ProductType::Nrml, Some("M"))],
        )?,
        validity: VocabTable::new(
            "validity",
            &[(Validity::Day, Some("DAY")), (Validity::Ioc, Some("IOC")), (Validity::Gtc, None), (Validity::Fok, None)],
        )?,
        status: StatusTable::new(
            "paper",
            &[
                ("pending", OrderStatus::Pending),
                ("trigger_pending", OrderStatus::Pending),
                ("open", OrderStatus::Open),
                ("complete", OrderStatus::Complete),
                ("canceled", OrderStatus::Cancelled),
                ("rejected", OrderStatus::Rejected),
            ],
        )?,
    })
}

pub fn to_broker_order(
    order: &CanonicalOrder,
    uid: &str,
    cache: &SymbolCache,
    vocab: &BrokerVocabulary,
) -> Result<PaperOrderRequest> {
    let contract = prepare_order(order, cache)?;
    vocab.check(order)?;
    Ok(PaperOrderRequest {
        uid: uid.to_string(),
        exch: contract.broker_exchange,
        tsym: contract.broker_symbol,
        qty: order.quantity,
        prc: if order.order_type.needs_price() { order.price } else { Decimal::ZERO },
        trgprc: if order.order_type.needs_trigger() { order.trigger_price } else { Decimal::ZERO },
        dscqty: order.disclosed_quantity,
        prd: vocab.product.to_broker(order.product)?.to_string(),
        trantype: vocab.side.to_broker(order.side)?.to_string(),
        prctyp: vocab.order_type.to_broker(order.order_type)?.to_string(),
        ret: vocab.validity.to_broker(order.validity)?.to_string(),
        remarks: order.client_tag.clone(),
    })
}

/// Every mutable field can change here, the order type included.
pub fn to_modify_request(changes: &OrderChanges, vocab: &BrokerVocabulary) -> Result<PaperModifyRequest> {
    Ok(PaperModifyRequest {
        qty: changes.quantity,
        prc: changes.price,
        trgprc: changes.trigger_price,
        prctyp: changes.order_type.map(|t| vocab.order_type.to_broker(t).map(str::to_string)).transpose()?,
        ret: changes.validity.map(|v| vocab.validity.to_broker(v).map(str::to_string)).transpose()?,
        dscqty: changes.disclosed_quantity,
    })
}

pub fn from_broker_order(o: &PaperOrder, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<OrderRecord> {
    let (symbol, exchange) = cache.resolve_to_canonical(&o.token, &o.exch)?;
    let status = vocab.status.map(&o.status);
    let order = CanonicalOrder {
        symbol,
        exchange,
        side: vocab.side.from_broker(&o.trantype)?,
        order_type: vocab.order_type.from_broker(&o.prctyp)?,
        quantity: o.qty,
        price: o.prc,
        trigger_price: o.trgprc,
        disclosed_quantity: o.dscqty,
        product: vocab.product.from_broker(&o.prd)?,
        validity: vocab.validity.from_broker(&o.ret)?,
        client_tag: o.remarks.clone(),
    };
    let pending = if status.is_working() { o.qty.saturating_sub(o.fillshares) } else { 0 };
    Ok(OrderRecord {
        order_id: o.norenordno.clone(),
        order,
        status,
        filled_quantity: o.fillshares,
        pending_quantity: pending,
        average_price: o.avgprc,
        rejection_reason: o.rejreason.clone(),
        updated_at: Some(o.norentm),
    })
}

pub fn trade_from_fill(f: &PaperFill, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<Trade> {
    let (symbol, exchange) = cache.resolve_to_canonical(&f.token, &f.exch)?;
    Ok(Trade {
        trade_id: f.flid.clone(),
        order_id: f.norenordno.clone(),
        symbol,
        exchange,
        side: vocab.side.from_broker(&f.trantype)?,
        quantity: f.flqty,
        price: f.flprc,
        product: vocab.product.from_broker(&f.prd)?,
        timestamp: Some(f.fltm),
    })
}

pub fn position_from(p: &PaperPosition, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<Position> {
    let (symbol, exchange) = cache.resolve_to_canonical(&p.token, &p.exch)?;
    Ok(Position {
        symbol,
        exchange,
        product: vocab.product.from_broker(&p.prd)?,
        quantity: p.netqty,
        average_price: p.netavgprc,
        ltp: p.lp,
        realized_pnl: p.rpnl,
        unrealized_pnl: p.urmtom,
    })
}

pub fn holding_from(h: &PaperHolding, cache: &SymbolCache) -> Result<Holding> {
    let (symbol, exchange) = cache.resolve_to_canonical(&h.token, &h.exch)?;
    let qty = Decimal::from(h.holdqty);
    let mark = h.lp.unwrap_or(h.upldprc);
    Ok(Holding {
        symbol,
        exchange,
        quantity: h.holdqty,
        average_price: h.upldprc,
        ltp: h.lp,
        market_value: (mark * qty).round_dp(2),
        pnl: ((mark - h.upldprc) * qty).round_dp(2),
    })
}

pub fn funds_from(f: &PaperFunds) -> Funds {
    Funds {
        available_cash: (f.cash - f.marginused).round_dp(2),
        collateral: Decimal::ZERO,
        utilised_debits: f.marginused.round_dp(2),
        m2m_unrealized: f.urmtom.round_dp(2),
        m2m_realized: f.rpnl.round_dp(2),
    }
}

pub fn quote_from(q: &PaperQuote, cache: &SymbolCache) -> Result<Quote> {
    let (symbol, exchange) = cache.resolve_to_canonical(&q.token, &q.exch)?;
    Ok(Quote {
        symbol,
        exchange,
        ltp: Some(q.lp),
        bid: Some(q.bp1),
        ask: Some(q.sp1),
        bid_qty: q.bq1,
        ask_qty: q.sq1,
        open: Some(q.o),
        high: Some(q.h),
        low: Some(q.l),
        prev_close: Some(q.c),
        volume: q.v,
        timestamp: Some(q.ft),
    })
}

pub fn order_update_from(ev: &PaperOrderEvent, cache: &SymbolCache, vocab: &BrokerVocabulary) -> Result<OrderUpdate> {
    let (symbol, exchange) = cache.resolve_to_canonical(&ev.token, &ev.exch)?;
    Ok(OrderUpdate {
        order_id: ev.norenordno.clone(),
        symbol,
        exchange,
        status: vocab.status.map(&ev.status),
        event: ev.reporttype.to_ascii_lowercase(),
        filled_quantity: ev.fillshares,
        average_price: ev.avgprc,
        timestamp: Some(ev.ft),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::symbols::ContractEntry;
    use rust_decimal_macros::dec;

    fn cache() -> SymbolCache {
        let c = SymbolCache::new("paper");
        c.replace(vec![ContractEntry::equity("AAPL", "NASDAQ", "AAPL-EQ", "NSQ", "1001")]).unwrap();
        c
    }

    #[test]
    fn stop_limit_payload_uses_venue_codes() {
        let v = vocabulary().unwrap();
        let o = CanonicalOrder {
            order_type: OrderType::StopLimit,
            trigger_price: dec!(189.50),
            product: ProductType::Mis,
            validity: Validity::Ioc,
            ..CanonicalOrder::limit("AAPL", "NASDAQ", Side::Sell, 3, dec!(189.00))
        };
        let req = to_broker_order(&o, "U1", &cache(), &v).unwrap();
        assert_eq!((req.exch.as_str(), req.tsym.as_str()), ("NSQ", "AAPL-EQ"));
        assert_eq!((req.trantype.as_str(), req.prctyp.as_str(), req.prd.as_str(), req.ret.as_str()), ("S", "SL-LMT", "I", "IOC"));
        assert_eq!((req.prc, req.trgprc), (dec!(189.00), dec!(189.50)));
    }

    #[test]
    fn gtc_is_not_offered() {
        let v = vocabulary().unwrap();
        let o = CanonicalOrder { validity: Validity::Gtc, ..CanonicalOrder::market("AAPL", "NASDAQ", Side::Buy, 1) };
        assert!(matches!(to_broker_order(&o, "U1", &cache(), &v), Err(BridgeError::InvalidOrder(_))));
    }

    #[test]
    fn unknown_status_passes_through_uppercased() {
        let v = vocabulary().unwrap();
        let o: PaperOrder = serde_json::from_value(serde_json::json!({
            "norenordno": "PO00000001", "exch": "NSQ", "tsym": "AAPL-EQ", "token": "1001",
            "qty": 10, "prc": "0", "trgprc": "0", "dscqty": 0, "prd": "C", "trantype": "B",
            "prctyp": "MKT", "ret": "DAY", "status": "after_market_queued", "fillshares": 0,
            "avgprc": "0", "norentm": "2024-03-01T15:30:00Z"
        }))
        .unwrap();
        let rec = from_broker_order(&o, &cache(), &v).unwrap();
        assert_eq!(rec.status, OrderStatus::Unmapped("AFTER_MARKET_QUEUED".into()));
        assert_eq!((rec.order.symbol.as_str(), rec.order.exchange.as_str()), ("AAPL", "NASDAQ"));
    }

    #[test]
    fn funds_net_out_blocked_margin() {
        let f = funds_from(&PaperFunds {
            stat: "Ok".into(),
            cash: dec!(10000),
            marginused: dec!(1234.567),
            urmtom: dec!(12.5),
            rpnl: dec!(-3),
        });
        assert_eq!(f.available_cash, dec!(8765.43));
        assert_eq!(f.utilised_debits, dec!(1234.57));
        assert_eq!((f.m2m_unrealized, f.m2m_realized), (dec!(12.5), dec!(-3)));
    }
}
