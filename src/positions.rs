// ===============================
// src/positions.rs (net positions from fills)
// ===============================
//
// position.quantity = signed sum of fills since the position was last flat.
// Average price is the cost of the open quantity; it resets when the
// position goes flat and restarts at the fill price when it flips.
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;

use crate::domain::{Position, ProductType, Side, Trade};

#[derive(Debug, Clone, Default, PartialEq)]
struct NetPosition {
    qty: i64,
    avg_px: Decimal,
    realized: Decimal,
    last_px: Option<Decimal>,
}

#[derive(Debug, Default)]
pub struct PositionTracker {
    // (symbol, exchange, product) -> position; order of first fill kept
    by_key: HashMap<(String, String, ProductType), NetPosition>,
    order: Vec<(String, String, ProductType)>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, symbol: &str, exchange: &str, product: ProductType, side: Side, qty: u64, px: Decimal) {
        let key = (symbol.to_ascii_uppercase(), exchange.to_ascii_uppercase(), product);
        if !self.by_key.contains_key(&key) {
            self.order.push(key.clone());
        }
        let entry = self.by_key.entry(key).or_default();
        let signed_qty = side.sign() * qty as i64;
        let prev_qty = entry.qty;
        let new_qty = prev_qty + signed_qty;
        entry.last_px = Some(px);

        if prev_qty == 0 || prev_qty.signum() == signed_qty.signum() {
            // same direction -> weighted average cost
            let open = Decimal::from(prev_qty.abs());
            let add = Decimal::from(signed_qty.abs());
            entry.avg_px = if prev_qty == 0 { px } else { (entry.avg_px * open + px * add) / (open + add) };
            entry.qty = new_qty;
        } else {
            // opposite direction -> realize on the closed part
            let closed = signed_qty.abs().min(prev_qty.abs());
            let dir = Decimal::from(prev_qty.signum());
            entry.realized += (px - entry.avg_px) * Decimal::from(closed) * dir;
            entry.qty = new_qty;
            if new_qty == 0 {
                entry.avg_px = Decimal::ZERO;
            } else if new_qty.signum() != prev_qty.signum() {
                entry.avg_px = px;
            }
        }
    }

    pub fn apply_trade(&mut self, t: &Trade) {
        self.apply(&t.symbol, &t.exchange, t.product, t.side, t.quantity, t.price);
    }

    pub fn quantity(&self, symbol: &str, exchange: &str, product: ProductType) -> i64 {
        self.by_key
            .get(&(symbol.to_ascii_uppercase(), exchange.to_ascii_uppercase(), product))
            .map(|p| p.qty)
            .unwrap_or(0)
    }

    /// Every instrument ever traded, flat ones included (realized P&L).
    /// Unrealized is marked at `marks` if present, else at the last fill.
    pub fn positions(&self, marks: &HashMap<String, Decimal>) -> Vec<Position> {
        self.order
            .iter()
            .filter_map(|key| self.by_key.get(key).map(|p| (key, p)))
            .map(|((symbol, exchange, product), p)| {
                let ltp = marks.get(symbol).copied().or(p.last_px);
                let unrealized = match ltp {
                    Some(m) if p.qty != 0 => (m - p.avg_px) * Decimal::from(p.qty),
                    _ => Decimal::ZERO,
                };
                Position {
                    symbol: symbol.clone(),
                    exchange: exchange.clone(),
                    product: *product,
                    quantity: p.qty,
                    average_price: p.avg_px,
                    ltp,
                    realized_pnl: p.realized,
                    unrealized_pnl: unrealized,
                }
            })
            .collect()
    }
}

/// Net positions from a trade book.
pub fn net_positions(trades: &[Trade]) -> Vec<Position> {
    let mut tracker = PositionTracker::new();
    for t in trades {
        tracker.apply_trade(t);
    }
    tracker.positions(&HashMap::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(side: Side, qty: u64, px: Decimal) -> Trade {
        Trade {
            trade_id: "t".into(),
            order_id: "o".into(),
            symbol: "AAPL".into(),
            exchange: "NASDAQ".into(),
            side,
            quantity: qty,
            price: px,
            product: ProductType::Cnc,
            timestamp: None,
        }
    }

    #[test]
    fn average_and_realized() {
        let p = net_positions(&[
            trade(Side::Buy, 10, dec!(100)),
            trade(Side::Buy, 10, dec!(110)),
            trade(Side::Sell, 5, dec!(120)),
        ]);
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].quantity, 15);
        assert_eq!(p[0].average_price, dec!(105));
        assert_eq!(p[0].realized_pnl, dec!(75));
        assert_eq!(p[0].unrealized_pnl, dec!(225));
    }

    #[test]
    fn flat_resets_and_flip_restarts_average() {
        let mut t = PositionTracker::new();
        t.apply("AAPL", "NASDAQ", ProductType::Cnc, Side::Buy, 10, dec!(100));
        t.apply("AAPL", "NASDAQ", ProductType::Cnc, Side::Sell, 10, dec!(101));
        let flat = t.positions(&HashMap::new());
        assert_eq!((flat[0].quantity, flat[0].average_price), (0, Decimal::ZERO));
        assert_eq!(flat[0].realized_pnl, dec!(10));

        t.apply("AAPL", "NASDAQ", ProductType::Cnc, Side::Sell, 4, dec!(99));
        t.apply("AAPL", "NASDAQ", ProductType::Cnc, Side::Buy, 6, dec!(98));
        let p = t.positions(&HashMap::new());
        assert_eq!(p[0].quantity, 2);
        assert_eq!(p[0].average_price, dec!(98));
        assert_eq!(p[0].realized_pnl, dec!(14));
    }
}
