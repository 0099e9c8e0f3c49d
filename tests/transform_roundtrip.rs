// Canonical order -> broker payload -> broker record -> canonical order keeps the order intact.
use rust_decimal_macros::dec;
use serde_json::json;

use broker_bridge::brokers::alpaca::types::{AlpacaAsset, AlpacaOrder};
use broker_bridge::brokers::alpaca::{contracts as alpaca_contracts, transform as alpaca};
use broker_bridge::brokers::paper::venue::Venue;
use broker_bridge::brokers::paper::{contract_from_instrument, transform as paper};
use broker_bridge::domain::{CanonicalOrder, OrderStatus, OrderType, ProductType, Side, Validity};
use broker_bridge::error::BridgeError;
use broker_bridge::symbols::SymbolCache;

fn resting_orders() -> Vec<CanonicalOrder> {
    vec![
        CanonicalOrder::limit("AAPL", "NASDAQ", Side::Buy, 7, dec!(180.55)).with_tag("dip-buy"),
        CanonicalOrder {
            order_type: OrderType::StopLimit,
            trigger_price: dec!(420),
            price: dec!(421.5),
            ..CanonicalOrder::limit("MSFT", "NASDAQ", Side::Buy, 3, dec!(0))
        },
        CanonicalOrder {
            product: ProductType::Mis,
            ..CanonicalOrder::limit("IBM", "NYSE", Side::Sell, 12, dec!(195.25))
        },
    ]
}

#[test]
fn paper_orders_survive_the_venue() {
    let mut venue = Venue::new(dec!(1000000), "");
    let cache = SymbolCache::new("paper");
    cache.replace(venue.instruments().iter().filter_map(contract_from_instrument).collect()).unwrap();
    let vocab = paper::vocabulary().unwrap();

    for order in resting_orders() {
        let req = paper::to_broker_order(&order, "demo", &cache, &vocab).unwrap();
        let id = venue.place(req).unwrap();
        let rec = paper::from_broker_order(&venue.order(&id).unwrap(), &cache, &vocab).unwrap();
        assert_eq!(rec.order, order, "{id}");
        assert!(rec.status.is_working());
        assert_eq!(rec.pending_quantity, order.quantity);
    }
}

#[test]
fn paper_refuses_what_it_cannot_express() {
    let cache = SymbolCache::new("paper");
    cache.replace(Venue::new(dec!(0), "").instruments().iter().filter_map(contract_from_instrument).collect()).unwrap();
    let vocab = paper::vocabulary().unwrap();
    let gtc = CanonicalOrder { validity: Validity::Gtc, ..CanonicalOrder::market("AAPL", "NASDAQ", Side::Buy, 1) };
    assert!(matches!(paper::to_broker_order(&gtc, "demo", &cache, &vocab), Err(BridgeError::InvalidOrder(_))));
}

#[test]
fn alpaca_orders_survive_the_wire_format() {
    let cache = SymbolCache::new("alpaca");
    let assets: Vec<AlpacaAsset> = ["AAPL", "MSFT"]
        .iter()
        .map(|s| json!({"id": format!("id-{s}"), "symbol": s, "exchange": "NASDAQ", "tradable": true}))
        .chain(std::iter::once(json!({"id": "id-IBM", "symbol": "IBM", "exchange": "NYSE", "tradable": true})))
        .map(|v| serde_json::from_value(v).unwrap())
        .collect();
    cache.replace(assets.iter().filter_map(alpaca_contracts::contract_from_asset).collect()).unwrap();
    let vocab = alpaca::vocabulary().unwrap();

    // no intraday product on alpaca, so the short sale stays a cash order
    let orders: Vec<CanonicalOrder> = resting_orders()
        .into_iter()
        .map(|o| CanonicalOrder { product: ProductType::Cnc, ..o })
        .chain(std::iter::once(CanonicalOrder {
            validity: Validity::Gtc,
            ..CanonicalOrder::limit("AAPL", "NASDAQ", Side::Sell, 1, dec!(250))
        }))
        .collect();

    for (n, order) in orders.iter().enumerate() {
        let req = alpaca::to_broker_order(order, &cache, &vocab).unwrap();
        let mut wire = serde_json::to_value(&req).unwrap();
        wire["id"] = json!(format!("o-{n}"));
        wire["status"] = json!("accepted");
        wire["filled_qty"] = json!("0");
        let echoed: AlpacaOrder = serde_json::from_value(wire).unwrap();
        let rec = alpaca::from_broker_order(&echoed, &cache, &vocab).unwrap();
        assert_eq!(&rec.order, order);
        assert_eq!(rec.status, OrderStatus::Open);
    }
}
