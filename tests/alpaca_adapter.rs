// Alpaca adapter over a scripted HTTP transport.
use std::sync::Arc;

use rust_decimal_macros::dec;
use serde_json::json;

use broker_bridge::adapter::{AdapterContext, BrokerAdapter, Capability};
use broker_bridge::brokers::alpaca::AlpacaAdapter;
use broker_bridge::config::{BridgeConfig, Credentials};
use broker_bridge::domain::{CanonicalOrder, OrderStatus, Side, SubscriptionMode};
use broker_bridge::error::BridgeError;
use broker_bridge::symbols::SymbolCache;
use broker_bridge::transport::mock::{MockConnector, MockHttpTransport};
use broker_bridge::transport::Method;

fn creds() -> Credentials {
    Credentials { api_key: "PKTEST".into(), api_secret: "secret".into() }
}

fn order(id: &str, status: &str, filled: &str) -> serde_json::Value {
    json!({
        "id": id, "client_order_id": null, "symbol": "AAPL",
        "qty": "10", "filled_qty": filled, "filled_avg_price": if filled == "0" { json!(null) } else { json!("190.02") },
        "side": "buy", "type": "market", "time_in_force": "day",
        "limit_price": null, "stop_price": null, "status": status,
        "created_at": "2024-03-01T15:30:00Z", "updated_at": "2024-03-01T15:30:01Z"
    })
}

async fn adapter(http: Arc<MockHttpTransport>) -> AlpacaAdapter {
    http.on_json(
        Method::Get,
        "/v2/assets",
        200,
        json!([
            {"id": "a-1", "symbol": "AAPL", "name": "Apple Inc.", "exchange": "NASDAQ", "tradable": true, "price_increment": "0.01"},
            {"id": "a-2", "symbol": "IBM", "name": "IBM", "exchange": "NYSE", "tradable": true},
            {"id": "a-3", "symbol": "GONE", "name": "Delisted", "exchange": "OTC", "tradable": true}
        ]),
    );
    let ctx = AdapterContext {
        config: Arc::new(BridgeConfig { broker: "alpaca".into(), credentials: creds(), ..BridgeConfig::default() }),
        contracts: Arc::new(SymbolCache::new("alpaca")),
    };
    let a = AlpacaAdapter::with_transports(ctx, http, Arc::new(MockConnector::new()), Arc::new(MockConnector::new())).unwrap();
    let report = a.refresh_contracts().await.unwrap();
    assert_eq!(report.table_size, 2);
    a
}

#[tokio::test]
async fn authenticate_checks_the_key_pair() {
    let http = Arc::new(MockHttpTransport::new());
    http.on(Method::Get, "/v2/account", 401, r#"{"code":40110000,"message":"request is not authorized"}"#);
    let a = adapter(http.clone()).await;
    match a.authenticate(&creds()).await {
        Err(BridgeError::AuthenticationFailed(m)) => assert_eq!(m, "request is not authorized"),
        other => panic!("unexpected {other:?}"),
    }
    let sent = http.last_request(Method::Get, "/v2/account").unwrap();
    assert_eq!(sent.header_value("APCA-API-KEY-ID"), Some("PKTEST"));

    let empty = Credentials { api_key: String::new(), api_secret: String::new() };
    assert!(matches!(a.authenticate(&empty).await, Err(BridgeError::AuthenticationFailed(_))));
}

#[tokio::test]
async fn filled_order_reports_complete() {
    let http = Arc::new(MockHttpTransport::new());
    http.on_json(Method::Post, "/v2/orders", 200, order("o-1", "filled", "10"));
    let a = adapter(http.clone()).await;

    let ack = a.place_order(&CanonicalOrder::market("AAPL", "NASDAQ", Side::Buy, 10)).await.unwrap();
    assert_eq!(ack.order_id, "o-1");
    assert_eq!(ack.status, Some(OrderStatus::Complete));

    let body = http.last_request(Method::Post, "/v2/orders").unwrap().body.unwrap();
    assert_eq!(body["symbol"], "AAPL");
    assert_eq!(body["type"], "market");
    assert_eq!(body["qty"], "10");
}

#[tokio::test]
async fn unknown_status_is_passed_through() {
    let http = Arc::new(MockHttpTransport::new());
    http.on_json(Method::Get, "/v2/orders", 200, json!([order("o-1", "held", "0"), order("o-2", "new", "0")]));
    let a = adapter(http).await;
    let book = a.order_book().await.unwrap();
    assert_eq!(book[0].status, OrderStatus::Unmapped("HELD".into()));
    assert_eq!(book[1].status, OrderStatus::Pending);
    assert_eq!(book[1].pending_quantity, 10);
}

#[tokio::test]
async fn rejection_text_is_kept_verbatim() {
    let http = Arc::new(MockHttpTransport::new());
    http.on(Method::Post, "/v2/orders", 403, r#"{"code":40310000,"message":"insufficient buying power"}"#);
    let a = adapter(http.clone()).await;
    match a.place_order(&CanonicalOrder::market("AAPL", "NASDAQ", Side::Buy, 10_000)).await {
        Err(BridgeError::BrokerRejected { reason }) => assert_eq!(reason, "insufficient buying power"),
        other => panic!("unexpected {other:?}"),
    }

    // unmapped symbols never reach the wire
    assert!(matches!(
        a.place_order(&CanonicalOrder::market("GONE", "NASDAQ", Side::Buy, 1)).await,
        Err(BridgeError::SymbolNotFound { .. })
    ));
    assert_eq!(http.calls(Method::Post, "/v2/orders"), 1);
}

#[tokio::test]
async fn modify_sends_only_changed_fields() {
    let http = Arc::new(MockHttpTransport::new());
    let mut live = order("o-7", "new", "0");
    live["type"] = json!("limit");
    live["limit_price"] = json!("189.50");
    http.on_json(Method::Get, "/v2/orders/o-7", 200, live.clone());
    let mut replaced = live;
    replaced["id"] = json!("o-8");
    replaced["limit_price"] = json!("189.75");
    http.on_json(Method::Patch, "/v2/orders/o-7", 200, replaced);
    let a = adapter(http.clone()).await;

    let same = CanonicalOrder::limit("AAPL", "NASDAQ", Side::Buy, 10, dec!(189.50));
    let ack = a.modify_order("o-7", &same).await.unwrap();
    assert_eq!(ack.order_id, "o-7");
    assert_eq!(http.calls(Method::Patch, "/v2/orders/o-7"), 0);

    let desired = CanonicalOrder::limit("AAPL", "NASDAQ", Side::Buy, 10, dec!(189.75));
    let ack = a.modify_order("o-7", &desired).await.unwrap();
    assert_eq!(ack.order_id, "o-8");
    let body = http.last_request(Method::Patch, "/v2/orders/o-7").unwrap().body.unwrap();
    assert_eq!(body, json!({"limit_price": "189.75"}));
}

#[tokio::test]
async fn capabilities_exclude_depth() {
    let a = adapter(Arc::new(MockHttpTransport::new())).await;
    assert!(!a.capabilities().supports(Capability::MarketDepth));
    let hub = a.stream_hub().unwrap();
    assert!(matches!(
        hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Depth, 5),
        Err(BridgeError::UnsupportedCapability { .. })
    ));
}

#[tokio::test]
async fn unlisted_rows_are_skipped_not_fatal() {
    let http = Arc::new(MockHttpTransport::new());
    let mut gone = order("o-2", "new", "0");
    gone["symbol"] = json!("GONE");
    http.on_json(Method::Get, "/v2/orders", 200, json!([order("o-1", "new", "0"), gone]));
    http.on(Method::Delete, "/v2/orders/o-1", 204, "");
    http.on_json(
        Method::Get,
        "/v2/positions",
        200,
        json!([
            {"symbol": "AAPL", "exchange": "NASDAQ", "qty": "5", "avg_entry_price": "188.10"},
            {"symbol": "GONE", "exchange": "OTC", "qty": "3", "avg_entry_price": "1.20"}
        ]),
    );
    http.on_json(Method::Post, "/v2/orders", 200, order("o-3", "filled", "5"));
    let a = adapter(http.clone()).await;

    let book = a.order_book().await.unwrap();
    assert_eq!(book.len(), 1);
    assert_eq!(book[0].order_id, "o-1");
    assert_eq!(a.cancel_all_orders().await.unwrap().len(), 1);
    assert_eq!(http.calls(Method::Delete, "/v2/orders/o-2"), 0);

    let positions = a.positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!((positions[0].symbol.as_str(), positions[0].quantity), ("AAPL", 5));
    assert_eq!(a.close_all_positions().await.unwrap().len(), 1);
    let body = http.last_request(Method::Post, "/v2/orders").unwrap().body.unwrap();
    assert_eq!((body["symbol"].as_str(), body["side"].as_str(), body["qty"].as_str()), (Some("AAPL"), Some("sell"), Some("5")));
}

#[tokio::test]
async fn unknown_time_in_force_is_an_error() {
    let http = Arc::new(MockHttpTransport::new());
    let mut odd = order("o-1", "new", "0");
    odd["time_in_force"] = json!("gtx");
    http.on_json(Method::Get, "/v2/orders", 200, json!([odd]));
    let a = adapter(http).await;
    match a.order_book().await {
        Err(BridgeError::Decode(m)) => assert!(m.contains("gtx")),
        other => panic!("unexpected {other:?}"),
    }
}
