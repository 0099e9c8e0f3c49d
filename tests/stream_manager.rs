// Connection state machine, replay and fan-out against a scripted connector.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::time::timeout;

use broker_bridge::config::StreamPolicy;
use broker_bridge::domain::{ConnectionState, LtpTick, StopMode, StreamEvent, Subscription, SubscriptionMode};
use broker_bridge::error::{BridgeError, Result};
use broker_bridge::stream::{StreamHub, StreamProtocol};
use broker_bridge::symbols::{ContractEntry, SymbolCache};
use broker_bridge::transform::num::parse_decimal;
use broker_bridge::transport::mock::MockConnector;
use broker_bridge::transport::StreamConnection;

const WAIT: Duration = Duration::from_secs(2);

/// "auth" -> "ok"; `sub:SYM` / `unsub:SYM`; ticks as {"sym","exch","px"}.
struct LineProtocol {
    contracts: Arc<SymbolCache>,
}

#[async_trait]
impl StreamProtocol for LineProtocol {
    fn label(&self) -> &str {
        "market"
    }

    fn supports(&self, mode: SubscriptionMode) -> bool {
        mode != SubscriptionMode::Depth
    }

    async fn handshake(&self, conn: &mut dyn StreamConnection) -> Result<()> {
        conn.send("auth").await?;
        loop {
            match conn.recv().await? {
                Some(f) if f.is_empty() => continue,
                Some(f) if f == "ok" => return Ok(()),
                Some(f) => return Err(BridgeError::AuthenticationFailed(f)),
                None => return Err(BridgeError::ConnectionFailed("closed during handshake".into())),
            }
        }
    }

    fn subscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>> {
        Ok(subs.iter().map(|s| format!("sub:{}", s.instrument.broker_symbol)).collect())
    }

    fn unsubscribe_frames(&self, subs: &[Subscription]) -> Result<Vec<String>> {
        Ok(subs.iter().map(|s| format!("unsub:{}", s.instrument.broker_symbol)).collect())
    }

    fn decode(&self, frame: &str) -> Result<Vec<StreamEvent>> {
        let v: Value = serde_json::from_str(frame)?;
        let field = |k: &str| v.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
        let (symbol, exchange) = self.contracts.resolve_to_canonical(&field("sym"), &field("exch"))?;
        let ltp = parse_decimal(&field("px"))?;
        Ok(vec![StreamEvent::Ltp(LtpTick { symbol, exchange, ltp, quantity: 1, timestamp: None })])
    }
}

fn policy() -> StreamPolicy {
    StreamPolicy {
        connect_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_millis(500),
        read_timeout: Duration::ZERO,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        jitter: Duration::ZERO,
        max_retries: 3,
        event_buffer: 64,
        connect_on_subscribe: false,
        shutdown_timeout: Duration::from_millis(500),
    }
}

fn cache() -> Arc<SymbolCache> {
    let c = SymbolCache::new("test");
    c.replace(vec![
        ContractEntry::equity("AAPL", "NASDAQ", "AAPL", "NASDAQ", "t-aapl"),
        ContractEntry::equity("MSFT", "NASDAQ", "MSFT", "NASDAQ", "t-msft"),
    ])
    .unwrap();
    Arc::new(c)
}

fn hub_with(connector: &MockConnector) -> StreamHub {
    hub_with_policy(connector, policy())
}

fn hub_with_policy(connector: &MockConnector, policy: StreamPolicy) -> StreamHub {
    hub_on(connector, policy, cache())
}

fn hub_on(connector: &MockConnector, policy: StreamPolicy, contracts: Arc<SymbolCache>) -> StreamHub {
    let protocol = Arc::new(LineProtocol { contracts: contracts.clone() });
    StreamHub::new("test", contracts, policy, Arc::new(connector.clone()), protocol)
}

fn accepting() -> MockConnector {
    MockConnector::with_responder(|f| if f == "auth" { vec!["ok".to_string()] } else { Vec::new() })
}

fn tick(sym: &str, px: &str) -> String {
    format!(r#"{{"sym":"{sym}","exch":"NASDAQ","px":"{px}"}}"#)
}

async fn next_ltp(rx: &mut tokio::sync::broadcast::Receiver<StreamEvent>) -> LtpTick {
    match timeout(WAIT, rx.recv()).await.expect("event in time").expect("bus open") {
        StreamEvent::Ltp(t) => t,
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn subscribe_connect_and_receive() {
    let connector = accepting();
    let hub = hub_with(&connector);

    let mut rx = hub.subscribe("aapl", "nasdaq", SubscriptionMode::Ltp, 0).unwrap();
    assert_eq!(hub.state(), ConnectionState::Disconnected);

    hub.start();
    assert!(hub.wait_for_state(ConnectionState::Connected, WAIT).await);
    let session = connector.wait_for_session(1, WAIT).await.unwrap();
    assert!(session.wait_for_sent("sub:AAPL", 1, WAIT).await);

    session.push(tick("AAPL", "190.25"));
    let t = next_ltp(&mut rx).await;
    assert_eq!((t.symbol.as_str(), t.exchange.as_str(), t.ltp), ("AAPL", "NASDAQ", dec!(190.25)));
}

#[tokio::test]
async fn subscribe_while_disconnected_connects_and_sends_once() {
    let connector = accepting();
    let hub = hub_with_policy(&connector, StreamPolicy { connect_on_subscribe: true, ..policy() });

    hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Quote, 0).unwrap();
    assert_eq!(hub.state(), ConnectionState::Connecting);
    assert!(hub.wait_for_state(ConnectionState::Connected, WAIT).await);

    let session = connector.wait_for_session(1, WAIT).await.unwrap();
    assert!(session.wait_for_sent("sub:AAPL", 1, WAIT).await);
    // a repeat subscribe of the same key is not re-sent
    hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Quote, 0).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.sent_matching("sub:AAPL"), 1);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn unknown_symbol_and_unsupported_mode_are_refused() {
    let hub = hub_with(&accepting());
    assert!(matches!(
        hub.subscribe("ZZZZ", "NASDAQ", SubscriptionMode::Ltp, 0),
        Err(BridgeError::SymbolNotFound { .. })
    ));
    assert!(matches!(
        hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Depth, 5),
        Err(BridgeError::UnsupportedCapability { .. })
    ));
    assert!(hub.subscriptions().is_empty());
}

#[tokio::test]
async fn drops_reconnect_and_replay_every_subscription() {
    let connector = accepting();
    let hub = hub_with(&connector);
    let mut rx = hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.subscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.start();

    for n in 1..=3usize {
        let session = connector.wait_for_session(n, WAIT).await.unwrap();
        assert!(session.wait_for_sent("sub:AAPL", 1, WAIT).await, "replay on session {n}");
        assert!(session.wait_for_sent("sub:MSFT", 1, WAIT).await, "replay on session {n}");
        assert_eq!(hub.state(), ConnectionState::Connected);
        if n < 3 {
            session.drop_connection();
        }
    }

    // the first delivered tick clears the two counted drops
    let session = connector.latest().unwrap();
    session.push(tick("AAPL", "191"));
    assert_eq!(next_ltp(&mut rx).await.ltp, dec!(191));
    assert_eq!(hub.market().failures(), 0);
}

#[tokio::test]
async fn sessions_dropped_before_any_data_count_as_failures() {
    let connector = accepting();
    let hub = hub_with_policy(&connector, StreamPolicy { max_backoff: Duration::from_secs(5), ..policy() });
    hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.start();

    for n in 1..=3usize {
        let session = connector.wait_for_session(n, WAIT).await.unwrap();
        assert!(session.wait_for_sent("sub:AAPL", 1, WAIT).await, "replay on session {n}");
        session.drop_connection();
    }

    assert!(hub.wait_for_state(ConnectionState::Failed, WAIT).await);
    assert_eq!(connector.attempts(), 3);
    match hub.subscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp, 0) {
        Err(BridgeError::StreamFailed { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("reset"));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("subscribe accepted on a failed stream"),
    }
}

#[tokio::test]
async fn replay_uses_the_refreshed_contract_table() {
    let connector = accepting();
    let contracts = cache();
    let hub = hub_on(&connector, policy(), contracts.clone());
    let mut rx = hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.subscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.start();
    let first = connector.wait_for_session(1, WAIT).await.unwrap();
    assert!(first.wait_for_sent("sub:MSFT", 1, WAIT).await);

    // AAPL rolls to a new broker symbol, MSFT is delisted
    contracts.replace(vec![ContractEntry::equity("AAPL", "NASDAQ", "APPLE", "NASDAQ", "t-aapl-2")]).unwrap();
    first.drop_connection();

    let second = connector.wait_for_session(2, WAIT).await.unwrap();
    assert!(second.wait_for_sent("sub:APPLE", 1, WAIT).await);
    assert_eq!(second.sent_matching("sub:AAPL"), 0);
    assert_eq!(second.sent_matching("sub:MSFT"), 0);

    let subs = hub.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].instrument.broker_token, "t-aapl-2");

    second.push(tick("APPLE", "192"));
    let t = next_ltp(&mut rx).await;
    assert_eq!((t.symbol.as_str(), t.ltp), ("AAPL", dec!(192)));
}

#[tokio::test]
async fn refused_connects_end_in_failed() {
    let connector = accepting();
    connector.refuse_all(true);
    let hub = hub_with(&connector);
    hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.start();

    match timeout(WAIT, hub.failed()).await.expect("failure in time") {
        BridgeError::StreamFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(hub.state(), ConnectionState::Failed);
    assert_eq!(connector.attempts(), 3);
    match hub.subscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp, 0) {
        Err(BridgeError::StreamFailed { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("refused"));
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("subscribe accepted on a failed stream"),
    }

    // an explicit start() leaves FAILED
    connector.refuse_all(false);
    hub.start();
    assert!(hub.wait_for_state(ConnectionState::Connected, WAIT).await);
}

#[tokio::test]
async fn rejected_credentials_fail_without_retry() {
    let connector = MockConnector::with_responder(|f| if f == "auth" { vec!["denied".to_string()] } else { Vec::new() });
    let hub = hub_with(&connector);
    hub.start();
    assert!(hub.wait_for_state(ConnectionState::Failed, WAIT).await);
    assert_eq!(connector.attempts(), 1);
    assert!(hub.market().last_error().unwrap_or_default().contains("denied"));
}

#[tokio::test]
async fn late_events_for_unsubscribed_keys_are_dropped() {
    let connector = accepting();
    let hub = hub_with(&connector);
    let mut firehose = hub.firehose();
    hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.subscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.start();
    let session = connector.wait_for_session(1, WAIT).await.unwrap();
    assert!(session.wait_for_sent("sub:MSFT", 1, WAIT).await);

    assert!(hub.unsubscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp).unwrap());
    assert!(!hub.unsubscribe("MSFT", "NASDAQ", SubscriptionMode::Ltp).unwrap());
    assert!(session.wait_for_sent("unsub:MSFT", 1, WAIT).await);

    session.push(tick("MSFT", "410"));
    session.push(tick("AAPL", "190"));
    let t = next_ltp(&mut firehose).await;
    assert_eq!(t.symbol, "AAPL");
}

#[tokio::test]
async fn pause_keeps_subscriptions_shutdown_clears_them() {
    let connector = accepting();
    let hub = hub_with(&connector);
    hub.subscribe("AAPL", "NASDAQ", SubscriptionMode::Ltp, 0).unwrap();
    hub.start();
    assert!(hub.wait_for_state(ConnectionState::Connected, WAIT).await);

    hub.stop(StopMode::Pause).await;
    assert_eq!(hub.state(), ConnectionState::Disconnected);
    assert!(connector.session(0).unwrap().is_closed());
    assert_eq!(hub.subscriptions().len(), 1);

    hub.start();
    let resumed = connector.wait_for_session(2, WAIT).await.unwrap();
    assert!(resumed.wait_for_sent("sub:AAPL", 1, WAIT).await);

    hub.stop(StopMode::Shutdown).await;
    assert!(hub.subscriptions().is_empty());
    hub.start();
    let fresh = connector.wait_for_session(3, WAIT).await.unwrap();
    assert!(hub.wait_for_state(ConnectionState::Connected, WAIT).await);
    assert_eq!(fresh.sent(), vec!["auth".to_string()]);
}
