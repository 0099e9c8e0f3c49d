// ===============================
// src/main.rs
// ===============================
/*
 # paper venue, no credentials needed
 BROKER=paper BROKER_API_KEY=demo SYMBOLS=NASDAQ:AAPL:QUOTE,NYSE:IBM:LTP METRICS_PORT=9898 cargo run

 # stream health
 curl -s localhost:9898/metrics | egrep '^stream_(state|reconnects_total|events_total)'
*/
use std::time::Duration;

use tokio::{select, sync::broadcast::error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use broker_bridge::brokers::builtin_registry;
use broker_bridge::domain::{StopMode, StreamEvent};
use broker_bridge::symbols::spawn_refresh_task;
use broker_bridge::{config, metrics, recorder};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "bridge stopped with an error");
        std::process::exit(1);
    }
}

async fn run() -> broker_bridge::Result<()> {
    // ---- Config ----
    let cfg = config::load();
    info!(
        broker = %cfg.broker,
        env = cfg.env.as_str(),
        credentials = ?cfg.credentials,
        watchlist = cfg.watchlist.len(),
        record_file = ?cfg.record_file,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_BROKER.with_label_values(&[cfg.broker.as_str(), cfg.env.as_str()]).set(1);
    for k in &cfg.watchlist {
        metrics::CONFIG_WATCHLIST.with_label_values(&[k.to_string().as_str()]).set(1);
    }
    if let Some(port) = cfg.metrics_port {
        if let Err(e) = metrics::serve_metrics(port) {
            warn!(port, error = %e, "metrics endpoint not started");
        }
    }

    // ---- Adapter ----
    let registry = builtin_registry()?;
    let adapter = registry.resolve(&cfg)?;
    let token = adapter.authenticate(&cfg.credentials).await?;
    info!(broker = adapter.name(), token = ?token, "session ready");

    let report = adapter.refresh_contracts().await?;
    info!(rows = report.table_size, skipped = report.skipped, "contracts loaded");
    if !cfg.contracts.refresh_interval.is_zero() {
        spawn_refresh_task(adapter.contracts(), adapter.contract_source(), cfg.contracts.refresh_interval);
    }

    // ---- Streaming ----
    let hub = adapter.start_stream().await?;
    let mut firehose = hub.firehose();
    for key in &cfg.watchlist {
        match hub.subscribe(&key.symbol, &key.exchange, key.mode, 5) {
            Ok(_) => info!(%key, "subscribed"),
            Err(e) => warn!(%key, error = %e, "subscription skipped"),
        }
    }

    // ---- Recorder (optional) ----
    if let Some(path) = cfg.record_file.clone() {
        let rx = hub.firehose();
        tokio::spawn(async move {
            if let Err(e) = recorder::run(rx, path).await {
                error!(error = %e, "recorder could not start");
            }
        });
    }

    // ---- Heartbeat ----
    let mut heartbeat = tokio::time::interval(Duration::from_secs(5));
    let (mut ticks, mut updates) = (0u64, 0u64);
    let mut failed = None;
    loop {
        select! {
            ev = firehose.recv() => match ev {
                Ok(StreamEvent::OrderUpdate(u)) => {
                    updates += 1;
                    info!(order_id = %u.order_id, status = %u.status, event = %u.event, "order update");
                }
                Ok(_) => ticks += 1,
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "heartbeat consumer lagging"),
                Err(RecvError::Closed) => break,
            },
            err = hub.failed() => {
                failed = Some(err);
                break;
            },
            _ = heartbeat.tick() => {
                info!(state = hub.state().as_str(), events = ticks, order_updates = updates, subscriptions = hub.subscriptions().len(), "heartbeat");
                ticks = 0;
                updates = 0;
            },
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                break;
            }
        }
    }

    adapter.stop_stream(StopMode::Shutdown).await?;
    if let Some(err) = failed {
        return Err(err);
    }
    info!("bye");
    Ok(())
}
