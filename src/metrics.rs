// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("static metric definition")
}

// -------- Streaming --------
pub static STREAM_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "stream_state",
        "connection state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=failed)",
        &["broker", "connection"],
    )
});

pub static STREAM_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("stream_reconnects_total", "reconnect attempts after a drop or failed connect", &["broker", "connection"])
});

pub static STREAM_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("stream_events_total", "normalized events published (label: kind)", &["broker", "kind"])
});

pub static STREAM_DISCARDED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("stream_discarded_total", "market events for keys no longer subscribed", &["broker"])
});

pub static STREAM_DECODE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("stream_decode_errors_total", "inbound frames that failed to decode", &["broker", "connection"])
});

// -------- Contracts --------
pub static CONTRACT_REFRESH: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("contract_refresh_total", "master contract refreshes (label: result)", &["broker", "result"])
});

pub static CONTRACT_ROWS: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("contract_rows", "rows in the live contract table", &["broker"]));

pub static UNMAPPED_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("unmapped_symbol_total", "broker rows or subscriptions with no contract (label: kind)", &["broker", "kind"])
});

// -------- Transforms / REST --------
pub static UNMAPPED_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("unmapped_order_status_total", "broker statuses with no canonical mapping", &["broker", "status"])
});

pub static BROKER_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("broker_calls_total", "broker REST calls (labels: op, result)", &["broker", "op", "result"])
});

// Call latency (milliseconds)
pub static BROKER_CALL_MS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("broker_call_latency_ms", "broker REST call latency (ms)")
            .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
        &["broker", "op"],
    )
    .expect("static metric definition")
});

// ---- Config visibility ----
pub static CONFIG_BROKER: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_broker", "active broker (labels: broker, env)", &["broker", "env"]));

pub static CONFIG_WATCHLIST: Lazy<IntGaugeVec> =
    Lazy::new(|| gauge_vec("config_watchlist", "start-up subscriptions (label: key)", &["key"]));

pub fn init() {
    // Register all metrics to the custom registry; a second init is a no-op
    for m in [
        REGISTRY.register(Box::new(STREAM_STATE.clone())),
        REGISTRY.register(Box::new(STREAM_RECONNECTS.clone())),
        REGISTRY.register(Box::new(STREAM_EVENTS.clone())),
        REGISTRY.register(Box::new(STREAM_DISCARDED.clone())),
        REGISTRY.register(Box::new(STREAM_DECODE_ERRORS.clone())),
        REGISTRY.register(Box::new(CONTRACT_REFRESH.clone())),
        REGISTRY.register(Box::new(CONTRACT_ROWS.clone())),
        REGISTRY.register(Box::new(UNMAPPED_SYMBOL.clone())),
        REGISTRY.register(Box::new(UNMAPPED_STATUS.clone())),
        REGISTRY.register(Box::new(BROKER_CALLS.clone())),
        REGISTRY.register(Box::new(BROKER_CALL_MS.clone())),
        REGISTRY.register(Box::new(CONFIG_BROKER.clone())),
        REGISTRY.register(Box::new(CONFIG_WATCHLIST.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

/// `GET /` and `GET /metrics` get the text exposition; anything else a 404.
fn handle_client(mut stream: TcpStream) {
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req).unwrap_or(0);
    let line = String::from_utf8_lossy(&req[..n]);
    let target = line.split_whitespace().nth(1).unwrap_or("/");

    let (status, body) = match target.split('?').next() {
        Some("/") | Some("/metrics") => ("200 OK", encode_metrics()),
        _ => ("404 Not Found", b"not found\n".to_vec()),
    };
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    if let Err(e) = stream.write_all(header.as_bytes()).and_then(|_| stream.write_all(&body)) {
        warn!(error = %e, "metrics write failed");
    }
}

/// Binds synchronously so a busy port is reported to the caller, then
/// serves from a dedicated OS thread (keeps the Tokio runtime clean).
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening on / and /metrics");

    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(?e, "metrics accept error"),
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        init();
        init();
        STREAM_DISCARDED.with_label_values(&["unit"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("stream_discarded_total"));
    }
}
