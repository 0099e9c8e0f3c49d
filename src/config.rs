// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : broker_bridge: canonical broker adapter layer in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : One canonical interface over heterogeneous brokers: master
          contract mapping, order/field transforms, capability-checked
          adapters, and resilient streaming with subscription replay.
=============================================================================
*/
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::{SubscriptionKey, SubscriptionMode};

/// Trading environment; picks default endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TradingEnv {
    #[default]
    Paper,
    Live,
}

impl TradingEnv {
    pub fn parse(s: &str) -> Option<TradingEnv> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" | "sandbox" | "test" => Some(TradingEnv::Paper),
            "live" | "prod" | "mainnet" => Some(TradingEnv::Live),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradingEnv::Paper => "paper",
            TradingEnv::Live => "live",
        }
    }

    // Endpoint defaults per env
    pub fn alpaca_rest_url(&self) -> &'static str {
        match self {
            TradingEnv::Paper => "https://paper-api.alpaca.markets",
            TradingEnv::Live => "https://api.alpaca.markets",
        }
    }

    pub fn alpaca_trading_ws_url(&self) -> &'static str {
        match self {
            TradingEnv::Paper => "wss://paper-api.alpaca.markets/stream",
            TradingEnv::Live => "wss://api.alpaca.markets/stream",
        }
    }
}

/// Login inputs handed to `authenticate`. Never logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "***" })
            .field("api_secret", &"***")
            .finish()
    }
}

/// Per-call REST policy. `min_interval` is the broker rate limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpPolicy {
    pub timeout: Duration,
    pub min_interval: Duration,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), min_interval: Duration::from_millis(50) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamPolicy {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Silence longer than this counts as a dropped connection.
    pub read_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
    /// Consecutive failed attempts before FAILED.
    pub max_retries: u32,
    pub event_buffer: usize,
    pub connect_on_subscribe: bool,
    pub shutdown_timeout: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            max_retries: 10,
            event_buffer: 4096,
            connect_on_subscribe: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractPolicy {
    /// Zero disables the periodic refresher.
    pub refresh_interval: Duration,
}

impl Default for ContractPolicy {
    fn default() -> Self {
        Self { refresh_interval: Duration::from_secs(24 * 60 * 60) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlpacaConfig {
    pub rest_url: String,
    pub data_url: String,
    pub market_ws_url: String,
    pub trading_ws_url: String,
}

impl AlpacaConfig {
    pub fn for_env(env: TradingEnv, feed: &str) -> Self {
        Self {
            rest_url: env.alpaca_rest_url().to_string(),
            data_url: "https://data.alpaca.markets".to_string(),
            market_ws_url: format!("wss://stream.data.alpaca.markets/v2/{feed}"),
            trading_ws_url: env.alpaca_trading_ws_url().to_string(),
        }
    }
}

impl Default for AlpacaConfig {
    fn default() -> Self {
        Self::for_env(TradingEnv::Paper, "iex")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaperConfig {
    pub tick_interval: Duration,
    pub starting_cash: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_millis(250), starting_cash: Decimal::new(100_000, 0) }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    pub broker: String,
    pub env: TradingEnv,
    pub credentials: Credentials,
    pub http: HttpPolicy,
    pub stream: StreamPolicy,
    pub contracts: ContractPolicy,
    pub alpaca: AlpacaConfig,
    pub paper: PaperConfig,
    pub metrics_port: Option<u16>,
    pub record_file: Option<String>,
    pub watchlist: Vec<SubscriptionKey>,
}

impl BridgeConfig {
    /// Builds the config from any key lookup (env, map in tests).
    /// Values that fail to parse fall back to defaults.
    pub fn from_lookup<F>(get: F) -> BridgeConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str| -> Option<u64> { get(key).and_then(|s| s.trim().parse().ok()) };
        let ms = |key: &str, default: Duration| num(key).map(Duration::from_millis).unwrap_or(default);
        let secs = |key: &str, default: Duration| num(key).map(Duration::from_secs).unwrap_or(default);

        let broker = get("BROKER").unwrap_or_else(|| "paper".to_string()).trim().to_ascii_lowercase();
        let env = get("BROKER_ENV").and_then(|s| TradingEnv::parse(&s)).unwrap_or_default();

        let credentials = Credentials {
            api_key: get("BROKER_API_KEY").unwrap_or_default(),
            api_secret: get("BROKER_API_SECRET").unwrap_or_default(),
        };

        let http_d = HttpPolicy::default();
        let http = HttpPolicy {
            timeout: ms("HTTP_TIMEOUT_MS", http_d.timeout),
            min_interval: ms("HTTP_MIN_INTERVAL_MS", http_d.min_interval),
        };

        let sd = StreamPolicy::default();
        let stream = StreamPolicy {
            connect_timeout: ms("STREAM_CONNECT_TIMEOUT_MS", sd.connect_timeout),
            handshake_timeout: ms("STREAM_HANDSHAKE_TIMEOUT_MS", sd.handshake_timeout),
            read_timeout: ms("STREAM_READ_TIMEOUT_MS", sd.read_timeout),
            initial_backoff: ms("STREAM_INITIAL_BACKOFF_MS", sd.initial_backoff),
            max_backoff: ms("STREAM_MAX_BACKOFF_MS", sd.max_backoff),
            jitter: ms("STREAM_JITTER_MS", sd.jitter),
            max_retries: num("STREAM_MAX_RETRIES").map(|n| n.clamp(1, u32::MAX as u64) as u32).unwrap_or(sd.max_retries),
            event_buffer: num("STREAM_EVENT_BUFFER").map(|n| n.max(16) as usize).unwrap_or(sd.event_buffer),
            connect_on_subscribe: get("STREAM_CONNECT_ON_SUBSCRIBE")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(sd.connect_on_subscribe),
            shutdown_timeout: ms("STREAM_SHUTDOWN_TIMEOUT_MS", sd.shutdown_timeout),
        };

        let contracts = ContractPolicy {
            refresh_interval: secs("CONTRACT_REFRESH_SECS", ContractPolicy::default().refresh_interval),
        };

        let feed = get("ALPACA_DATA_FEED").unwrap_or_else(|| "iex".to_string());
        let ad = AlpacaConfig::for_env(env, feed.trim());
        let alpaca = AlpacaConfig {
            rest_url: get("ALPACA_REST_URL").unwrap_or(ad.rest_url),
            data_url: get("ALPACA_DATA_URL").unwrap_or(ad.data_url),
            market_ws_url: get("ALPACA_MARKET_WS_URL").unwrap_or(ad.market_ws_url),
            trading_ws_url: get("ALPACA_TRADING_WS_URL").unwrap_or(ad.trading_ws_url),
        };

        let pd = PaperConfig::default();
        let paper = PaperConfig {
            tick_interval: ms("PAPER_TICK_MS", pd.tick_interval),
            starting_cash: get("PAPER_STARTING_CASH")
                .and_then(|s| Decimal::from_str(s.trim()).ok())
                .unwrap_or(pd.starting_cash),
        };

        let metrics_port = get("METRICS_PORT").and_then(|s| s.trim().parse().ok());
        let record_file = get("RECORD_FILE").filter(|s| !s.trim().is_empty());

        // SYMBOLS=NASDAQ:AAPL:QUOTE,NYSE:IBM:LTP
        let watchlist = get("SYMBOLS").map(|s| parse_watchlist(&s)).unwrap_or_default();

        BridgeConfig {
            broker,
            env,
            credentials,
            http,
            stream,
            contracts,
            alpaca,
            paper,
            metrics_port,
            record_file,
            watchlist,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `EXCHANGE:SYMBOL[:MODE]`, comma separated; mode defaults to QUOTE.
pub fn parse_watchlist(s: &str) -> Vec<SubscriptionKey> {
    let mut out: Vec<SubscriptionKey> = Vec::new();
    for item in s.split(',').map(str::trim).filter(|x| !x.is_empty()) {
        let parts: Vec<&str> = item.split(':').map(str::trim).collect();
        let key = match parts.as_slice() {
            [exch, sym] if !exch.is_empty() && !sym.is_empty() => Some(SubscriptionKey::new(sym, exch, SubscriptionMode::Quote)),
            [exch, sym, mode] if !exch.is_empty() && !sym.is_empty() => {
                SubscriptionMode::parse(mode).map(|m| SubscriptionKey::new(sym, exch, m))
            }
            _ => None,
        };
        match key {
            Some(k) if !out.contains(&k) => out.push(k),
            Some(_) => {}
            None => warn!(%item, "SYMBOLS entry ignored (expected EXCHANGE:SYMBOL[:LTP|QUOTE|DEPTH])"),
        }
    }
    out
}

pub fn load() -> BridgeConfig {
    // Pastikan .env dibaca (BROKER, SYMBOLS, RECORD_FILE, ...)
    let _ = dotenv();
    BridgeConfig::from_lookup(|k| env::var(k).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap as HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = BridgeConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.broker, "paper");
        assert_eq!(cfg.env, TradingEnv::Paper);
        assert_eq!(cfg.stream.initial_backoff, Duration::from_secs(1));
        assert_eq!(cfg.stream.max_backoff, Duration::from_secs(30));
        assert!(cfg.stream.connect_on_subscribe);
        assert!(cfg.watchlist.is_empty());
        assert_eq!(cfg.alpaca.rest_url, "https://paper-api.alpaca.markets");
    }

    #[test]
    fn overrides_and_bad_numbers() {
        let cfg = BridgeConfig::from_lookup(lookup(&[
            ("BROKER", "Alpaca"),
            ("BROKER_ENV", "live"),
            ("STREAM_MAX_RETRIES", "abc"),
            ("STREAM_READ_TIMEOUT_MS", "1500"),
            ("STREAM_CONNECT_ON_SUBSCRIBE", "off"),
            ("ALPACA_DATA_FEED", "sip"),
            ("SYMBOLS", "NASDAQ:AAPL:QUOTE, nyse:ibm:ltp, bad, NASDAQ:AAPL:QUOTE, NASDAQ:MSFT"),
        ]));
        assert_eq!(cfg.broker, "alpaca");
        assert_eq!(cfg.env, TradingEnv::Live);
        assert_eq!(cfg.stream.max_retries, 10);
        assert_eq!(cfg.stream.read_timeout, Duration::from_millis(1500));
        assert!(!cfg.stream.connect_on_subscribe);
        assert_eq!(cfg.alpaca.rest_url, "https://api.alpaca.markets");
        assert!(cfg.alpaca.market_ws_url.ends_with("/v2/sip"));
        let keys: Vec<String> = cfg.watchlist.iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["NASDAQ:AAPL:QUOTE", "NYSE:IBM:LTP", "NASDAQ:MSFT:QUOTE"]);
    }

    #[test]
    fn credentials_are_redacted() {
        let c = Credentials { api_key: "k".into(), api_secret: "s".into() };
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("\"k\"") && !dbg.contains("\"s\""));
    }
}
