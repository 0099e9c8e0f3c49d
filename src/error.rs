// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::adapter::Capability;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Every failure the bridge can report. Nothing is swallowed: each path
/// ends in one of these.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("symbol not found: {symbol} on {exchange}")]
    SymbolNotFound { symbol: String, exchange: String },

    #[error("broker symbol {symbol} is listed on several exchanges: {exchanges:?}")]
    AmbiguousSymbol { symbol: String, exchanges: Vec<String> },

    #[error("{broker} does not support {capability}")]
    UnsupportedCapability { broker: String, capability: Capability },

    #[error("transport error: {0}")]
    Transport(String),

    /// Business rejection; `reason` is the broker's own text.
    #[error("broker rejected request: {reason}")]
    BrokerRejected { reason: String },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("stream failed after {attempts} consecutive attempts: {last_error}")]
    StreamFailed { attempts: u32, last_error: String },

    #[error("contract refresh failed: {0}")]
    RefreshFailed(String),

    #[error("unknown broker '{name}' (registered: {known:?})")]
    UnknownBroker { name: String, known: Vec<String> },

    #[error("broker '{0}' registered twice")]
    DuplicateBroker(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("could not decode broker payload: {0}")]
    Decode(String),

    /// Broken static setup, e.g. an incomplete vocabulary table.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BridgeError {
    pub fn symbol_not_found(symbol: &str, exchange: &str) -> Self {
        BridgeError::SymbolNotFound {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
        }
    }

    pub fn unsupported(broker: &str, capability: Capability) -> Self {
        BridgeError::UnsupportedCapability {
            broker: broker.to_string(),
            capability,
        }
    }

    /// Only a dropped or refused persistent connection is retried
    /// automatically; everything else goes straight back to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::ConnectionFailed(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_retryable() {
        assert!(BridgeError::ConnectionFailed("reset".into()).is_retryable());
        assert!(!BridgeError::Transport("timeout".into()).is_retryable());
        assert!(!BridgeError::symbol_not_found("AAPL", "NASDAQ").is_retryable());
        assert!(!BridgeError::StreamFailed { attempts: 5, last_error: "x".into() }.is_retryable());
    }

    #[test]
    fn rejection_keeps_broker_text() {
        let e = BridgeError::BrokerRejected { reason: "insufficient buying power".into() };
        assert_eq!(e.to_string(), "broker rejected request: insufficient buying power");
    }
}
