// ===============================
// src/transform/num.rs
// ===============================
//
// Numeric plumbing for broker payloads. Prices stay `Decimal` end to end;
// JSON numbers are read through their textual form, never through f64.
//
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{BridgeError, Result};

pub fn parse_decimal(s: &str) -> Result<Decimal> {
    let t = s.trim();
    Decimal::from_str(t)
        .or_else(|_| Decimal::from_scientific(t))
        .map_err(|_| BridgeError::Decode(format!("not a decimal: '{s}'")))
}

/// Canonical textual form: no trailing zeros ("150.50" -> "150.5").
pub fn format_decimal(d: Decimal) -> String {
    d.normalize().to_string()
}

/// String, number or null. Empty string and null are `None`.
pub fn decimal_from_value(v: &Value) -> Result<Option<Decimal>> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_decimal(s).map(Some),
        Value::Number(n) => parse_decimal(&n.to_string()).map(Some),
        other => Err(BridgeError::Decode(format!("expected decimal, got {other}"))),
    }
}

/// Whole non-negative quantity; "10", 10 and "10.0" are all 10.
pub fn quantity_from_decimal(d: Decimal) -> Result<u64> {
    if d.is_sign_negative() || d.fract() != Decimal::ZERO {
        return Err(BridgeError::Decode(format!("not a whole quantity: {d}")));
    }
    d.to_u64().ok_or_else(|| BridgeError::Decode(format!("quantity out of range: {d}")))
}

/// Signed whole quantity (positions).
pub fn signed_quantity_from_decimal(d: Decimal) -> Result<i64> {
    if d.fract() != Decimal::ZERO {
        return Err(BridgeError::Decode(format!("not a whole quantity: {d}")));
    }
    d.to_i64().ok_or_else(|| BridgeError::Decode(format!("quantity out of range: {d}")))
}

pub fn parse_quantity(s: &str) -> Result<u64> {
    quantity_from_decimal(parse_decimal(s)?)
}

/// Serde adapters for native broker structs.
pub mod serde_lenient {
    use super::*;

    pub fn decimal_opt<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Decimal>, D::Error> {
        let v = Value::deserialize(d)?;
        decimal_from_value(&v).map_err(serde::de::Error::custom)
    }

    pub fn decimal_or_zero<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Decimal, D::Error> {
        decimal_opt(d).map(|v| v.unwrap_or(Decimal::ZERO))
    }

    pub fn quantity<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
        match decimal_opt(d)? {
            None => Ok(0),
            Some(x) => quantity_from_decimal(x).map_err(serde::de::Error::custom),
        }
    }

    pub fn signed_quantity<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
        match decimal_opt(d)? {
            None => Ok(0),
            Some(x) => signed_quantity_from_decimal(x).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn numbers_and_strings_parse_exactly() {
        assert_eq!(decimal_from_value(&json!("190.05")).unwrap(), Some(dec!(190.05)));
        assert_eq!(decimal_from_value(&json!(0.1)).unwrap(), Some(dec!(0.1)));
        assert_eq!(decimal_from_value(&json!(null)).unwrap(), None);
        assert_eq!(decimal_from_value(&json!("")).unwrap(), None);
        assert!(decimal_from_value(&json!(true)).is_err());
        assert_eq!(format_decimal(dec!(150.50)), "150.5");
    }

    #[test]
    fn quantities_must_be_whole() {
        assert_eq!(parse_quantity("10").unwrap(), 10);
        assert_eq!(parse_quantity("10.0").unwrap(), 10);
        assert!(parse_quantity("0.5").is_err());
        assert!(parse_quantity("-3").is_err());
        assert_eq!(signed_quantity_from_decimal(dec!(-3)).unwrap(), -3);
    }
}
