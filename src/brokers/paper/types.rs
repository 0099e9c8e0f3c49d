// ===============================
// src/brokers/paper/types.rs
// ===============================
//
// Wire format of the paper venue. Token based, short field names, prices
// as decimal strings:
//   exch  NSQ | NYS | ASE          trantype  B | S
//   prd   C | I | M                prctyp    MKT | LMT | SL-LMT | SL-MKT
//   ret   DAY | IOC                status    OPEN | TRIGGER_PENDING | COMPLETE | CANCELED | REJECTED
//
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::transform::num::serde_lenient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperLogin {
    pub uid: String,
    pub pwd: String,
}

/// Generic `{"stat":"Ok"|"Not_Ok", ...}` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperReply {
    pub stat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emsg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub norenordno: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub susertoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uname: Option<String>,
}

impl PaperReply {
    pub fn ok() -> Self {
        Self { stat: "Ok".into(), ..Self::default() }
    }

    pub fn not_ok(emsg: impl Into<String>) -> Self {
        Self { stat: "Not_Ok".into(), emsg: Some(emsg.into()), ..Self::default() }
    }

    pub fn is_ok(&self) -> bool {
        self.stat.eq_ignore_ascii_case("ok")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOrderRequest {
    pub uid: String,
    pub exch: String,
    pub tsym: String,
    #[serde(deserialize_with = "serde_lenient::quantity")]
    pub qty: u64,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub prc: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::decimal_or_zero")]
    pub trgprc: Decimal,
    #[serde(default, deserialize_with = "serde_lenient::quantity")]
    pub dscqty: u64,
    pub prd: String,
    pub trantype: String,
    pub prctyp: String,
    pub ret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
}

/// Only the fields present are changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperModifyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prc: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trgprc: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prctyp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dscqty: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOrder {
    pub norenordno: String,
    pub exch: String,
    pub tsym: String,
    pub token: String,
    pub qty: u64,
    pub prc: Decimal,
    pub trgprc: Decimal,
    pub dscqty: u64,
    pub prd: String,
    pub trantype: String,
    pub prctyp: String,
    pub ret: String,
    pub status: String,
    pub fillshares: u64,
    pub avgprc: Decimal,
    #[serde(default)]
    pub rejreason: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
    pub norentm: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperFill {
    pub flid: String,
    pub norenordno: String,
    pub exch: String,
    pub tsym: String,
    pub token: String,
    pub trantype: String,
    pub prd: String,
    pub flqty: u64,
    pub flprc: Decimal,
    pub fltm: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub exch: String,
    pub tsym: String,
    pub token: String,
    pub prd: String,
    pub netqty: i64,
    pub netavgprc: Decimal,
    #[serde(default)]
    pub lp: Option<Decimal>,
    pub rpnl: Decimal,
    pub urmtom: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperHolding {
    pub exch: String,
    pub tsym: String,
    pub token: String,
    pub holdqty: i64,
    pub upldprc: Decimal,
    #[serde(default)]
    pub lp: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperFunds {
    pub stat: String,
    pub cash: Decimal,
    pub marginused: Decimal,
    pub urmtom: Decimal,
    pub rpnl: Decimal,
}

/// One row of the instrument master. `token` may be blank for suspended
/// scrips; the mapping cache skips such rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperInstrument {
    pub exch: String,
    pub token: String,
    pub tsym: String,
    pub symname: String,
    #[serde(default)]
    pub cname: String,
    pub ls: u32,
    pub ti: Decimal,
    pub instname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperQuote {
    pub exch: String,
    pub token: String,
    pub tsym: String,
    pub lp: Decimal,
    pub bp1: Decimal,
    pub bq1: u64,
    pub sp1: Decimal,
    pub sq1: u64,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    pub v: u64,
    pub ft: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperLevel {
    pub p: Decimal,
    pub q: u64,
}

/// Order event pushed on the feed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOrderEvent {
    pub norenordno: String,
    pub exch: String,
    pub tsym: String,
    pub token: String,
    pub status: String,
    pub reporttype: String,
    pub fillshares: u64,
    #[serde(default)]
    pub avgprc: Option<Decimal>,
    #[serde(default)]
    pub rejreason: Option<String>,
    pub ft: DateTime<Utc>,
}

/// Client -> venue feed commands. `k` is `EXCH|TOKEN#EXCH|TOKEN...`,
/// `m` is l (ltp) | q (quote) | d (depth).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum PaperCommand {
    #[serde(rename = "c")]
    Connect { uid: String, susertoken: String },
    #[serde(rename = "o")]
    Orders { uid: String },
    #[serde(rename = "s")]
    Subscribe {
        m: String,
        k: String,
        #[serde(default)]
        lv: u8,
    },
    #[serde(rename = "u")]
    Unsubscribe { m: String, k: String },
}

/// Venue -> client feed frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum PaperFrame {
    #[serde(rename = "ck")]
    ConnectAck { s: String },
    #[serde(rename = "ok")]
    OrdersAck { s: String },
    #[serde(rename = "sk")]
    SubscribeAck { m: String, k: String },
    #[serde(rename = "uk")]
    UnsubscribeAck { m: String, k: String },
    #[serde(rename = "lf")]
    Ltp { e: String, tk: String, lp: Decimal, v: u64, ft: DateTime<Utc> },
    #[serde(rename = "qf")]
    Quote {
        e: String,
        tk: String,
        lp: Decimal,
        bp1: Decimal,
        bq1: u64,
        sp1: Decimal,
        sq1: u64,
        o: Decimal,
        h: Decimal,
        l: Decimal,
        c: Decimal,
        v: u64,
        ft: DateTime<Utc>,
    },
    #[serde(rename = "df")]
    Depth { e: String, tk: String, bids: Vec<PaperLevel>, asks: Vec<PaperLevel>, ft: DateTime<Utc> },
    #[serde(rename = "om")]
    Order(PaperOrderEvent),
    #[serde(rename = "er")]
    Error { emsg: String },
}

impl PaperFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"t":"er","emsg":"{e}"}}"#))
    }
}
