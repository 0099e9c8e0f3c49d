// ===============================
// src/brokers/paper/venue.rs
// ===============================
//
// Simulated exchange state. Pure bookkeeping, no I/O:
// - listings with a last price (random walk or set explicitly)
// - order book: marketable orders fill at once, resting limit / stop
//   orders match on the next price move
// - margin: required = notional x product rate, checked against free cash
// - feed sessions: per-session subscriptions, frames pushed via channel
//
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::types::{
    PaperCommand, PaperFill, PaperFrame, PaperFunds, PaperHolding, PaperInstrument, PaperLevel, PaperModifyRequest,
    PaperOrder, PaperOrderEvent, PaperOrderRequest, PaperPosition, PaperQuote,
};
use crate::domain::{ProductType, Side};
use crate::positions::PositionTracker;

pub const OPEN: &str = "OPEN";
pub const TRIGGER_PENDING: &str = "TRIGGER_PENDING";
pub const COMPLETE: &str = "COMPLETE";
pub const CANCELED: &str = "CANCELED";
pub const REJECTED: &str = "REJECTED";

pub struct Listing {
    pub token: String,
    pub tsym: String,
    pub symname: String,
    pub cname: String,
    pub exch: String,
    pub ls: u32,
    pub ti: Decimal,
    pub last: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub last_qty: u64,
    pub volume: u64,
}

impl Listing {
    fn new(token: &str, tsym: &str, symname: &str, cname: &str, exch: &str, px: Decimal) -> Self {
        Self {
            token: token.to_string(),
            tsym: tsym.to_string(),
            symname: symname.to_string(),
            cname: cname.to_string(),
            exch: exch.to_string(),
            ls: 1,
            ti: Decimal::new(1, 2),
            last: px,
            open: px,
            high: px,
            low: px,
            close: px,
            last_qty: 0,
            volume: 0,
        }
    }

    fn key(&self) -> String {
        format!("{}|{}", self.exch, self.token)
    }

    fn move_to(&mut self, px: Decimal, qty: u64) {
        self.last = px;
        self.high = self.high.max(px);
        self.low = self.low.min(px);
        self.last_qty = qty;
        self.volume += qty;
    }
}

/// Default listings. The blank-token row stands for a suspended scrip.
pub fn default_listings() -> Vec<Listing> {
    vec![
        Listing::new("1001", "AAPL-EQ", "AAPL", "APPLE INC", "NSQ", Decimal::new(19000, 2)),
        Listing::new("1002", "MSFT-EQ", "MSFT", "MICROSOFT CORP", "NSQ", Decimal::new(41000, 2)),
        Listing::new("2001", "IBM-EQ", "IBM", "INTL BUSINESS MACHINES", "NYS", Decimal::new(18000, 2)),
        Listing::new("3001", "SPY-EQ", "SPY", "SPDR S&P 500 ETF", "ASE", Decimal::new(52000, 2)),
        Listing::new("", "OLDCO-EQ", "OLDCO", "SUSPENDED SCRIP", "NYS", Decimal::new(100, 2)),
    ]
}

#[derive(Debug)]
pub enum Inbound {
    Frame(String),
    Drop,
}

#[derive(Default)]
struct FeedSession {
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    authed: bool,
    orders: bool,
    // (exch|token, mode) -> depth levels
    subs: BTreeMap<(String, char), u8>,
}

struct OrderSlot {
    order: PaperOrder,
    blocked: Decimal,
}

/// HTTP status + venue error text.
pub type Reject = (u16, String);

fn bad(emsg: impl Into<String>) -> Reject {
    (400, emsg.into())
}

fn side_of(code: &str) -> Option<Side> {
    match code {
        "B" => Some(Side::Buy),
        "S" => Some(Side::Sell),
        _ => None,
    }
}

fn product_of(code: &str) -> Option<ProductType> {
    match code {
        "C" => Some(ProductType::Cnc),
        "I" => Some(ProductType::Mis),
        "M" => Some(ProductType::Nrml),
        _ => None,
    }
}

fn product_code(p: ProductType) -> &'static str {
    match p {
        ProductType::Cnc => "C",
        ProductType::Mis => "I",
        ProductType::Nrml => "M",
    }
}

/// Share of notional blocked as margin.
fn margin_rate(prd: &str) -> Decimal {
    match prd {
        "I" => Decimal::new(2, 1),
        "M" => Decimal::new(5, 1),
        _ => Decimal::ONE,
    }
}

fn is_working(status: &str) -> bool {
    status == OPEN || status == TRIGGER_PENDING
}

pub struct Venue {
    listings: Vec<Listing>,
    orders: Vec<OrderSlot>,
    fills: Vec<PaperFill>,
    book: PositionTracker,
    cash: Decimal,
    seq: u64,
    password: String,
    session: Option<(String, String)>,
    feeds: HashMap<u64, FeedSession>,
    next_feed: u64,
    pub refuse_connects: bool,
    pub fail_connects: u32,
}

impl Venue {
    pub fn new(starting_cash: Decimal, password: &str) -> Self {
        Self {
            listings: default_listings(),
            orders: Vec::new(),
            fills: Vec::new(),
            book: PositionTracker::new(),
            cash: starting_cash,
            seq: 0,
            password: password.to_string(),
            session: None,
            feeds: HashMap::new(),
            next_feed: 1,
            refuse_connects: false,
            fail_connects: 0,
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}{:08}", self.seq)
    }

    fn listing(&self, exch: &str, tsym_or_token: &str) -> Option<usize> {
        self.listings.iter().position(|l| {
            !l.token.is_empty() && l.exch == exch && (l.tsym == tsym_or_token || l.token == tsym_or_token)
        })
    }

    fn listing_any(&self, tsym_or_token: &str) -> Option<usize> {
        self.listings
            .iter()
            .position(|l| !l.token.is_empty() && (l.tsym == tsym_or_token || l.token == tsym_or_token))
    }

    // ---------- session ----------

    /// Any non-empty user id; the password must match when one is configured.
    pub fn login(&mut self, uid: &str, pwd: &str) -> Result<String, Reject> {
        if uid.trim().is_empty() {
            return Err((401, "Invalid Input : uid is empty".into()));
        }
        if !self.password.is_empty() && pwd != self.password {
            return Err((401, "Invalid Input : Wrong Password".into()));
        }
        let token = format!("{:032x}", rand::thread_rng().gen::<u128>());
        self.session = Some((uid.to_string(), token.clone()));
        info!(uid, "paper venue: login");
        Ok(token)
    }

    pub fn check_session(&self, token: Option<&str>) -> Result<String, Reject> {
        match (&self.session, token) {
            (Some((uid, t)), Some(got)) if t == got => Ok(uid.clone()),
            _ => Err((401, "Session Expired : Invalid Session Key".into())),
        }
    }

    // ---------- reference data ----------

    pub fn instruments(&self) -> Vec<PaperInstrument> {
        self.listings
            .iter()
            .map(|l| PaperInstrument {
                exch: l.exch.clone(),
                token: l.token.clone(),
                tsym: l.tsym.clone(),
                symname: l.symname.clone(),
                cname: l.cname.clone(),
                ls: l.ls,
                ti: l.ti,
                instname: "EQ".into(),
            })
            .collect()
    }

    pub fn last_price(&self, tsym_or_token: &str) -> Option<Decimal> {
        self.listing_any(tsym_or_token).map(|i| self.listings[i].last)
    }

    fn quote_of(&self, l: &Listing) -> PaperQuote {
        PaperQuote {
            exch: l.exch.clone(),
            token: l.token.clone(),
            tsym: l.tsym.clone(),
            lp: l.last,
            bp1: (l.last - l.ti).max(l.ti),
            bq1: 100,
            sp1: l.last + l.ti,
            sq1: 100,
            o: l.open,
            h: l.high,
            l: l.low,
            c: l.close,
            v: l.volume,
            ft: Utc::now(),
        }
    }

    /// `keys` is `EXCH|TOKEN#...`; unknown keys are left out.
    pub fn quotes(&self, keys: &str) -> Vec<PaperQuote> {
        keys.split('#')
            .filter_map(|k| k.split_once('|'))
            .filter_map(|(e, t)| self.listing(e, t))
            .map(|i| self.quote_of(&self.listings[i]))
            .collect()
    }

    // ---------- orders ----------

    fn blocked_total(&self) -> Decimal {
        self.orders.iter().filter(|s| is_working(&s.order.status)).map(|s| s.blocked).sum()
    }

    fn open_sell_qty(&self, tsym: &str, prd: &str, except: Option<&str>) -> u64 {
        self.orders
            .iter()
            .filter(|s| is_working(&s.order.status) && s.order.tsym == tsym && s.order.prd == prd)
            .filter(|s| s.order.trantype == "S" && Some(s.order.norenordno.as_str()) != except)
            .map(|s| s.order.qty - s.order.fillshares)
            .sum()
    }

    /// Margin the order needs; CNC sells must be covered by holdings.
    fn required_margin(&self, o: &PaperOrder, except: Option<&str>) -> Result<Decimal, Reject> {
        let idx = self.listing(&o.exch, &o.tsym).ok_or_else(|| bad("Invalid Trading Symbol"))?;
        let reference = if o.prctyp == "LMT" || o.prctyp == "SL-LMT" { o.prc } else { self.listings[idx].last };
        let notional = reference * Decimal::from(o.qty);
        let product = product_of(&o.prd).ok_or_else(|| bad("Invalid Product"))?;
        if o.trantype == "B" {
            return Ok(notional * margin_rate(&o.prd));
        }
        let held = self.book.quantity(&o.tsym, &o.exch, product).max(0) as u64;
        let committed = self.open_sell_qty(&o.tsym, &o.prd, except);
        let free = held.saturating_sub(committed);
        if o.prd == "C" {
            if free < o.qty {
                return Err(bad(format!("RMS:Insufficient holdings for {}, available:{free}", o.tsym)));
            }
            return Ok(Decimal::ZERO);
        }
        let short = o.qty.saturating_sub(free);
        Ok(reference * Decimal::from(short) * margin_rate(&o.prd))
    }

    fn validate(&self, o: &PaperOrder) -> Result<(), Reject> {
        let idx = self.listing(&o.exch, &o.tsym).ok_or_else(|| bad("Invalid Trading Symbol"))?;
        let l = &self.listings[idx];
        if side_of(&o.trantype).is_none() {
            return Err(bad("Invalid Transaction Type"));
        }
        if product_of(&o.prd).is_none() {
            return Err(bad("Invalid Product"));
        }
        if !matches!(o.prctyp.as_str(), "MKT" | "LMT" | "SL-LMT" | "SL-MKT") {
            return Err(bad("Invalid Price Type"));
        }
        if !matches!(o.ret.as_str(), "DAY" | "IOC") {
            return Err(bad("Invalid Retention Type"));
        }
        if o.qty == 0 || o.qty % u64::from(l.ls.max(1)) != 0 {
            return Err(bad("Invalid Quantity"));
        }
        if o.dscqty > o.qty {
            return Err(bad("Disclosed quantity cannot exceed quantity"));
        }
        if (o.prctyp == "LMT" || o.prctyp == "SL-LMT") && o.prc <= Decimal::ZERO {
            return Err(bad("Invalid Price"));
        }
        if o.prctyp.starts_with("SL") && o.trgprc <= Decimal::ZERO {
            return Err(bad("Invalid Trigger Price"));
        }
        Ok(())
    }

    pub fn place(&mut self, req: PaperOrderRequest) -> Result<String, Reject> {
        let idx = self.listing(&req.exch, &req.tsym).ok_or_else(|| bad("Invalid Trading Symbol"))?;
        let id = self.next_id("PO");
        let mut order = PaperOrder {
            norenordno: id.clone(),
            exch: req.exch,
            tsym: req.tsym,
            token: self.listings[idx].token.clone(),
            qty: req.qty,
            prc: req.prc,
            trgprc: req.trgprc,
            dscqty: req.dscqty,
            prd: req.prd,
            trantype: req.trantype,
            prctyp: req.prctyp,
            ret: req.ret,
            status: OPEN.into(),
            fillshares: 0,
            avgprc: Decimal::ZERO,
            rejreason: None,
            remarks: req.remarks,
            norentm: Utc::now(),
        };
        self.validate(&order)?;

        let blocked = match self.required_margin(&order, None) {
            Ok(required) => {
                let available = self.cash - self.blocked_total();
                if required > available {
                    Err(bad(format!(
                        "RMS:Margin Exceeds, Required:{:.2}, Available:{:.2}",
                        required.round_dp(2),
                        available.round_dp(2)
                    )))
                } else {
                    Ok(required)
                }
            }
            Err(e) => Err(e),
        };
        let blocked = match blocked {
            Ok(b) => b,
            Err(rej) => {
                order.status = REJECTED.into();
                order.rejreason = Some(rej.1.clone());
                self.emit_order(&order, "Rejected");
                self.orders.push(OrderSlot { order, blocked: Decimal::ZERO });
                debug!(order_id = %id, reason = %rej.1, "paper venue: order rejected");
                return Err(rej);
            }
        };

        if order.prctyp.starts_with("SL") {
            order.status = TRIGGER_PENDING.into();
        }
        self.emit_order(&order, "New");
        self.orders.push(OrderSlot { order, blocked });
        let slot = self.orders.len() - 1;
        self.try_execute(slot);

        let o = &mut self.orders[slot].order;
        if o.ret == "IOC" && is_working(&o.status) {
            o.status = CANCELED.into();
            let o = o.clone();
            self.orders[slot].blocked = Decimal::ZERO;
            self.emit_order(&o, "Canceled");
        }
        Ok(id)
    }

    fn slot(&self, id: &str) -> Result<usize, Reject> {
        self.orders
            .iter()
            .position(|s| s.order.norenordno == id)
            .ok_or_else(|| bad(format!("Order not found: {id}")))
    }

    pub fn modify(&mut self, id: &str, req: PaperModifyRequest) -> Result<(), Reject> {
        let slot = self.slot(id)?;
        let current = self.orders[slot].order.clone();
        if !is_working(&current.status) {
            return Err(bad(format!("Order {id} is {}, cannot modify", current.status)));
        }
        let mut next = current.clone();
        if let Some(q) = req.qty {
            next.qty = q;
        }
        if let Some(p) = req.prc {
            next.prc = p;
        }
        if let Some(t) = req.trgprc {
            next.trgprc = t;
        }
        if let Some(pt) = req.prctyp {
            next.prctyp = pt;
        }
        if let Some(r) = req.ret {
            next.ret = r;
        }
        if let Some(d) = req.dscqty {
            next.dscqty = d;
        }
        self.validate(&next)?;
        if next.qty <= next.fillshares {
            return Err(bad("Quantity cannot be below filled quantity"));
        }
        let required = self.required_margin(&next, Some(id))?;
        let available = self.cash - self.blocked_total() + self.orders[slot].blocked;
        if required > available {
            return Err(bad(format!(
                "RMS:Margin Exceeds, Required:{:.2}, Available:{:.2}",
                required.round_dp(2),
                available.round_dp(2)
            )));
        }
        next.status = if next.prctyp.starts_with("SL") && current.status == TRIGGER_PENDING {
            TRIGGER_PENDING.into()
        } else {
            OPEN.into()
        };
        next.norentm = Utc::now();
        self.emit_order(&next, "Replaced");
        self.orders[slot] = OrderSlot { order: next, blocked: required };
        self.try_execute(slot);
        Ok(())
    }

    pub fn cancel(&mut self, id: &str) -> Result<(), Reject> {
        let slot = self.slot(id)?;
        let o = &mut self.orders[slot].order;
        if !is_working(&o.status) {
            return Err(bad(format!("Order {id} is {}, cannot cancel", o.status)));
        }
        o.status = CANCELED.into();
        o.norentm = Utc::now();
        let o = o.clone();
        self.orders[slot].blocked = Decimal::ZERO;
        self.emit_order(&o, "Canceled");
        Ok(())
    }

    pub fn order(&self, id: &str) -> Result<PaperOrder, Reject> {
        self.slot(id).map(|i| self.orders[i].order.clone())
    }

    pub fn orders(&self) -> Vec<PaperOrder> {
        self.orders.iter().map(|s| s.order.clone()).collect()
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.fills.clone()
    }

    /// Fills a working order if the last price allows it. Stops trigger
    /// first, then behave like their market / limit counterpart.
    fn try_execute(&mut self, slot: usize) {
        let o = &self.orders[slot].order;
        let Some(idx) = self.listing(&o.exch, &o.tsym) else { return };
        let last = self.listings[idx].last;
        let buy = o.trantype == "B";

        if o.status == TRIGGER_PENDING {
            let triggered = if buy { last >= o.trgprc } else { last <= o.trgprc };
            if !triggered {
                return;
            }
            let o = &mut self.orders[slot].order;
            o.status = OPEN.into();
            let o = o.clone();
            self.emit_order(&o, "Triggered");
        }

        let o = &self.orders[slot].order;
        if o.status != OPEN {
            return;
        }
        let marketable = match o.prctyp.as_str() {
            "MKT" | "SL-MKT" => true,
            _ if buy => o.prc >= last,
            _ => o.prc <= last,
        };
        if marketable {
            self.fill(slot, last);
        }
    }

    fn fill(&mut self, slot: usize, px: Decimal) {
        let fill_id = self.next_id("FL");
        let o = &mut self.orders[slot].order;
        let qty = o.qty - o.fillshares;
        o.fillshares = o.qty;
        o.avgprc = px;
        o.status = COMPLETE.into();
        o.norentm = Utc::now();
        let o = o.clone();
        self.orders[slot].blocked = Decimal::ZERO;

        let (Some(side), Some(product)) = (side_of(&o.trantype), product_of(&o.prd)) else { return };
        self.book.apply(&o.tsym, &o.exch, product, side, qty, px);
        self.cash -= Decimal::from(side.sign()) * Decimal::from(qty) * px;
        self.fills.push(PaperFill {
            flid: fill_id,
            norenordno: o.norenordno.clone(),
            exch: o.exch.clone(),
            tsym: o.tsym.clone(),
            token: o.token.clone(),
            trantype: o.trantype.clone(),
            prd: o.prd.clone(),
            flqty: qty,
            flprc: px,
            fltm: Utc::now(),
        });
        if let Some(idx) = self.listing(&o.exch, &o.tsym) {
            self.listings[idx].volume += qty;
        }
        debug!(order_id = %o.norenordno, qty, %px, "paper venue: filled");
        self.emit_order(&o, "Fill");
    }

    // ---------- account ----------

    fn marks(&self) -> HashMap<String, Decimal> {
        self.listings.iter().map(|l| (l.tsym.to_ascii_uppercase(), l.last)).collect()
    }

    fn token_of(&self, exch: &str, tsym: &str) -> String {
        self.listing(exch, tsym).map(|i| self.listings[i].token.clone()).unwrap_or_default()
    }

    pub fn positions(&self) -> Vec<PaperPosition> {
        self.book
            .positions(&self.marks())
            .into_iter()
            .map(|p| PaperPosition {
                token: self.token_of(&p.exchange, &p.symbol),
                exch: p.exchange,
                tsym: p.symbol,
                prd: product_code(p.product).into(),
                netqty: p.quantity,
                netavgprc: p.average_price,
                lp: p.ltp,
                rpnl: p.realized_pnl,
                urmtom: p.unrealized_pnl,
            })
            .collect()
    }

    pub fn holdings(&self) -> Vec<PaperHolding> {
        self.positions()
            .into_iter()
            .filter(|p| p.prd == "C" && p.netqty > 0)
            .map(|p| PaperHolding {
                exch: p.exch,
                tsym: p.tsym,
                token: p.token,
                holdqty: p.netqty,
                upldprc: p.netavgprc,
                lp: p.lp,
            })
            .collect()
    }

    pub fn funds(&self) -> PaperFunds {
        let positions = self.positions();
        PaperFunds {
            stat: "Ok".into(),
            cash: self.cash,
            marginused: self.blocked_total(),
            urmtom: positions.iter().map(|p| p.urmtom).sum(),
            rpnl: positions.iter().map(|p| p.rpnl).sum(),
        }
    }

    // ---------- prices ----------

    /// Moves one instrument, matches its resting orders and publishes.
    pub fn set_price(&mut self, tsym_or_token: &str, px: Decimal, qty: u64) -> bool {
        let Some(idx) = self.listing_any(tsym_or_token) else { return false };
        self.listings[idx].move_to(px, qty);
        self.on_price(idx);
        true
    }

    /// One random-walk step for every listing, tick aligned.
    pub fn random_walk<R: Rng>(&mut self, rng: &mut R) {
        for idx in 0..self.listings.len() {
            if self.listings[idx].token.is_empty() {
                continue;
            }
            let l = &mut self.listings[idx];
            let steps: i64 = rng.gen_range(-3..=3);
            let px = (l.last + l.ti * Decimal::from(steps)).max(l.ti);
            let qty = rng.gen_range(1..=500);
            l.move_to(px, qty);
            self.on_price(idx);
        }
    }

    fn on_price(&mut self, idx: usize) {
        let (exch, tsym) = (self.listings[idx].exch.clone(), self.listings[idx].tsym.clone());
        let working: Vec<usize> = self
            .orders
            .iter()
            .enumerate()
            .filter(|(_, s)| s.order.exch == exch && s.order.tsym == tsym && is_working(&s.order.status))
            .map(|(i, _)| i)
            .collect();
        for slot in working {
            self.try_execute(slot);
        }
        self.publish_market(idx);
    }

    // ---------- feed ----------

    pub fn open_feed(&mut self, tx: mpsc::UnboundedSender<Inbound>) -> Result<u64, String> {
        if self.refuse_connects {
            return Err("paper venue: connection refused".into());
        }
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err("paper venue: connection refused".into());
        }
        let id = self.next_feed;
        self.next_feed += 1;
        self.feeds.insert(id, FeedSession { tx: Some(tx), ..FeedSession::default() });
        Ok(id)
    }

    pub fn close_feed(&mut self, id: u64) {
        self.feeds.remove(&id);
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Breaks every feed connection from the venue side.
    pub fn drop_feeds(&mut self) {
        for (_, f) in self.feeds.drain() {
            if let Some(tx) = f.tx {
                let _ = tx.send(Inbound::Drop);
            }
        }
    }

    fn send(&self, id: u64, frame: &PaperFrame) {
        if let Some(tx) = self.feeds.get(&id).and_then(|f| f.tx.as_ref()) {
            let _ = tx.send(Inbound::Frame(frame.to_json()));
        }
    }

    pub fn handle_command(&mut self, id: u64, raw: &str) {
        let cmd: PaperCommand = match serde_json::from_str(raw) {
            Ok(c) => c,
            Err(e) => {
                self.send(id, &PaperFrame::Error { emsg: format!("bad request: {e}") });
                return;
            }
        };
        let authed = self.feeds.get(&id).is_some_and(|f| f.authed);
        match cmd {
            PaperCommand::Connect { uid, susertoken } => {
                let ok = matches!(&self.session, Some((u, t)) if *u == uid && *t == susertoken);
                if let Some(f) = self.feeds.get_mut(&id) {
                    f.authed = ok;
                }
                self.send(id, &PaperFrame::ConnectAck { s: if ok { "OK" } else { "NOT_OK" }.into() });
            }
            _ if !authed => self.send(id, &PaperFrame::Error { emsg: "Session not authenticated".into() }),
            PaperCommand::Orders { .. } => {
                if let Some(f) = self.feeds.get_mut(&id) {
                    f.orders = true;
                }
                self.send(id, &PaperFrame::OrdersAck { s: "OK".into() });
            }
            PaperCommand::Subscribe { m, k, lv } => {
                let Some(mode) = m.chars().next().filter(|c| matches!(c, 'l' | 'q' | 'd')) else {
                    self.send(id, &PaperFrame::Error { emsg: format!("unknown mode '{m}'") });
                    return;
                };
                let known: Vec<usize> = k
                    .split('#')
                    .filter_map(|key| key.split_once('|'))
                    .filter_map(|(e, t)| self.listing(e, t))
                    .collect();
                if let Some(f) = self.feeds.get_mut(&id) {
                    for &i in &known {
                        f.subs.insert((self.listings[i].key(), mode), lv.clamp(1, 20));
                    }
                }
                self.send(id, &PaperFrame::SubscribeAck { m: m.clone(), k });
                // snapshot right after the ack
                for i in known {
                    let frame = self.market_frame(i, mode, lv.clamp(1, 20));
                    self.send(id, &frame);
                }
            }
            PaperCommand::Unsubscribe { m, k } => {
                let mode = m.chars().next().unwrap_or('l');
                if let Some(f) = self.feeds.get_mut(&id) {
                    for key in k.split('#') {
                        f.subs.remove(&(key.to_string(), mode));
                    }
                }
                self.send(id, &PaperFrame::UnsubscribeAck { m, k });
            }
        }
    }

    fn market_frame(&self, idx: usize, mode: char, levels: u8) -> PaperFrame {
        let l = &self.listings[idx];
        let now = Utc::now();
        match mode {
            'l' => PaperFrame::Ltp { e: l.exch.clone(), tk: l.token.clone(), lp: l.last, v: l.last_qty, ft: now },
            'q' => {
                let q = self.quote_of(l);
                PaperFrame::Quote {
                    e: q.exch,
                    tk: q.token,
                    lp: q.lp,
                    bp1: q.bp1,
                    bq1: q.bq1,
                    sp1: q.sp1,
                    sq1: q.sq1,
                    o: q.o,
                    h: q.h,
                    l: q.l,
                    c: q.c,
                    v: q.v,
                    ft: now,
                }
            }
            _ => {
                let side = |dir: i64| -> Vec<PaperLevel> {
                    (1..=i64::from(levels))
                        .map(|n| PaperLevel {
                            p: (l.last + l.ti * Decimal::from(dir * n)).max(l.ti),
                            q: 100 * n as u64,
                        })
                        .collect()
                };
                PaperFrame::Depth { e: l.exch.clone(), tk: l.token.clone(), bids: side(-1), asks: side(1), ft: now }
            }
        }
    }

    fn publish_market(&self, idx: usize) {
        let key = self.listings[idx].key();
        for (id, f) in &self.feeds {
            for ((k, mode), lv) in &f.subs {
                if *k == key {
                    self.send(*id, &self.market_frame(idx, *mode, *lv));
                }
            }
        }
    }

    fn emit_order(&self, o: &PaperOrder, reporttype: &str) {
        let ev = PaperFrame::Order(PaperOrderEvent {
            norenordno: o.norenordno.clone(),
            exch: o.exch.clone(),
            tsym: o.tsym.clone(),
            token: o.token.clone(),
            status: o.status.clone(),
            reporttype: reporttype.to_string(),
            fillshares: o.fillshares,
            avgprc: (o.fillshares > 0).then_some(o.avgprc),
            rejreason: o.rejreason.clone(),
            ft: Utc::now(),
        });
        for (id, f) in &self.feeds {
            if f.authed && f.orders {
                self.send(*id, &ev);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn req(tsym: &str, side: &str, qty: u64, prctyp: &str, prc: Decimal) -> PaperOrderRequest {
        PaperOrderRequest {
            uid: "u".into(),
            exch: "NSQ".into(),
            tsym: tsym.into(),
            qty,
            prc,
            trgprc: Decimal::ZERO,
            dscqty: 0,
            prd: "C".into(),
            trantype: side.into(),
            prctyp: prctyp.into(),
            ret: "DAY".into(),
            remarks: None,
        }
    }

    #[test]
    fn market_fills_and_limit_rests_until_price_crosses() {
        let mut v = Venue::new(dec!(100000), "");
        let id = v.place(req("AAPL-EQ", "B", 10, "MKT", Decimal::ZERO)).unwrap();
        assert_eq!(v.order(&id).unwrap().status, COMPLETE);
        assert_eq!(v.order(&id).unwrap().avgprc, dec!(190.00));

        let lim = v.place(req("AAPL-EQ", "S", 5, "LMT", dec!(191.00))).unwrap();
        assert_eq!(v.order(&lim).unwrap().status, OPEN);
        v.set_price("AAPL-EQ", dec!(191.50), 10);
        let o = v.order(&lim).unwrap();
        assert_eq!((o.status.as_str(), o.avgprc), (COMPLETE, dec!(191.50)));
        assert_eq!(v.positions()[0].netqty, 5);
    }

    #[test]
    fn margin_and_holdings_rejections_keep_raw_text() {
        let mut v = Venue::new(dec!(1000), "");
        let (code, emsg) = v.place(req("AAPL-EQ", "B", 10, "MKT", Decimal::ZERO)).unwrap_err();
        assert_eq!(code, 400);
        assert_eq!(emsg, "RMS:Margin Exceeds, Required:1900.00, Available:1000.00");
        assert_eq!(v.orders()[0].status, REJECTED);

        let (_, emsg) = v.place(req("AAPL-EQ", "S", 1, "MKT", Decimal::ZERO)).unwrap_err();
        assert!(emsg.starts_with("RMS:Insufficient holdings"));
    }

    #[test]
    fn stop_triggers_then_fills() {
        let mut v = Venue::new(dec!(100000), "");
        let mut r = req("AAPL-EQ", "B", 1, "SL-MKT", Decimal::ZERO);
        r.trgprc = dec!(195);
        let id = v.place(r).unwrap();
        assert_eq!(v.order(&id).unwrap().status, TRIGGER_PENDING);
        v.set_price("1001", dec!(194), 1);
        assert_eq!(v.order(&id).unwrap().status, TRIGGER_PENDING);
        v.set_price("1001", dec!(195.5), 1);
        assert_eq!(v.order(&id).unwrap().status, COMPLETE);
    }

    #[test]
    fn ioc_that_cannot_fill_is_cancelled() {
        let mut v = Venue::new(dec!(100000), "");
        let mut r = req("AAPL-EQ", "B", 1, "LMT", dec!(150));
        r.ret = "IOC".into();
        let id = v.place(r).unwrap();
        assert_eq!(v.order(&id).unwrap().status, CANCELED);
        assert_eq!(v.funds().marginused, Decimal::ZERO);
    }
}
