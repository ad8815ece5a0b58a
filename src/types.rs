use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Bybit `confirm`: the interval has closed and the bar will not change again.
    pub confirmed: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("{field} is not a finite number ({value})")]
    NonFinite { field: &'static str, value: f64 },
    #[error("{field} must be positive ({value})")]
    NonPositive { field: &'static str, value: f64 },
    #[error("high {high} is below low {low}")]
    InvertedRange { high: f64, low: f64 },
    #[error("negative volume {0}")]
    NegativeVolume(f64),
}

impl Candle {
    pub fn validate(&self) -> Result<(), CandleError> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(CandleError::NonFinite { field, value });
            }
        }
        for &(field, value) in &fields[..4] {
            if value <= 0.0 {
                return Err(CandleError::NonPositive { field, value });
            }
        }
        if self.high < self.low {
            return Err(CandleError::InvertedRange { high: self.high, low: self.low });
        }
        if self.volume < 0.0 {
            return Err(CandleError::NegativeVolume(self.volume));
        }
        Ok(())
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }

    pub fn body_mid(&self) -> f64 {
        (self.open + self.close) / 2.0
    }
}

// ── Signals ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side of the order that opens a position in this direction.
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side of the reduce-only orders (SL, TP, market close).
    pub fn exit_side(self) -> Side {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short. Multiplies price moves into PnL.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// A stop sits below a long and above a short, so it triggers on the opposite move.
    pub fn stop_trigger(self) -> TriggerDirection {
        match self {
            Direction::Long => TriggerDirection::Falling,
            Direction::Short => TriggerDirection::Rising,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternDirection {
    Bullish,
    Bearish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub direction: PatternDirection,
    pub name: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Signal {
    pub direction: Direction,
    /// Name of the candlestick pattern that produced the signal.
    pub kind: String,
    pub timestamp: i64,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
}

impl Signal {
    pub fn risk(&self) -> f64 {
        (self.entry - self.stop_loss).abs()
    }
}

// ── Orders ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn from_bybit(s: &str) -> Option<Side> {
        match s {
            "Buy" => Some(Side::Buy),
            "Sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bybit `triggerDirection`: 1 = triggered when price rises to the trigger, 2 = when it falls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerDirection {
    Rising,
    Falling,
}

impl TriggerDirection {
    pub fn code(self) -> u8 {
        match self {
            TriggerDirection::Rising => 1,
            TriggerDirection::Falling => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpMode {
    Single,
    #[default]
    Dual,
}

impl FromStr for TpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(TpMode::Single),
            "dual" => Ok(TpMode::Dual),
            other => Err(format!("tp mode must be 'single' or 'dual', got '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Untriggered,
    Triggered,
    Deactivated,
    Other(String),
}

impl OrderStatus {
    pub fn from_bybit(s: &str) -> OrderStatus {
        match s {
            "New" | "Created" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "PartiallyFilledCanceled" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            "Untriggered" => OrderStatus::Untriggered,
            "Triggered" => OrderStatus::Triggered,
            "Deactivated" => OrderStatus::Deactivated,
            other => OrderStatus::Other(other.to_string()),
        }
    }

    /// Order left the book without (fully) filling.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Deactivated
        )
    }
}

/// Point-in-time order status as returned by a REST query.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderState {
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
}

/// Push notification from the private order stream.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderUpdate {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub updated_time: i64,
    pub cum_exec_qty: f64,
    pub avg_price: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub trigger_price: f64,
    pub reduce_only: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExchangePosition {
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
}

// ── Symbol rules / rounding ──────────────────────────────────────────────────

/// Instrument filters from `instruments-info`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SymbolRules {
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_qty: f64,
}

// Absorbs binary representation error so 0.3 / 0.1 floors to 3 steps, not 2.
const STEP_EPSILON: f64 = 1e-9;

pub fn step_decimals(step: f64) -> usize {
    let s = format!("{}", step);
    s.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0)
}

pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let steps = (value / step + STEP_EPSILON).floor();
    let factor = 10f64.powi(step_decimals(step) as i32);
    (steps * step * factor).round() / factor
}

impl SymbolRules {
    /// Floor to the tick grid. Never rounds a stop or target past the computed price.
    pub fn floor_price(&self, price: f64) -> f64 {
        floor_to_step(price, self.tick_size)
    }

    /// Floor to the lot step, then lift to the exchange minimum.
    pub fn clamp_qty(&self, qty: f64) -> f64 {
        floor_to_step(qty, self.qty_step).max(self.min_qty)
    }

    /// Wire form of a quantity, floored to the lot step.
    pub fn format_qty(&self, qty: f64) -> String {
        format!("{:.*}", step_decimals(self.qty_step), floor_to_step(qty, self.qty_step))
    }

    /// Wire form of a price, floored to the tick.
    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", step_decimals(self.tick_size), self.floor_price(price))
    }
}

// ── Positions ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Leg {
    Entry,
    StopLoss,
    TakeProfit1,
    TakeProfit2,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Position {
    /// Entry order id.
    pub order_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    /// Remaining size. Re-read from the exchange after a partial take-profit.
    pub quantity: f64,
    pub initial_quantity: f64,
    pub tp1_hit: bool,
    pub sl_order_id: Option<String>,
    pub tp1_order_id: Option<String>,
    pub tp2_order_id: Option<String>,
    pub active_order_ids: BTreeSet<String>,
    /// Cumulative executed qty per order id, from partial-fill notifications.
    pub leg_fills: HashMap<String, f64>,
    /// PnL already banked by a partial take-profit.
    pub realized_profit: f64,
    pub closed: bool,
    pub opened_at: i64,
}

impl Position {
    pub fn leg_of(&self, order_id: &str) -> Option<Leg> {
        if self.order_id == order_id {
            Some(Leg::Entry)
        } else if self.sl_order_id.as_deref() == Some(order_id) {
            Some(Leg::StopLoss)
        } else if self.tp1_order_id.as_deref() == Some(order_id) {
            Some(Leg::TakeProfit1)
        } else if self.tp2_order_id.as_deref() == Some(order_id) {
            Some(Leg::TakeProfit2)
        } else {
            None
        }
    }

    pub fn profit_at(&self, price: f64) -> f64 {
        (price - self.entry) * self.quantity * self.direction.sign()
    }

    /// Bank `qty` closed at `price` and shrink the open size.
    pub fn book_partial(&mut self, price: f64, qty: f64) {
        let qty = qty.max(0.0).min(self.quantity);
        self.realized_profit += (price - self.entry) * qty * self.direction.sign();
        self.quantity -= qty;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TakeProfit2,
    Manual,
    Reconciled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "SL",
            CloseReason::TakeProfit => "TP",
            CloseReason::TakeProfit2 => "TP2",
            CloseReason::Manual => "ManualClose",
            CloseReason::Reconciled => "Reconciled",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub close_price: f64,
    pub close_time: i64,
    pub reason: CloseReason,
    pub profit: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { timestamp: 0, open, high, low, close, volume: 1.0, confirmed: true }
    }

    #[test]
    fn validate_rejects_malformed_candles() {
        assert!(candle(100.0, 101.0, 99.0, 100.5).validate().is_ok());
        assert_eq!(
            candle(100.0, 99.0, 101.0, 100.0).validate(),
            Err(CandleError::InvertedRange { high: 99.0, low: 101.0 })
        );
        assert!(matches!(
            candle(f64::NAN, 101.0, 99.0, 100.0).validate(),
            Err(CandleError::NonFinite { field: "open", .. })
        ));
        assert!(matches!(
            candle(100.0, 101.0, 0.0, 100.0).validate(),
            Err(CandleError::NonPositive { field: "low", .. })
        ));
        let mut c = candle(100.0, 101.0, 99.0, 100.0);
        c.volume = -1.0;
        assert_eq!(c.validate(), Err(CandleError::NegativeVolume(-1.0)));
    }

    #[test]
    fn floors_never_round_up() {
        let rules = SymbolRules { tick_size: 0.1, qty_step: 0.001, min_qty: 0.001 };
        assert_eq!(rules.floor_price(100.19), 100.1);
        assert_eq!(rules.floor_price(100.3), 100.3);
        assert_eq!(rules.clamp_qty(0.0129), 0.012);
        assert_eq!(rules.clamp_qty(0.0004), 0.001);
        assert_eq!(floor_to_step(0.3, 0.1), 0.3);
        assert_eq!(floor_to_step(7.0, 1.0), 7.0);
    }

    #[test]
    fn formats_with_step_precision() {
        let rules = SymbolRules { tick_size: 0.01, qty_step: 0.001, min_qty: 0.001 };
        assert_eq!(rules.format_qty(3.3333), "3.333");
        assert_eq!(rules.format_price(100.5), "100.50");
        // Submission never rounds up, even for values that skipped flooring.
        assert_eq!(rules.format_qty(3.3339), "3.333");
        assert_eq!(rules.format_price(100.129), "100.12");
        assert_eq!(step_decimals(1.0), 0);
        assert_eq!(step_decimals(0.00001), 5);
    }

    #[test]
    fn tp_mode_parses_case_insensitively() {
        assert_eq!("Dual".parse::<TpMode>(), Ok(TpMode::Dual));
        assert_eq!("single".parse::<TpMode>(), Ok(TpMode::Single));
        assert!("triple".parse::<TpMode>().is_err());
    }

    #[test]
    fn stop_triggers_against_the_position() {
        assert_eq!(Direction::Long.stop_trigger(), TriggerDirection::Falling);
        assert_eq!(Direction::Short.stop_trigger().code(), 1);
        assert_eq!(Direction::Short.exit_side(), Side::Buy);
    }
}
