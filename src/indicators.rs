//! Rolling-window indicators.
//!
//! Each indicator keeps a bounded queue of raw observations and recomputes its
//! value from the whole window on every update. Until the window is full the
//! value is `None` and every boolean query answers `false`.

use serde::Serialize;
use std::collections::VecDeque;

use crate::types::Candle;

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    buf.push_back(value);
    while buf.len() > cap {
        buf.pop_front();
    }
}

fn mean<'a>(values: impl IntoIterator<Item = &'a f64>) -> f64 {
    let (sum, n) = values.into_iter().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

// ── Volume ────────────────────────────────────────────────────────────────────

pub struct VolumeAnalyzer {
    window: usize,
    high_mult: f64,
    low_mult: f64,
    history: VecDeque<f64>,
}

impl VolumeAnalyzer {
    pub fn new(window: usize, high_mult: f64, low_mult: f64) -> Self {
        VolumeAnalyzer {
            window: window.max(1),
            high_mult,
            low_mult,
            history: VecDeque::with_capacity(window + 1),
        }
    }

    pub fn update(&mut self, volume: f64) {
        push_bounded(&mut self.history, volume, self.window);
    }

    pub fn average(&self) -> Option<f64> {
        (self.history.len() == self.window).then(|| mean(&self.history))
    }

    /// Latest volume above `average * high_multiplier`.
    pub fn is_high_volume(&self) -> bool {
        match (self.average(), self.history.back()) {
            (Some(avg), Some(&last)) => last > avg * self.high_mult,
            _ => false,
        }
    }

    pub fn is_low_volume(&self) -> bool {
        match (self.average(), self.history.back()) {
            (Some(avg), Some(&last)) => last < avg * self.low_mult,
            _ => false,
        }
    }
}

// ── RSI ───────────────────────────────────────────────────────────────────────

pub struct RsiIndicator {
    period: usize,
    overbought: f64,
    oversold: f64,
    closes: VecDeque<f64>,
    last: Option<f64>,
}

impl RsiIndicator {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        let period = period.max(1);
        RsiIndicator {
            period,
            overbought,
            oversold,
            closes: VecDeque::with_capacity(period + 2),
            last: None,
        }
    }

    pub fn update(&mut self, close: f64) {
        push_bounded(&mut self.closes, close, self.period + 1);
        self.last = (self.closes.len() == self.period + 1).then(|| self.calculate());
    }

    fn calculate(&self) -> f64 {
        let (gains, losses) = self
            .closes
            .iter()
            .zip(self.closes.iter().skip(1))
            .map(|(prev, cur)| cur - prev)
            .fold((0.0, 0.0), |(g, l), d| if d > 0.0 { (g + d, l) } else { (g, l - d) });
        let avg_gain = gains / self.period as f64;
        let avg_loss = losses / self.period as f64;
        if avg_loss == 0.0 {
            return 100.0;
        }
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }

    pub fn value(&self) -> Option<f64> {
        self.last
    }

    pub fn is_overbought(&self) -> bool {
        self.last.map_or(false, |rsi| rsi >= self.overbought)
    }

    pub fn is_oversold(&self) -> bool {
        self.last.map_or(false, |rsi| rsi <= self.oversold)
    }
}

// ── ATR ───────────────────────────────────────────────────────────────────────

pub struct AtrIndicator {
    period: usize,
    true_ranges: VecDeque<f64>,
    last: Option<f64>,
}

impl AtrIndicator {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        AtrIndicator { period, true_ranges: VecDeque::with_capacity(period + 1), last: None }
    }

    /// `prev_close` is the close of the bar before `candle`.
    pub fn update(&mut self, candle: &Candle, prev_close: f64) {
        let tr = (candle.high - candle.low)
            .max((candle.high - prev_close).abs())
            .max((candle.low - prev_close).abs());
        push_bounded(&mut self.true_ranges, tr, self.period);
        self.last = (self.true_ranges.len() == self.period).then(|| mean(&self.true_ranges));
    }

    pub fn value(&self) -> Option<f64> {
        self.last
    }
}

// ── Trend (EMA + ADX) ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Trend {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug)]
struct Bar {
    high: f64,
    low: f64,
    close: f64,
}

/// Short/long EMA crossover for direction, Wilder ADX for strength.
pub struct TrendFilter {
    short_period: usize,
    long_period: usize,
    adx_period: usize,
    adx_threshold: f64,
    bars: VecDeque<Bar>,
    capacity: usize,
    ema_short: Option<f64>,
    ema_long: Option<f64>,
    adx: Option<f64>,
}

impl TrendFilter {
    pub fn new(short_period: usize, long_period: usize, adx_period: usize, adx_threshold: f64) -> Self {
        let short_period = short_period.max(1);
        let long_period = long_period.max(short_period);
        let adx_period = adx_period.max(1);
        // Two long periods of history keep the EMA seed well behind the newest bar;
        // ADX needs 2n bars for its first value and a few more to settle.
        let capacity = (long_period * 2).max(adx_period * 4);
        TrendFilter {
            short_period,
            long_period,
            adx_period,
            adx_threshold,
            bars: VecDeque::with_capacity(capacity + 1),
            capacity,
            ema_short: None,
            ema_long: None,
            adx: None,
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        push_bounded(
            &mut self.bars,
            Bar { high: candle.high, low: candle.low, close: candle.close },
            self.capacity,
        );
        let closes: Vec<f64> = self.bars.iter().map(|b| b.close).collect();
        self.ema_short = ema(&closes, self.short_period);
        self.ema_long = ema(&closes, self.long_period);
        let bars: Vec<Bar> = self.bars.iter().copied().collect();
        self.adx = wilder_adx(&bars, self.adx_period);
    }

    pub fn ema_short(&self) -> Option<f64> {
        self.ema_short
    }

    pub fn ema_long(&self) -> Option<f64> {
        self.ema_long
    }

    pub fn adx(&self) -> Option<f64> {
        self.adx
    }

    /// ADX strictly above the threshold.
    pub fn is_trending(&self) -> bool {
        self.adx.map_or(false, |adx| adx > self.adx_threshold)
    }

    pub fn trend(&self) -> Option<Trend> {
        match (self.ema_short, self.ema_long) {
            (Some(s), Some(l)) if s > l => Some(Trend::Up),
            (Some(s), Some(l)) if s < l => Some(Trend::Down),
            _ => None,
        }
    }
}

/// EMA over the window, seeded with the SMA of its first `period` values.
fn ema(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = mean(&values[..period]);
    Some(values[period..].iter().fold(seed, |acc, v| v * k + acc * (1.0 - k)))
}

fn directional_index(tr: f64, plus_dm: f64, minus_dm: f64) -> f64 {
    if tr <= 0.0 {
        return 0.0;
    }
    let plus_di = 100.0 * plus_dm / tr;
    let minus_di = 100.0 * minus_dm / tr;
    let sum = plus_di + minus_di;
    if sum == 0.0 { 0.0 } else { 100.0 * (plus_di - minus_di).abs() / sum }
}

/// Wilder's ADX. Needs `2 * n` bars: `n` deltas for the first smoothed DI,
/// then `n` DX values for the first ADX.
fn wilder_adx(bars: &[Bar], n: usize) -> Option<f64> {
    if n == 0 || bars.len() < 2 * n {
        return None;
    }
    let mut tr = Vec::with_capacity(bars.len());
    let mut plus_dm = Vec::with_capacity(bars.len());
    let mut minus_dm = Vec::with_capacity(bars.len());
    for w in bars.windows(2) {
        let (prev, cur) = (w[0], w[1]);
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        tr.push(
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs()),
        );
    }

    let nf = n as f64;
    let mut s_tr: f64 = tr[..n].iter().sum();
    let mut s_plus: f64 = plus_dm[..n].iter().sum();
    let mut s_minus: f64 = minus_dm[..n].iter().sum();
    let mut dx = vec![directional_index(s_tr, s_plus, s_minus)];
    for i in n..tr.len() {
        s_tr = s_tr - s_tr / nf + tr[i];
        s_plus = s_plus - s_plus / nf + plus_dm[i];
        s_minus = s_minus - s_minus / nf + minus_dm[i];
        dx.push(directional_index(s_tr, s_plus, s_minus));
    }
    if dx.len() < n {
        return None;
    }
    let first = mean(&dx[..n]);
    Some(dx[n..].iter().fold(first, |adx, v| (adx * (nf - 1.0) + v) / nf))
}
