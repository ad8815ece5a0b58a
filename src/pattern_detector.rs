//! Candlestick pattern recognition over the last few closed candles.

use std::collections::VecDeque;

use crate::types::{Candle, Pattern, PatternDirection};

/// Candles kept for classification.
pub const PATTERN_LOOKBACK: usize = 5;

const MARUBOZU_BODY_SHARE: f64 = 0.8;
const MARUBOZU_BODY_VS_MEAN: f64 = 1.5;
const WICK_TO_BODY: f64 = 2.0;
const OPPOSITE_WICK_SHARE: f64 = 0.1;
const STAR_BODY_SHARE: f64 = 0.3;

/// Maps a short candle history (oldest first, at most [`PATTERN_LOOKBACK`])
/// to a pattern. Implementations must be deterministic and depend on nothing
/// but the slice.
pub trait PatternClassifier: Send + Sync {
    fn classify(&self, candles: &[Candle]) -> Option<Pattern>;
}

/// Built-in catalog. Checked in order, first match wins:
/// engulfing, morning/evening star, three soldiers/crows,
/// hammer/shooting star, marubozu.
#[derive(Clone, Copy, Debug, Default)]
pub struct CandlestickCatalog;

impl PatternClassifier for CandlestickCatalog {
    fn classify(&self, candles: &[Candle]) -> Option<Pattern> {
        engulfing(candles)
            .or_else(|| star(candles))
            .or_else(|| three_in_a_row(candles))
            .or_else(|| hammer_or_shooting_star(candles))
            .or_else(|| marubozu(candles))
    }
}

fn bullish(name: &'static str) -> Pattern {
    Pattern { direction: PatternDirection::Bullish, name }
}

fn bearish(name: &'static str) -> Pattern {
    Pattern { direction: PatternDirection::Bearish, name }
}

fn last_n(candles: &[Candle], n: usize) -> Option<&[Candle]> {
    candles.len().checked_sub(n).map(|start| &candles[start..])
}

fn engulfing(candles: &[Candle]) -> Option<Pattern> {
    let [prev, cur] = last_n(candles, 2)? else { return None };
    if cur.body() <= prev.body() {
        return None;
    }
    if prev.is_bearish() && cur.is_bullish() && cur.open <= prev.close && cur.close >= prev.open {
        return Some(bullish("bullish_engulfing"));
    }
    if prev.is_bullish() && cur.is_bearish() && cur.open >= prev.close && cur.close <= prev.open {
        return Some(bearish("bearish_engulfing"));
    }
    None
}

fn star(candles: &[Candle]) -> Option<Pattern> {
    let [first, middle, last] = last_n(candles, 3)? else { return None };
    let strong = |c: &Candle| c.range() > 0.0 && c.body() >= 0.5 * c.range();
    if !strong(first) || middle.body() > STAR_BODY_SHARE * first.body() {
        return None;
    }
    if first.is_bearish() && last.is_bullish() && last.close > first.body_mid() {
        return Some(bullish("morning_star"));
    }
    if first.is_bullish() && last.is_bearish() && last.close < first.body_mid() {
        return Some(bearish("evening_star"));
    }
    None
}

fn three_in_a_row(candles: &[Candle]) -> Option<Pattern> {
    let run = last_n(candles, 3)?;
    let soldiers = run.iter().all(Candle::is_bullish)
        && run.windows(2).all(|w| {
            w[1].close > w[0].close && w[1].open > w[0].open && w[1].open <= w[0].close
        });
    if soldiers {
        return Some(bullish("three_white_soldiers"));
    }
    let crows = run.iter().all(Candle::is_bearish)
        && run.windows(2).all(|w| {
            w[1].close < w[0].close && w[1].open < w[0].open && w[1].open >= w[0].close
        });
    if crows {
        return Some(bearish("three_black_crows"));
    }
    None
}

/// Long lower wick after a decline, or long upper wick after a rally.
fn hammer_or_shooting_star(candles: &[Candle]) -> Option<Pattern> {
    let (cur, context) = candles.split_last()?;
    if context.len() < 2 || cur.range() <= 0.0 || cur.body() <= 0.0 {
        return None;
    }
    let first_close = context.first()?.close;
    let last_close = context.last()?.close;

    let long_lower = cur.lower_wick() >= WICK_TO_BODY * cur.body()
        && cur.upper_wick() <= OPPOSITE_WICK_SHARE * cur.range();
    if long_lower && last_close < first_close {
        return Some(bullish("hammer"));
    }
    let long_upper = cur.upper_wick() >= WICK_TO_BODY * cur.body()
        && cur.lower_wick() <= OPPOSITE_WICK_SHARE * cur.range();
    if long_upper && last_close > first_close {
        return Some(bearish("shooting_star"));
    }
    None
}

/// Near-wickless candle whose body dwarfs the recent ones.
fn marubozu(candles: &[Candle]) -> Option<Pattern> {
    let (cur, context) = candles.split_last()?;
    if context.is_empty() || cur.range() <= 0.0 {
        return None;
    }
    if cur.body() < MARUBOZU_BODY_SHARE * cur.range() {
        return None;
    }
    let mean_body = context.iter().map(Candle::body).sum::<f64>() / context.len() as f64;
    if cur.body() < MARUBOZU_BODY_VS_MEAN * mean_body {
        return None;
    }
    if cur.is_bullish() {
        Some(bullish("bullish_marubozu"))
    } else if cur.is_bearish() {
        Some(bearish("bearish_marubozu"))
    } else {
        None
    }
}

/// Rolling buffer of the last [`PATTERN_LOOKBACK`] candles plus a classifier.
pub struct PatternDetector {
    candles: VecDeque<Candle>,
    classifier: Box<dyn PatternClassifier>,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternDetector {
    pub fn new() -> Self {
        Self::with_classifier(Box::new(CandlestickCatalog))
    }

    pub fn with_classifier(classifier: Box<dyn PatternClassifier>) -> Self {
        PatternDetector { candles: VecDeque::with_capacity(PATTERN_LOOKBACK + 1), classifier }
    }

    pub fn update(&mut self, candle: &Candle) {
        self.candles.push_back(candle.clone());
        if self.candles.len() > PATTERN_LOOKBACK {
            self.candles.pop_front();
        }
    }

    pub fn detect(&self) -> Option<Pattern> {
        let window: Vec<Candle> = self.candles.iter().cloned().collect();
        self.classifier.classify(&window)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { timestamp: 0, open, high, low, close, volume: 1.0, confirmed: true }
    }

    fn flat(price: f64) -> Candle {
        c(price, price, price, price)
    }

    fn classify(candles: &[Candle]) -> Option<&'static str> {
        CandlestickCatalog.classify(candles).map(|p| p.name)
    }

    #[test]
    fn engulfing_both_ways() {
        let bull = [c(101.0, 101.5, 99.5, 100.0), c(99.8, 102.5, 99.5, 102.0)];
        assert_eq!(classify(&bull), Some("bullish_engulfing"));
        let bear = [c(100.0, 101.5, 99.5, 101.0), c(101.2, 101.5, 98.5, 99.0)];
        assert_eq!(classify(&bear), Some("bearish_engulfing"));
    }

    #[test]
    fn morning_and_evening_star() {
        let morning =
            [c(105.0, 105.5, 99.5, 100.0), c(99.8, 100.2, 99.0, 99.6), c(99.8, 104.0, 99.7, 103.5)];
        assert_eq!(classify(&morning), Some("morning_star"));
        let evening =
            [c(100.0, 105.5, 99.5, 105.0), c(105.2, 106.0, 105.0, 105.4), c(105.0, 105.1, 101.0, 101.5)];
        assert_eq!(classify(&evening), Some("evening_star"));
    }

    #[test]
    fn three_soldiers_and_crows() {
        let soldiers =
            [c(100.0, 101.2, 99.9, 101.0), c(100.8, 102.2, 100.7, 102.0), c(101.8, 103.2, 101.7, 103.0)];
        assert_eq!(classify(&soldiers), Some("three_white_soldiers"));
        let crows =
            [c(103.0, 103.1, 101.8, 102.0), c(102.2, 102.3, 100.8, 101.0), c(101.2, 101.3, 99.8, 100.0)];
        assert_eq!(classify(&crows), Some("three_black_crows"));
    }

    #[test]
    fn hammer_needs_a_prior_decline() {
        let hammer = c(100.0, 100.3, 97.0, 100.2);
        let falling = [flat(104.0), flat(103.0), flat(102.0), flat(101.0), hammer.clone()];
        assert_eq!(classify(&falling), Some("hammer"));
        let rising = [flat(96.0), flat(97.0), flat(98.0), flat(99.0), hammer];
        assert_eq!(classify(&rising), None);
    }

    #[test]
    fn shooting_star_after_a_rally() {
        let star = c(100.2, 103.0, 99.9, 100.0);
        let rising = [flat(96.0), flat(97.0), flat(98.0), flat(99.0), star];
        assert_eq!(classify(&rising), Some("shooting_star"));
    }

    #[test]
    fn marubozu_requires_a_dominant_body() {
        let quiet = [flat(100.0), flat(100.0), flat(100.0), flat(100.0)];
        let mut drop = quiet.to_vec();
        drop.push(c(100.0, 100.0, 94.9, 95.0));
        assert_eq!(classify(&drop), Some("bearish_marubozu"));

        // Same candle after equally large bodies is not exceptional.
        let busy = [
            c(100.0, 105.0, 100.0, 105.0),
            c(100.0, 100.0, 95.0, 95.0),
            c(100.0, 105.0, 100.0, 105.0),
            c(100.0, 100.0, 95.0, 95.0),
            c(100.0, 100.0, 94.9, 95.0),
        ];
        assert_eq!(classify(&busy), None);
    }

    #[test]
    fn flat_tape_has_no_pattern() {
        assert_eq!(classify(&vec![flat(100.0); 5]), None);
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn detector_keeps_only_the_lookback() {
        let mut det = PatternDetector::new();
        for _ in 0..8 {
            det.update(&flat(100.0));
        }
        assert_eq!(det.len(), PATTERN_LOOKBACK);
        det.update(&c(100.0, 100.0, 94.9, 95.0));
        let p = det.detect().unwrap();
        assert_eq!(p.direction, PatternDirection::Bearish);
        assert_eq!(p.name, "bearish_marubozu");
    }

    struct AlwaysBullish;

    impl PatternClassifier for AlwaysBullish {
        fn classify(&self, candles: &[Candle]) -> Option<Pattern> {
            (!candles.is_empty()).then(|| bullish("always"))
        }
    }

    #[test]
    fn classifier_is_pluggable() {
        let mut det = PatternDetector::with_classifier(Box::new(AlwaysBullish));
        assert!(det.detect().is_none());
        det.update(&flat(100.0));
        assert_eq!(det.detect().map(|p| p.name), Some("always"));
    }
}
