//! Candle-in, signal-out pipeline.
//!
//! [`MarketAnalyzer`] owns every indicator, the zone tracker and the pattern
//! detector. Each confirmed candle updates them in a fixed order, then the
//! validator decides and the stop/target ladder is derived from the zone that
//! confirmed the pattern.

use serde::Serialize;

use crate::config::TradingConfig;
use crate::indicators::{AtrIndicator, RsiIndicator, Trend, TrendFilter, VolumeAnalyzer};
use crate::pattern_detector::{PatternClassifier, PatternDetector};
use crate::signal_validator::{Confirmation, MarketView, SignalValidator};
use crate::types::{Candle, Direction, Signal};
use crate::zones::ZoneTracker;

/// Point-in-time indicator readings for logs and notifications.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub timestamp: Option<i64>,
    pub volume_average: Option<f64>,
    pub high_volume: bool,
    pub low_volume: bool,
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub ema_short: Option<f64>,
    pub ema_long: Option<f64>,
    pub adx: Option<f64>,
    pub trending: bool,
    pub trend: Option<Trend>,
    pub support_zones: usize,
    pub resistance_zones: usize,
}

pub struct MarketAnalyzer {
    cfg: TradingConfig,
    patterns: PatternDetector,
    volume: VolumeAnalyzer,
    rsi: RsiIndicator,
    zones: ZoneTracker,
    atr: AtrIndicator,
    trend: TrendFilter,
    validator: SignalValidator,
    prev_candle: Option<Candle>,
    generated: Vec<Signal>,
}

impl MarketAnalyzer {
    pub fn new(cfg: TradingConfig) -> Self {
        Self::with_detector(cfg, PatternDetector::new())
    }

    pub fn with_classifier(cfg: TradingConfig, classifier: Box<dyn PatternClassifier>) -> Self {
        Self::with_detector(cfg, PatternDetector::with_classifier(classifier))
    }

    fn with_detector(cfg: TradingConfig, patterns: PatternDetector) -> Self {
        MarketAnalyzer {
            patterns,
            volume: VolumeAnalyzer::new(
                cfg.volume_window,
                cfg.volume_high_multiplier,
                cfg.volume_low_multiplier,
            ),
            rsi: RsiIndicator::new(cfg.rsi_period, cfg.rsi_overbought, cfg.rsi_oversold),
            zones: ZoneTracker::new(cfg.zone_tolerance),
            atr: AtrIndicator::new(cfg.atr_period),
            trend: TrendFilter::new(
                cfg.ema_short_period,
                cfg.ema_long_period,
                cfg.adx_period,
                cfg.adx_threshold,
            ),
            validator: SignalValidator::new(&cfg),
            prev_candle: None,
            generated: Vec::new(),
            cfg,
        }
    }

    /// Feed one candle. Unconfirmed, malformed or stale candles leave every
    /// indicator untouched and return `None`.
    pub fn generate_signal(&mut self, candle: &Candle) -> Option<Signal> {
        let signal = self.process(candle)?;
        self.generated.push(signal.clone());
        Some(signal)
    }

    /// Replay closed history to fill the indicator windows. Signals raised on
    /// old bars are dropped. Returns how many candles were ingested.
    pub fn warm_up(&mut self, candles: &[Candle]) -> usize {
        let mut ingested = 0;
        for candle in candles {
            let before = self.prev_candle.as_ref().map(|c| c.timestamp);
            let _ = self.process(candle);
            if self.prev_candle.as_ref().map(|c| c.timestamp) != before {
                ingested += 1;
            }
        }
        log::info!("warm-up: {} of {} candles ingested", ingested, candles.len());
        ingested
    }

    pub fn generated_signals(&self) -> &[Signal] {
        &self.generated
    }

    pub fn zones(&self) -> &ZoneTracker {
        &self.zones
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot {
            timestamp: self.prev_candle.as_ref().map(|c| c.timestamp),
            volume_average: self.volume.average(),
            high_volume: self.volume.is_high_volume(),
            low_volume: self.volume.is_low_volume(),
            rsi: self.rsi.value(),
            atr: self.atr.value(),
            ema_short: self.trend.ema_short(),
            ema_long: self.trend.ema_long(),
            adx: self.trend.adx(),
            trending: self.trend.is_trending(),
            trend: self.trend.trend(),
            support_zones: self.zones.support_zones().len(),
            resistance_zones: self.zones.resistance_zones().len(),
        }
    }

    fn process(&mut self, candle: &Candle) -> Option<Signal> {
        if !candle.confirmed {
            return None;
        }
        if let Err(e) = candle.validate() {
            log::error!("skipping candle @{}: {}", candle.timestamp, e);
            return None;
        }
        if let Some(prev) = &self.prev_candle {
            if candle.timestamp <= prev.timestamp {
                log::warn!(
                    "skipping candle @{}: not after last ingested @{}",
                    candle.timestamp, prev.timestamp
                );
                return None;
            }
        }

        self.ingest(candle);

        let pattern = self.patterns.detect();
        let view = MarketView { zones: &self.zones, volume: &self.volume, rsi: &self.rsi };
        let confirmation = self.validator.validate(pattern.as_ref(), candle, &view)?;
        self.build_signal(&confirmation, candle.close)
    }

    fn ingest(&mut self, candle: &Candle) {
        self.patterns.update(candle);
        self.volume.update(candle.volume);
        self.rsi.update(candle.close);
        self.zones.update_zones(candle);
        // ATR reads the previous close before prev_candle moves forward.
        let prev_close = self.prev_candle.as_ref().map_or(candle.close, |c| c.close);
        self.atr.update(candle, prev_close);
        self.trend.update(candle);
        self.prev_candle = Some(candle.clone());
    }

    fn build_signal(&self, conf: &Confirmation, entry: f64) -> Option<Signal> {
        let level = conf.zone.level;
        let stop_loss = match conf.direction {
            Direction::Long => {
                let anchor = level.min(entry) * (1.0 - self.cfg.sl_buffer);
                entry - (entry - anchor) * self.cfg.sl_adjustment
            }
            Direction::Short => {
                let anchor = level.max(entry) * (1.0 + self.cfg.sl_buffer);
                entry + (anchor - entry) * self.cfg.sl_adjustment
            }
        };

        let risk = (entry - stop_loss).abs();
        if !risk.is_finite() || risk <= 0.0 {
            log::debug!("{} {} dropped: zero risk", conf.direction, conf.pattern);
            return None;
        }
        if risk / entry > self.cfg.max_risk_fraction {
            log::info!(
                "{} {} dropped: risk {:.2}% above ceiling {:.2}%",
                conf.direction,
                conf.pattern,
                risk / entry * 100.0,
                self.cfg.max_risk_fraction * 100.0
            );
            return None;
        }

        let sign = conf.direction.sign();
        let signal = Signal {
            direction: conf.direction,
            kind: conf.pattern.to_string(),
            timestamp: conf.timestamp,
            entry,
            stop_loss,
            take_profit_1: entry + sign * risk,
            take_profit_2: entry + sign * risk * self.cfg.tp2_risk_multiple,
        };
        log::info!(
            "signal {} {} @ {:.4} SL {:.4} TP1 {:.4} TP2 {:.4} (zone {:.4}, {} touches)",
            signal.direction,
            signal.kind,
            signal.entry,
            signal.stop_loss,
            signal.take_profit_1,
            signal.take_profit_2,
            level,
            conf.zone.touches
        );
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { timestamp: ts, open, high, low, close, volume, confirmed: true }
    }

    fn flat_run(n: i64) -> Vec<Candle> {
        (0..n).map(|i| bar(i, 100.0, 100.0, 100.0, 100.0, 1.0)).collect()
    }

    fn cfg() -> TradingConfig {
        TradingConfig { volume_window: 5, ..TradingConfig::default() }
    }

    #[test]
    fn unconfirmed_and_malformed_candles_change_nothing() {
        let mut an = MarketAnalyzer::new(cfg());
        let mut open_bar = bar(1, 100.0, 101.0, 99.0, 100.0, 1.0);
        open_bar.confirmed = false;
        assert!(an.generate_signal(&open_bar).is_none());
        assert!(an.generate_signal(&bar(2, 100.0, 99.0, 101.0, 100.0, 1.0)).is_none());
        let snap = an.snapshot();
        assert_eq!(snap.timestamp, None);
        assert_eq!(snap.support_zones, 0);
    }

    #[test]
    fn stale_candles_are_skipped() {
        let mut an = MarketAnalyzer::new(cfg());
        an.generate_signal(&bar(10, 100.0, 100.0, 100.0, 100.0, 1.0));
        an.generate_signal(&bar(10, 100.0, 120.0, 80.0, 100.0, 1.0));
        assert_eq!(an.zones().resistance_zones()[0].level, 100.0);
        assert_eq!(an.snapshot().timestamp, Some(10));
    }

    #[test]
    fn breakdown_short_end_to_end() {
        let mut an = MarketAnalyzer::new(cfg());
        for c in flat_run(9) {
            assert!(an.generate_signal(&c).is_none());
        }
        let s = an.generate_signal(&bar(9, 100.0, 100.0, 94.9, 95.0, 10.0)).unwrap();
        assert_eq!(s.direction, Direction::Short);
        assert_eq!(s.kind, "bearish_marubozu");
        assert_eq!(s.entry, 95.0);
        // max(94.9, 95) * 1.004 = 95.38, widened by 1.2
        assert!((s.stop_loss - 95.456).abs() < 1e-9);
        assert!(s.take_profit_1 < s.entry && s.entry < s.stop_loss);
        assert!((s.take_profit_2 - (95.0 - 0.456 * 1.5)).abs() < 1e-9);
        assert_eq!(an.generated_signals().len(), 1);
    }

    #[test]
    fn breakout_long_end_to_end() {
        let mut an = MarketAnalyzer::new(cfg());
        for c in flat_run(9) {
            an.generate_signal(&c);
        }
        let s = an.generate_signal(&bar(9, 100.0, 105.1, 100.0, 105.0, 10.0)).unwrap();
        assert_eq!(s.direction, Direction::Long);
        assert_eq!(s.kind, "bullish_marubozu");
        assert!(s.stop_loss < s.entry && s.entry < s.take_profit_1);
        assert!(s.take_profit_1 < s.take_profit_2);
    }

    #[test]
    fn risk_ceiling_suppresses_both_directions() {
        let tight = TradingConfig { max_risk_fraction: 0.004, ..cfg() };
        for last in [bar(9, 100.0, 100.0, 94.9, 95.0, 10.0), bar(9, 100.0, 105.1, 100.0, 105.0, 10.0)] {
            let mut an = MarketAnalyzer::new(tight.clone());
            for c in flat_run(9) {
                an.generate_signal(&c);
            }
            assert!(an.generate_signal(&last).is_none());
            assert!(an.generated_signals().is_empty());
        }
    }

    #[test]
    fn quiet_volume_blocks_the_breakdown() {
        let mut an = MarketAnalyzer::new(cfg());
        for c in flat_run(9) {
            an.generate_signal(&c);
        }
        assert!(an.generate_signal(&bar(9, 100.0, 100.0, 94.9, 95.0, 1.0)).is_none());
    }

    #[test]
    fn warm_up_fills_windows_without_recording_signals() {
        let mut history = flat_run(9);
        history.push(bar(9, 100.0, 100.0, 94.9, 95.0, 10.0));
        let mut an = MarketAnalyzer::new(cfg());
        assert_eq!(an.warm_up(&history), 10);
        assert!(an.generated_signals().is_empty());
        let snap = an.snapshot();
        assert_eq!(snap.timestamp, Some(9));
        assert!(snap.volume_average.is_some());
        assert!(snap.high_volume);
        assert_eq!(snap.rsi, None);
    }
}
