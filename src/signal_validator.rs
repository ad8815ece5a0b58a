use crate::config::TradingConfig;
use crate::indicators::{RsiIndicator, VolumeAnalyzer};
use crate::types::{Candle, Direction, Pattern, PatternDirection};
use crate::zones::{ZoneHit, ZoneKind, ZoneTracker};

/// Borrowed view of the indicator state the validator reads.
pub struct MarketView<'a> {
    pub zones: &'a ZoneTracker,
    pub volume: &'a VolumeAnalyzer,
    pub rsi: &'a RsiIndicator,
}

/// A pattern that passed the gate, with the zone that confirmed it.
#[derive(Clone, Debug, PartialEq)]
pub struct Confirmation {
    pub direction: Direction,
    pub pattern: &'static str,
    pub timestamp: i64,
    pub zone: ZoneHit,
}

pub struct SignalValidator {
    rsi_max_for_long: f64,
    rsi_min_for_short: f64,
    min_touches: u32,
}

impl SignalValidator {
    pub fn new(cfg: &TradingConfig) -> Self {
        SignalValidator {
            rsi_max_for_long: cfg.rsi_max_for_long,
            rsi_min_for_short: cfg.rsi_min_for_short,
            min_touches: cfg.zone_min_touches,
        }
    }

    /// RSI veto first, then the zone/volume/RSI table:
    ///
    /// | pattern | zone       | needs                   | result           |
    /// |---------|------------|-------------------------|------------------|
    /// | bullish | support    | oversold or high volume | long (bounce)    |
    /// | bullish | resistance | high volume             | long (breakout)  |
    /// | bearish | resistance | overbought or high vol. | short (bounce)   |
    /// | bearish | support    | high volume             | short (breakdown)|
    pub fn validate(
        &self,
        pattern: Option<&Pattern>,
        candle: &Candle,
        view: &MarketView<'_>,
    ) -> Option<Confirmation> {
        let pattern = pattern?;

        if let Some(rsi) = view.rsi.value() {
            match pattern.direction {
                PatternDirection::Bullish if rsi >= self.rsi_max_for_long => {
                    log::debug!("{} vetoed: RSI {:.1} >= {}", pattern.name, rsi, self.rsi_max_for_long);
                    return None;
                }
                PatternDirection::Bearish if rsi <= self.rsi_min_for_short => {
                    log::debug!("{} vetoed: RSI {:.1} <= {}", pattern.name, rsi, self.rsi_min_for_short);
                    return None;
                }
                _ => {}
            }
        }

        let zone = view.zones.is_near_zone(candle.close, self.min_touches)?;
        let high_vol = view.volume.is_high_volume();

        let direction = match (pattern.direction, zone.kind) {
            (PatternDirection::Bullish, ZoneKind::Support)
                if view.rsi.is_oversold() || high_vol => Direction::Long,
            (PatternDirection::Bullish, ZoneKind::Resistance) if high_vol => Direction::Long,
            (PatternDirection::Bearish, ZoneKind::Resistance)
                if view.rsi.is_overbought() || high_vol => Direction::Short,
            (PatternDirection::Bearish, ZoneKind::Support) if high_vol => Direction::Short,
            _ => return None,
        };

        Some(Confirmation { direction, pattern: pattern.name, timestamp: candle.timestamp, zone })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: 42,
            open: close,
            high: close + 0.1,
            low: close - 0.1,
            close,
            volume,
            confirmed: true,
        }
    }

    struct Fixture {
        zones: ZoneTracker,
        volume: VolumeAnalyzer,
        rsi: RsiIndicator,
    }

    impl Fixture {
        /// Support at 99.9 and resistance at 100.1 from a single bar, overlapping within 1%.
        fn new() -> Self {
            let mut zones = ZoneTracker::new(0.01);
            zones.update_zones(&candle(100.0, 1.0));
            Fixture {
                zones,
                volume: VolumeAnalyzer::new(3, 1.5, 0.5),
                rsi: RsiIndicator::new(2, 65.0, 35.0),
            }
        }

        fn volumes(mut self, v: &[f64]) -> Self {
            v.iter().for_each(|&x| self.volume.update(x));
            self
        }

        fn closes(mut self, c: &[f64]) -> Self {
            c.iter().for_each(|&x| self.rsi.update(x));
            self
        }

        fn view(&self) -> MarketView<'_> {
            MarketView { zones: &self.zones, volume: &self.volume, rsi: &self.rsi }
        }
    }

    fn validator(max_long: f64, min_short: f64) -> SignalValidator {
        let cfg = TradingConfig {
            rsi_max_for_long: max_long,
            rsi_min_for_short: min_short,
            ..TradingConfig::default()
        };
        SignalValidator::new(&cfg)
    }

    const BULL: Pattern = Pattern { direction: PatternDirection::Bullish, name: "bull" };
    const BEAR: Pattern = Pattern { direction: PatternDirection::Bearish, name: "bear" };

    #[test]
    fn no_pattern_no_signal() {
        let fx = Fixture::new().volumes(&[1.0, 1.0, 10.0]);
        assert!(validator(70.0, 30.0).validate(None, &candle(100.0, 10.0), &fx.view()).is_none());
    }

    #[test]
    fn rsi_veto_beats_a_confirming_matrix() {
        // All gains: RSI 100. Support is near and volume is high.
        let fx = Fixture::new().volumes(&[1.0, 1.0, 10.0]).closes(&[98.0, 99.0, 100.0]);
        let c = candle(100.0, 10.0);
        assert!(validator(70.0, 30.0).validate(Some(&BULL), &c, &fx.view()).is_none());
        let confirmed = validator(101.0, 30.0).validate(Some(&BULL), &c, &fx.view()).unwrap();
        assert_eq!(confirmed.direction, Direction::Long);
        assert_eq!(confirmed.zone.kind, ZoneKind::Support);
        assert_eq!(confirmed.timestamp, 42);
    }

    #[test]
    fn bearish_veto_on_low_rsi() {
        let fx = Fixture::new().volumes(&[1.0, 1.0, 10.0]).closes(&[102.0, 101.0, 100.0]);
        let c = candle(100.0, 10.0);
        assert!(validator(70.0, 30.0).validate(Some(&BEAR), &c, &fx.view()).is_none());
        let confirmed = validator(70.0, -1.0).validate(Some(&BEAR), &c, &fx.view()).unwrap();
        assert_eq!(confirmed.direction, Direction::Short);
    }

    #[test]
    fn undefined_rsi_never_vetoes() {
        let fx = Fixture::new().volumes(&[1.0, 1.0, 10.0]);
        let out = validator(0.0, 100.0).validate(Some(&BULL), &candle(100.0, 10.0), &fx.view());
        assert_eq!(out.map(|c| c.direction), Some(Direction::Long));
    }

    #[test]
    fn support_bounce_accepts_oversold_instead_of_volume() {
        // Quiet volume, falling closes: RSI 0, oversold.
        let fx = Fixture::new().volumes(&[1.0, 1.0, 1.0]).closes(&[102.0, 101.0, 100.0]);
        let out = validator(70.0, 30.0).validate(Some(&BULL), &candle(100.0, 1.0), &fx.view());
        assert_eq!(out.map(|c| c.direction), Some(Direction::Long));
    }

    #[test]
    fn bearish_at_support_needs_volume() {
        let quiet = Fixture::new().volumes(&[1.0, 1.0, 1.0]);
        assert!(validator(70.0, 30.0)
            .validate(Some(&BEAR), &candle(100.0, 1.0), &quiet.view())
            .is_none());
        let loud = Fixture::new().volumes(&[1.0, 1.0, 10.0]);
        let out = validator(70.0, 30.0).validate(Some(&BEAR), &candle(100.0, 10.0), &loud.view());
        assert_eq!(out.map(|c| (c.direction, c.zone.kind)), Some((Direction::Short, ZoneKind::Support)));
    }

    #[test]
    fn away_from_every_zone_is_rejected() {
        let fx = Fixture::new().volumes(&[1.0, 1.0, 10.0]);
        assert!(validator(70.0, 30.0)
            .validate(Some(&BULL), &candle(120.0, 10.0), &fx.view())
            .is_none());
    }

    #[test]
    fn resistance_only_paths() {
        // Resistance at 110, support far below at 90.
        let mut zones = ZoneTracker::new(0.005);
        zones.update_zones(&Candle {
            timestamp: 0,
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 100.0,
            volume: 1.0,
            confirmed: true,
        });
        let mut volume = VolumeAnalyzer::new(3, 1.5, 0.5);
        [1.0, 1.0, 10.0].iter().for_each(|&v| volume.update(v));
        let mut rsi = RsiIndicator::new(2, 65.0, 35.0);
        [108.0, 109.0, 110.0].iter().for_each(|&c| rsi.update(c));
        let view = MarketView { zones: &zones, volume: &volume, rsi: &rsi };
        let c = candle(110.0, 10.0);

        // Breakout long with volume (RSI 100 would veto at the default ceiling).
        let long = validator(101.0, 30.0).validate(Some(&BULL), &c, &view).unwrap();
        assert_eq!((long.direction, long.zone.kind), (Direction::Long, ZoneKind::Resistance));
        // Overbought rejection from resistance.
        let short = validator(101.0, 30.0).validate(Some(&BEAR), &c, &view).unwrap();
        assert_eq!(short.direction, Direction::Short);
        assert_eq!(short.zone.level, 110.0);
    }
}
