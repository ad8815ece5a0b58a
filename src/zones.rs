use serde::Serialize;

use crate::types::Candle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ZoneKind {
    Support,
    Resistance,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Zone {
    pub level: f64,
    pub touches: u32,
    pub kind: ZoneKind,
    pub active: bool,
}

impl Zone {
    fn new(level: f64, kind: ZoneKind) -> Self {
        Zone { level, touches: 0, kind, active: true }
    }

    fn within(&self, price: f64, tolerance: f64) -> bool {
        (price - self.level).abs() / self.level <= tolerance
    }
}

/// Zone matched by [`ZoneTracker::is_near_zone`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ZoneHit {
    pub kind: ZoneKind,
    pub level: f64,
    pub touches: u32,
}

/// Dynamic support/resistance bands built from breakouts of the running extremes.
pub struct ZoneTracker {
    tolerance: f64,
    support: Vec<Zone>,
    resistance: Vec<Zone>,
}

impl ZoneTracker {
    pub fn new(tolerance: f64) -> Self {
        ZoneTracker { tolerance, support: Vec::new(), resistance: Vec::new() }
    }

    pub fn update_zones(&mut self, candle: &Candle) {
        let highest = self.resistance.iter().map(|z| z.level).fold(f64::NAN, f64::max);
        if highest.is_nan() || candle.high > highest * (1.0 + self.tolerance) {
            self.resistance.push(Zone::new(candle.high, ZoneKind::Resistance));
        }

        let lowest = self.support.iter().map(|z| z.level).fold(f64::NAN, f64::min);
        if lowest.is_nan() || candle.low < lowest * (1.0 - self.tolerance) {
            self.support.push(Zone::new(candle.low, ZoneKind::Support));
        }

        merge_close_levels(&mut self.resistance, self.tolerance);
        merge_close_levels(&mut self.support, self.tolerance);

        self.count_touches(candle.close);
    }

    fn count_touches(&mut self, close: f64) {
        let tol = self.tolerance;
        for z in self.support.iter_mut().chain(self.resistance.iter_mut()) {
            if z.within(close, tol) {
                z.touches += 1;
            }
        }
    }

    /// First qualifying zone within tolerance of `price`, lowest level first.
    /// Support is checked before resistance, so a price inside both bands
    /// reports support.
    pub fn is_near_zone(&self, price: f64, min_touches: u32) -> Option<ZoneHit> {
        self.support
            .iter()
            .chain(self.resistance.iter())
            .find(|z| z.active && z.touches >= min_touches && z.within(price, self.tolerance))
            .map(|z| ZoneHit { kind: z.kind, level: z.level, touches: z.touches })
    }

    pub fn support_zones(&self) -> &[Zone] {
        &self.support
    }

    pub fn resistance_zones(&self) -> &[Zone] {
        &self.resistance
    }
}

/// Collapse zones within `tolerance` of each other. Support keeps the lower
/// level, resistance the higher one; touches carry over to the survivor.
fn merge_close_levels(zones: &mut Vec<Zone>, tolerance: f64) {
    if zones.len() < 2 {
        return;
    }
    let keep_lower = zones[0].kind == ZoneKind::Support;
    let mut sorted = std::mem::take(zones);
    sorted.sort_by(|a, b| a.level.total_cmp(&b.level));
    if !keep_lower {
        sorted.reverse();
    }

    // Extremes come first, so the representative of each cluster is the first seen.
    let mut merged: Vec<Zone> = Vec::with_capacity(sorted.len());
    for zone in sorted {
        match merged.last_mut() {
            Some(rep) if rep.within(zone.level, tolerance) => {
                rep.touches = rep.touches.max(zone.touches);
            }
            _ => merged.push(zone),
        }
    }
    if !keep_lower {
        merged.reverse();
    }
    *zones = merged;
}
