//! Common leg and ratio arithmetic for harmonic pattern detection
//!
//! Defaults and comparison functions shared across the pivot, store and search modules.

use super::{Pivot, PivotKind};
use crate::Direction;

// ============================================================
// DEFAULTS
// ============================================================

/// Bars on each side of a center bar needed to confirm a pivot
pub const DEFAULT_PIVOT_LOOKBACK: usize = 3;
/// Maximum bar span between X and A
pub const DEFAULT_MAX_PATTERN_BARS: usize = 50;
/// Relative distance allowed between a projected and an actual pivot price
pub const DEFAULT_PRICE_TOLERANCE: f64 = 0.015;
/// Relative tolerance for exact ratio targets
pub const DEFAULT_CLOSING_LEG_TOLERANCE: f64 = 0.05;
/// Days a detected pattern stays current
pub const DEFAULT_VISIBILITY_DAYS: i64 = 5;
/// Maximum number of pivots kept in the store
pub const DEFAULT_STORE_CAPACITY: usize = 100;
/// Price-equality threshold in ticks when the tick size is known
pub const DEFAULT_DEDUP_TICKS: f64 = 2.0;
/// Price-equality threshold as a fraction of price when no tick size is known
pub const DEFAULT_RELATIVE_DEDUP: f64 = 0.001;
/// X, A, B, C and D
pub const PATTERN_POINTS: usize = 5;

// ============================================================
// HELPER FUNCTIONS
// ============================================================

/// Absolute price length of the leg between two points
#[inline]
pub fn leg(from: f64, to: f64) -> f64 {
    (to - from).abs()
}

/// `numerator / denominator`, or `None` when the denominator leg is degenerate
#[inline]
pub fn leg_ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator > f64::EPSILON).then(|| numerator / denominator)
}

/// Project a leg of `base_leg * ratio` from `from`, upward or downward
#[inline]
pub fn project(from: f64, base_leg: f64, ratio: f64, upward: bool) -> f64 {
    let length = base_leg * ratio;
    if upward {
        from + length
    } else {
        from - length
    }
}

/// Check `|price - expected| / expected <= tolerance`.
/// A non-positive expected price never matches.
#[inline]
pub fn within_relative(price: f64, expected: f64, tolerance: f64) -> bool {
    expected > 0.0 && (price - expected).abs() / expected <= tolerance
}

/// `value` lies strictly inside the open interval spanned by `p` and `q`
#[inline]
pub fn strictly_between(value: f64, p: f64, q: f64) -> bool {
    value > p.min(q) && value < p.max(q)
}

/// D extends past both B and C in the direction of the pattern's final leg
#[inline]
pub fn beyond_bc(d: f64, b: f64, c: f64, direction: Direction) -> bool {
    match direction {
        Direction::Bullish => d < b && d < c,
        Direction::Bearish => d > b && d > c,
    }
}

/// Round to the nearest multiple of `tick_size`. Non-positive ticks leave the price unchanged.
#[inline]
pub fn quantize(price: f64, tick_size: f64) -> f64 {
    if tick_size > 0.0 && tick_size.is_finite() {
        (price / tick_size).round() * tick_size
    } else {
        price
    }
}

/// Direction of an X->A pair, or `None` if it cannot start a pattern.
///
/// Bullish needs X low / A high with A above X; bearish the mirror.
#[inline]
pub fn xa_direction(x: &Pivot, a: &Pivot) -> Option<Direction> {
    if a.bar_index <= x.bar_index {
        return None;
    }
    match (x.kind, a.kind) {
        (PivotKind::Low, PivotKind::High) if a.price > x.price => Some(Direction::Bullish),
        (PivotKind::High, PivotKind::Low) if a.price < x.price => Some(Direction::Bearish),
        _ => None,
    }
}
