//! Pivot extraction from a rolling high/low window
//!
//! A bar is a pivot high when its high strictly exceeds the highs of the
//! `lookback` bars on each side, and a pivot low when its low is strictly below
//! the lows on each side. Both tests run independently on the window center.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::{helpers::quantize, Pivot, PivotKind};
use crate::{Bar, Period};

/// High/low sample of one closed bar, tagged with its bar index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingSample {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
}

impl SwingSample {
    pub fn new(index: usize, timestamp: DateTime<Utc>, high: f64, low: f64) -> Self {
        Self {
            index,
            timestamp,
            high,
            low,
        }
    }

    pub fn from_bar<B: Bar + ?Sized>(index: usize, bar: &B) -> Self {
        Self::new(index, bar.timestamp(), bar.high(), bar.low())
    }
}

/// `2 * lookback + 1`, or `None` if it does not fit in `usize`
#[inline]
pub fn window_len(lookback: usize) -> Option<usize> {
    lookback.checked_mul(2)?.checked_add(1)
}

/// Confirms pivots over a rolling window of `2 * lookback + 1` samples
#[derive(Debug, Clone)]
pub struct PivotExtractor {
    lookback: Period,
    tick_size: Option<f64>,
    window: VecDeque<SwingSample>,
}

impl PivotExtractor {
    pub fn new(lookback: Period) -> Self {
        Self {
            lookback,
            tick_size: None,
            window: VecDeque::new(),
        }
    }

    /// Quantize emitted pivot prices to `tick_size`
    pub fn with_tick_size(mut self, tick_size: f64) -> Self {
        self.tick_size = (tick_size > 0.0 && tick_size.is_finite()).then_some(tick_size);
        self
    }

    #[inline]
    pub fn lookback(&self) -> usize {
        self.lookback.get()
    }

    /// Number of samples needed for one evaluation
    #[inline]
    pub fn window_len(&self) -> usize {
        window_len(self.lookback.get()).unwrap_or(usize::MAX)
    }

    #[inline]
    pub fn tick_size(&self) -> Option<f64> {
        self.tick_size
    }

    /// Append a newly closed bar and evaluate the window center.
    ///
    /// The caller must push each bar exactly once, in bar order.
    pub fn push<B: Bar + ?Sized>(&mut self, index: usize, bar: &B) -> Vec<Pivot> {
        self.push_sample(SwingSample::from_bar(index, bar))
    }

    pub fn push_sample(&mut self, sample: SwingSample) -> Vec<Pivot> {
        self.window.push_back(sample);
        while self.window.len() > self.window_len() {
            self.window.pop_front();
        }
        if self.window.len() < self.window_len() {
            return Vec::new();
        }
        self.window.make_contiguous();
        let (window, _) = self.window.as_slices();
        self.evaluate(window)
    }

    /// Test the center of `window`. Any length other than [`Self::window_len`] yields nothing.
    pub fn evaluate(&self, window: &[SwingSample]) -> Vec<Pivot> {
        let mut pivots = Vec::new();
        if window.len() != self.window_len() {
            return pivots;
        }

        let center_pos = self.lookback.get();
        let center = &window[center_pos];
        let neighbours = || {
            window
                .iter()
                .enumerate()
                .filter(move |(i, _)| *i != center_pos)
                .map(|(_, s)| s)
        };

        // NaN on either side fails the strict comparison, so malformed bars never confirm
        if neighbours().all(|s| s.high < center.high) {
            pivots.push(self.confirm(center, center.high, PivotKind::High));
        }
        if neighbours().all(|s| s.low > center.low) {
            pivots.push(self.confirm(center, center.low, PivotKind::Low));
        }
        pivots
    }

    /// Drop the rolling window
    pub fn reset(&mut self) {
        self.window.clear();
    }

    fn confirm(&self, center: &SwingSample, raw: f64, kind: PivotKind) -> Pivot {
        let price = match self.tick_size {
            Some(tick) => quantize(raw, tick),
            None => raw,
        };
        log::debug!(
            "pivot {:?} confirmed at bar {} ({}) price {:.5}",
            kind,
            center.index,
            center.timestamp.format("%m/%d %H:%M"),
            price
        );
        Pivot::new(center.index, price, kind, center.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn samples(highs_lows: &[(f64, f64)]) -> Vec<SwingSample> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        highs_lows
            .iter()
            .enumerate()
            .map(|(i, &(h, l))| SwingSample::new(i, t0 + TimeDelta::hours(4 * i as i64), h, l))
            .collect()
    }

    #[test]
    fn test_pivot_high_at_center() {
        let extractor = PivotExtractor::new(Period::new_const(2));
        let window = samples(&[(10.0, 9.0), (11.0, 9.5), (13.0, 10.0), (12.0, 9.8), (11.5, 9.6)]);

        let pivots = extractor.evaluate(&window);
        assert_eq!(pivots.len(), 1);
        assert_eq!(pivots[0].kind, PivotKind::High);
        assert_eq!(pivots[0].bar_index, 2);
        assert_eq!(pivots[0].price, 13.0);
        assert_eq!(pivots[0].timestamp, window[2].timestamp);
    }

    #[test]
    fn test_pivot_low_at_center() {
        let extractor = PivotExtractor::new(Period::new_const(1));
        let window = samples(&[(10.0, 9.0), (9.5, 8.0), (10.5, 9.2)]);

        let pivots = extractor.evaluate(&window);
        assert_eq!(pivots.len(), 1);
        assert_eq!(pivots[0].kind, PivotKind::Low);
        assert_eq!(pivots[0].price, 8.0);
    }

    #[test]
    fn test_high_and_low_on_same_bar() {
        // Outside bar: highest high and lowest low
        let extractor = PivotExtractor::new(Period::new_const(1));
        let window = samples(&[(10.0, 9.0), (12.0, 7.0), (11.0, 8.0)]);

        let pivots = extractor.evaluate(&window);
        assert_eq!(pivots.len(), 2);
        assert_eq!(pivots[0].kind, PivotKind::High);
        assert_eq!(pivots[1].kind, PivotKind::Low);
    }

    #[test]
    fn test_equal_neighbour_does_not_confirm() {
        let extractor = PivotExtractor::new(Period::new_const(1));
        let window = samples(&[(12.0, 9.0), (12.0, 9.5), (11.0, 9.8)]);
        assert!(extractor.evaluate(&window).is_empty());
    }

    #[test]
    fn test_short_window_yields_nothing() {
        let extractor = PivotExtractor::new(Period::new_const(2));
        let window = samples(&[(10.0, 9.0), (13.0, 10.0), (11.0, 9.5)]);
        assert!(extractor.evaluate(&window).is_empty());
    }

    #[test]
    fn test_push_rolls_window() {
        let mut extractor = PivotExtractor::new(Period::new_const(1));
        let bars = samples(&[(10.0, 9.0), (12.0, 10.0), (11.0, 9.5), (11.5, 9.0), (13.0, 10.5)]);

        let emitted: Vec<Vec<Pivot>> = bars.iter().map(|s| extractor.push_sample(*s)).collect();
        assert!(emitted[0].is_empty());
        assert!(emitted[1].is_empty());
        // Window [0,1,2] confirms bar 1 as a high
        assert_eq!(emitted[2].len(), 1);
        assert_eq!(emitted[2][0].bar_index, 1);
        // Window [1,2,3]: bar 2 is neither
        assert!(emitted[3].is_empty());
        // Window [2,3,4]: bar 3 low 9.0 is below 9.5 and 10.5
        assert_eq!(emitted[4].len(), 1);
        assert_eq!(emitted[4][0].kind, PivotKind::Low);
        assert_eq!(emitted[4][0].bar_index, 3);
    }

    #[test]
    fn test_quantized_price() {
        let extractor = PivotExtractor::new(Period::new_const(1)).with_tick_size(0.25);
        let window = samples(&[(4500.0, 4490.0), (4512.37, 4495.0), (4505.0, 4491.0)]);

        let pivots = extractor.evaluate(&window);
        assert_eq!(pivots.len(), 1);
        assert!((pivots[0].price - 4512.25).abs() < 1e-9);
    }

    #[test]
    fn test_window_len_overflow() {
        assert_eq!(window_len(3), Some(7));
        assert_eq!(window_len(usize::MAX / 2), Some(usize::MAX));
        assert_eq!(window_len(usize::MAX / 2 + 1), None);

        // An unrepresentable window simply never fills
        let mut extractor = PivotExtractor::new(Period::new_const(usize::MAX));
        assert_eq!(extractor.window_len(), usize::MAX);
        for sample in samples(&[(10.0, 9.0), (12.0, 11.0), (11.0, 10.0)]) {
            assert!(extractor.push_sample(sample).is_empty());
        }
    }

    #[test]
    fn test_nan_never_confirms() {
        let extractor = PivotExtractor::new(Period::new_const(1));
        let window = samples(&[(10.0, 9.0), (f64::NAN, f64::NAN), (11.0, 9.5)]);
        assert!(extractor.evaluate(&window).is_empty());
    }
}
