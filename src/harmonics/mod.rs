//! Harmonic XABCD pattern detection
//!
//! This module contains the pivot pipeline and the ratio-template search that
//! together detect Gartley, Bat, Butterfly and Crab formations.
//!
//! # Components
//!
//! - **Pivots**: [`PivotExtractor`] confirms local highs/lows over a rolling window
//! - **Store**: [`PivotStore`] keeps a bounded, deduplicated, ordered pivot history
//! - **Catalog**: [`PatternCatalog`] holds the Fibonacci ratio templates
//! - **Search**: [`PatternSearch`] scans the store for XABCD quintuples
//! - **Lifecycle**: [`PatternLifecycle`] owns the single current pattern

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{instrument::InstrumentSpec, Direction};

pub mod helpers;

pub mod catalog;
pub mod lifecycle;
pub mod pivots;
pub mod search;
pub mod store;

pub use catalog::*;
pub use helpers::*;
pub use lifecycle::*;
pub use pivots::*;
pub use search::*;
pub use store::*;

// ============================================================
// PIVOTS
// ============================================================

/// Kind of a confirmed price extremum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PivotKind {
    High,
    Low,
}

impl PivotKind {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            PivotKind::High => PivotKind::Low,
            PivotKind::Low => PivotKind::High,
        }
    }
}

/// A confirmed local extremum at a specific bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    pub bar_index: usize,
    pub price: f64,
    pub kind: PivotKind,
    pub timestamp: DateTime<Utc>,
}

impl Pivot {
    pub fn new(bar_index: usize, price: f64, kind: PivotKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            bar_index,
            price,
            kind,
            timestamp,
        }
    }

    pub fn high(bar_index: usize, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(bar_index, price, PivotKind::High, timestamp)
    }

    pub fn low(bar_index: usize, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(bar_index, price, PivotKind::Low, timestamp)
    }

    #[inline]
    pub fn is_high(&self) -> bool {
        self.kind == PivotKind::High
    }

    #[inline]
    pub fn is_low(&self) -> bool {
        self.kind == PivotKind::Low
    }
}

// ============================================================
// HARMONIC PATTERN - result of a search pass
// ============================================================

/// Absolute price length of each pattern leg
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Legs {
    pub xa: f64,
    pub ab: f64,
    pub bc: f64,
    pub cd: f64,
}

/// Realized leg ratios of a pattern
///
/// `xd_xa` measures the closing point against X, `ad_xa` measures it as a
/// retracement of XA from A. A template checks exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegRatios {
    pub ab_xa: f64,
    pub bc_ab: f64,
    pub cd_bc: f64,
    pub xd_xa: f64,
    pub ad_xa: f64,
}

/// A completed XABCD formation matching one catalog template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonicPattern {
    /// Name of the matched template (e.g. "Gartley")
    pub template: String,
    pub x: Pivot,
    pub a: Pivot,
    pub b: Pivot,
    pub c: Pivot,
    pub d: Pivot,
    pub direction: Direction,
    pub detected_at: DateTime<Utc>,
}

impl HarmonicPattern {
    /// Bullish iff X is a low and A is a high
    #[inline]
    pub fn is_bullish(&self) -> bool {
        self.direction.is_bullish()
    }

    /// Bar index of D, the completion point used for recency decisions
    #[inline]
    pub fn completion_index(&self) -> usize {
        self.d.bar_index
    }

    pub fn points(&self) -> [Pivot; 5] {
        [self.x, self.a, self.b, self.c, self.d]
    }

    /// Bars between X and D
    pub fn span_bars(&self) -> usize {
        self.d.bar_index.saturating_sub(self.x.bar_index)
    }

    pub fn legs(&self) -> Legs {
        Legs {
            xa: leg(self.x.price, self.a.price),
            ab: leg(self.a.price, self.b.price),
            bc: leg(self.b.price, self.c.price),
            cd: leg(self.c.price, self.d.price),
        }
    }

    pub fn ratios(&self) -> LegRatios {
        let legs = self.legs();
        LegRatios {
            ab_xa: leg_ratio(legs.ab, legs.xa).unwrap_or(f64::NAN),
            bc_ab: leg_ratio(legs.bc, legs.ab).unwrap_or(f64::NAN),
            cd_bc: leg_ratio(legs.cd, legs.bc).unwrap_or(f64::NAN),
            xd_xa: leg_ratio(leg(self.x.price, self.d.price), legs.xa).unwrap_or(f64::NAN),
            ad_xa: leg_ratio(leg(self.a.price, self.d.price), legs.xa).unwrap_or(f64::NAN),
        }
    }

    /// Price distance of the final C->D move
    #[inline]
    pub fn cd_move(&self) -> f64 {
        leg(self.c.price, self.d.price)
    }

    /// Currency value of the C->D move for the given instrument
    pub fn cd_move_value(&self, instrument: &InstrumentSpec) -> f64 {
        instrument.price_to_currency(self.cd_move())
    }
}
