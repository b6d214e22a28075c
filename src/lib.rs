//! # YAHPD - Yet Another Harmonic Pattern Detector
//!
//! Streaming detection of harmonic XABCD patterns (Gartley, Bat, Butterfly, Crab)
//! from higher-timeframe bars.
//!
//! Each closed bar goes through the same pipeline: pivot extraction, pivot
//! store, ratio-template search, then the current-pattern lifecycle.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeDelta, TimeZone, Utc};
//! use yahpd::prelude::*;
//!
//! let mut engine = EngineBuilder::new()
//!     .pivot_lookback(1)
//!     .instrument(InstrumentSpec::new(0.25, 12.5)?)
//!     .build()?;
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
//! let prices = [4510.0, 4502.0, 4495.0, 4507.0, 4521.0, 4512.0, 4504.0];
//!
//! for (i, price) in prices.iter().enumerate() {
//!     let bar = PriceBar::new(t0 + TimeDelta::hours(4 * i as i64), price + 1.0, price - 1.0);
//!     for event in engine.on_bar_at(i, &bar, bar.timestamp)? {
//!         match event {
//!             EngineEvent::PivotConfirmed(p) => {
//!                 println!("{:?} pivot at bar {}", p.kind, p.bar_index)
//!             }
//!             EngineEvent::PatternDetected(p) => println!("{} {}", p.direction, p.template),
//!             EngineEvent::PatternExpired(p) => println!("{} expired", p.template),
//!         }
//!     }
//! }
//! assert_eq!(engine.pivots().len(), 2);
//! # Ok::<(), yahpd::HarmonicError>(())
//! ```

use std::{cell::Cell, fmt, rc::Rc};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use harmonics::{
    HarmonicPattern, LifecycleEvent, LifecycleState, MatchingStrategy, PatternCatalog,
    PatternLifecycle, PatternSearch, Pivot, PivotExtractor, PivotStore, PriceEquality,
    SearchParams,
};
use instrument::{InstrumentLookup, InstrumentSpec};
use params::{get_days, get_period, get_ratio, ParamMeta, Parameterized};

pub mod harmonics;
pub mod instrument;
pub mod params;

pub mod prelude {
    pub use crate::{
        // Harmonics
        harmonics::*,
        // Instruments
        instrument::{InstrumentLookup, InstrumentSpec, InstrumentTable},
        // Parameters
        params::{get_days, get_period, get_ratio, ParamMeta, ParamType, Parameterized},
        // Parallel
        replay_parallel,
        // Core traits
        Bar,
        BarExt,
        Clock,
        DefaultEngine,
        // Types
        Direction,
        // Engine
        EngineBuilder,
        EngineConfig,
        EngineEvent,
        // Errors
        HarmonicEngine,
        HarmonicError,
        ManualClock,
        Period,
        PriceBar,
        Ratio,
        ReplayError,
        ReplayResult,
        Result,
        SystemClock,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, HarmonicError>;

/// Errors raised while building an engine or ingesting bars
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarmonicError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid template {name}: {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("Bar {got} delivered after bar {last}")]
    OutOfOrderBar { last: usize, got: usize },

    #[error("Invalid bar at index {index}: {reason}")]
    InvalidBar { index: usize, reason: &'static str },
}

// ============================================================
// VALIDATED TYPES
// ============================================================

/// Normalized value in range 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Ratio(f64);

impl Ratio {
    /// Create a new Ratio, validating the value is in [0.0, 1.0]
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || value.is_infinite() {
            return Err(HarmonicError::InvalidValue("Ratio cannot be NaN or infinite"));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(HarmonicError::OutOfRange {
                field: "Ratio",
                value,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self(value))
    }

    /// Create a Ratio from a compile-time constant (library internal use)
    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl serde::Serialize for Ratio {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for Ratio {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(d)?;
        Ratio::new(value).map_err(serde::de::Error::custom)
    }
}

/// Period (must be > 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(usize);

impl Period {
    /// Create a new Period, validating value is > 0
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(HarmonicError::InvalidValue("Period must be > 0"));
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl serde::Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = usize::deserialize(d)?;
        Period::new(value).map_err(serde::de::Error::custom)
    }
}

/// Durations as whole seconds
mod duration_secs {
    use chrono::TimeDelta;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delta: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(delta.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TimeDelta, D::Error> {
        let secs = i64::deserialize(d)?;
        TimeDelta::try_seconds(secs).ok_or_else(|| de::Error::custom("duration out of range"))
    }
}

// ============================================================
// DIRECTION
// ============================================================

/// Side of a harmonic pattern: bullish patterns complete at a low D
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    #[inline]
    pub fn is_bullish(self) -> bool {
        matches!(self, Direction::Bullish)
    }

    #[inline]
    pub fn is_bearish(self) -> bool {
        matches!(self, Direction::Bearish)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Bullish => "Bullish",
            Direction::Bearish => "Bearish",
        })
    }
}

// ============================================================
// BAR TRAITS
// ============================================================

/// One closed higher-timeframe bar
pub trait Bar {
    fn timestamp(&self) -> DateTime<Utc>;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
}

impl<B: Bar + ?Sized> Bar for &B {
    fn timestamp(&self) -> DateTime<Utc> {
        (**self).timestamp()
    }

    fn high(&self) -> f64 {
        (**self).high()
    }

    fn low(&self) -> f64 {
        (**self).low()
    }
}

/// Extension trait with computed properties for bar data
pub trait BarExt: Bar {
    #[inline]
    fn range(&self) -> f64 {
        self.high() - self.low()
    }

    #[inline]
    fn midpoint(&self) -> f64 {
        (self.high() + self.low()) / 2.0
    }

    /// Validate bar consistency
    fn validate(&self) -> Result<()> {
        if self.high().is_nan() || self.low().is_nan() {
            return Err(HarmonicError::InvalidBar {
                index: 0,
                reason: "NaN in high/low",
            });
        }
        if self.high().is_infinite() || self.low().is_infinite() {
            return Err(HarmonicError::InvalidBar {
                index: 0,
                reason: "Infinite value in high/low",
            });
        }
        if self.high() < self.low() {
            return Err(HarmonicError::InvalidBar {
                index: 0,
                reason: "high < low",
            });
        }
        Ok(())
    }
}

impl<T: Bar + ?Sized> BarExt for T {}

/// Plain bar value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
}

impl PriceBar {
    pub fn new(timestamp: DateTime<Utc>, high: f64, low: f64) -> Self {
        Self {
            timestamp,
            high,
            low,
        }
    }
}

impl Bar for PriceBar {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }
}

// ============================================================
// CLOCK
// ============================================================

/// Time source for detection stamps and expiry
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock shared between clones. Single-threaded.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn advance(&self, delta: TimeDelta) {
        self.now.set(self.now.get() + delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

// ============================================================
// ENGINE CONFIG
// ============================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bars on each side of a pivot
    pub pivot_lookback: Period,
    /// Maximum bars between X and A
    pub max_pattern_bars: Period,
    /// Relative distance from a projected price (projected strategy)
    pub price_tolerance: Ratio,
    /// Tolerance of the built-in exact templates
    pub closing_leg_tolerance: Ratio,
    /// How long a detected pattern stays current. Zero or less never expires.
    #[serde(with = "duration_secs")]
    pub visibility_horizon: TimeDelta,
    pub pivot_store_capacity: Period,
    pub strategy: MatchingStrategy,
    /// Round pivot prices to the instrument tick
    pub quantize_prices: bool,
    /// Pivot equality threshold in ticks, when the instrument is known
    pub dedup_ticks: f64,
    /// Pivot equality threshold as a fraction of price otherwise
    pub relative_dedup: Ratio,
    pub validate_data: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pivot_lookback: Period::new_const(harmonics::DEFAULT_PIVOT_LOOKBACK),
            max_pattern_bars: Period::new_const(harmonics::DEFAULT_MAX_PATTERN_BARS),
            price_tolerance: Ratio::new_const(harmonics::DEFAULT_PRICE_TOLERANCE),
            closing_leg_tolerance: Ratio::new_const(harmonics::DEFAULT_CLOSING_LEG_TOLERANCE),
            visibility_horizon: TimeDelta::days(harmonics::DEFAULT_VISIBILITY_DAYS),
            pivot_store_capacity: Period::new_const(harmonics::DEFAULT_STORE_CAPACITY),
            strategy: MatchingStrategy::default(),
            quantize_prices: true,
            dedup_ticks: harmonics::DEFAULT_DEDUP_TICKS,
            relative_dedup: Ratio::new_const(harmonics::DEFAULT_RELATIVE_DEDUP),
            validate_data: false,
        }
    }
}

impl EngineConfig {
    /// Cross-field checks not covered by the validated field types
    pub fn validate(&self) -> Result<()> {
        if self.closing_leg_tolerance.get() <= 0.0 {
            return Err(HarmonicError::InvalidConfig(
                "closing_leg_tolerance must be > 0".to_string(),
            ));
        }
        if harmonics::window_len(self.pivot_lookback.get()).is_none() {
            return Err(HarmonicError::InvalidConfig(format!(
                "pivot_lookback {} is too large for a 2 * lookback + 1 window",
                self.pivot_lookback.get()
            )));
        }
        if !self.dedup_ticks.is_finite() || self.dedup_ticks < 0.0 {
            return Err(HarmonicError::InvalidConfig(format!(
                "dedup_ticks must be finite and >= 0, got {}",
                self.dedup_ticks
            )));
        }
        Ok(())
    }

    /// Catalog used when none is given: exact targets for the projected
    /// strategy, ranges for direct matching
    pub fn default_catalog(&self) -> Result<PatternCatalog> {
        match self.strategy {
            MatchingStrategy::Projected { .. } => {
                PatternCatalog::exact(self.closing_leg_tolerance.get())
            }
            MatchingStrategy::Direct => Ok(PatternCatalog::ranged()),
        }
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            max_pattern_bars: self.max_pattern_bars.get(),
            price_tolerance: self.price_tolerance.get(),
        }
    }
}

static ENGINE_PARAMS: &[ParamMeta] = &[
    ParamMeta::period("pivot_lookback", 3.0, (1.0, 5.0, 1.0), "Bars on each side of a pivot"),
    ParamMeta::period(
        "max_pattern_bars",
        50.0,
        (20.0, 100.0, 10.0),
        "Maximum bars between X and A",
    ),
    ParamMeta::ratio(
        "price_tolerance",
        0.015,
        (0.005, 0.03, 0.005),
        "Relative distance allowed from a projected price",
    ),
    ParamMeta::ratio(
        "closing_leg_tolerance",
        0.05,
        (0.01, 0.1, 0.01),
        "Tolerance of exact ratio targets",
    ),
    ParamMeta::days("visibility_days", 5.0, (0.0, 10.0, 1.0), "Days a pattern stays current"),
    ParamMeta::period(
        "pivot_store_capacity",
        100.0,
        (50.0, 200.0, 50.0),
        "Pivots kept in the store",
    ),
];

impl Parameterized for EngineConfig {
    fn param_meta() -> &'static [ParamMeta] {
        ENGINE_PARAMS
    }

    fn with_params(params: &std::collections::HashMap<&str, f64>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            pivot_lookback: get_period(params, "pivot_lookback", defaults.pivot_lookback.get())?,
            max_pattern_bars: get_period(
                params,
                "max_pattern_bars",
                defaults.max_pattern_bars.get(),
            )?,
            price_tolerance: get_ratio(params, "price_tolerance", defaults.price_tolerance.get())?,
            closing_leg_tolerance: get_ratio(
                params,
                "closing_leg_tolerance",
                defaults.closing_leg_tolerance.get(),
            )?,
            visibility_horizon: get_days(
                params,
                "visibility_days",
                harmonics::DEFAULT_VISIBILITY_DAYS,
            )?,
            pivot_store_capacity: get_period(
                params,
                "pivot_store_capacity",
                defaults.pivot_store_capacity.get(),
            )?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    fn name() -> &'static str {
        "harmonic_engine"
    }
}

// ============================================================
// ENGINE EVENTS
// ============================================================

/// Observable outcome of feeding the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    PivotConfirmed(Pivot),
    PatternDetected(HarmonicPattern),
    PatternExpired(HarmonicPattern),
}

impl From<LifecycleEvent> for EngineEvent {
    fn from(event: LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Detected(p) => EngineEvent::PatternDetected(p),
            LifecycleEvent::Expired(p) => EngineEvent::PatternExpired(p),
        }
    }
}

// ============================================================
// HARMONIC ENGINE
// ============================================================

/// Per-instrument detection state: rolling window, pivot store and current pattern
pub struct HarmonicEngine<K: Clock = SystemClock> {
    config: EngineConfig,
    catalog: PatternCatalog,
    instrument: Option<InstrumentSpec>,
    extractor: PivotExtractor,
    store: PivotStore,
    lifecycle: PatternLifecycle,
    clock: K,
    last_bar: Option<usize>,
}

impl<K: Clock> HarmonicEngine<K> {
    fn assemble(
        config: EngineConfig,
        catalog: PatternCatalog,
        instrument: Option<InstrumentSpec>,
        clock: K,
    ) -> Self {
        let mut extractor = PivotExtractor::new(config.pivot_lookback);
        if let Some(spec) = instrument.filter(|_| config.quantize_prices) {
            extractor = extractor.with_tick_size(spec.tick_size);
        }
        let equality = PriceEquality::for_instrument(
            instrument.as_ref(),
            config.dedup_ticks,
            config.relative_dedup.get(),
        );
        Self {
            store: PivotStore::new(config.pivot_store_capacity, equality),
            lifecycle: PatternLifecycle::new(config.visibility_horizon),
            extractor,
            config,
            catalog,
            instrument,
            clock,
            last_bar: None,
        }
    }

    // ===========================================
    // Ingestion
    // ===========================================

    /// Feed the newly closed bar `index`, stamped with the engine clock
    pub fn on_bar<B: Bar + ?Sized>(&mut self, index: usize, bar: &B) -> Result<Vec<EngineEvent>> {
        let now = self.clock.now();
        self.on_bar_at(index, bar, now)
    }

    /// Feed the newly closed bar `index` with an explicit current time.
    ///
    /// Re-delivering the last processed index is a no-op. A lower index is an
    /// error and leaves the engine untouched.
    pub fn on_bar_at<B: Bar + ?Sized>(
        &mut self,
        index: usize,
        bar: &B,
        now: DateTime<Utc>,
    ) -> Result<Vec<EngineEvent>> {
        match self.last_bar {
            Some(last) if index == last => {
                log::trace!("bar {index} already processed");
                return Ok(Vec::new());
            }
            Some(last) if index < last => {
                return Err(HarmonicError::OutOfOrderBar { last, got: index });
            }
            _ => {}
        }
        if self.config.validate_data {
            bar.validate().map_err(|e| match e {
                HarmonicError::InvalidBar { reason, .. } => {
                    HarmonicError::InvalidBar { index, reason }
                }
                other => other,
            })?;
        }
        self.last_bar = Some(index);

        let accepted = self.store.insert_batch(self.extractor.push(index, bar));
        let mut events: Vec<EngineEvent> =
            accepted.into_iter().map(EngineEvent::PivotConfirmed).collect();
        if let Some(pattern) = self.search_at(now) {
            events.extend(self.lifecycle.offer(pattern).map(EngineEvent::from));
        }
        events.extend(self.lifecycle.expire(now).map(EngineEvent::from));
        Ok(events)
    }

    /// Expiry check without a new bar
    pub fn tick(&mut self) -> Vec<EngineEvent> {
        let now = self.clock.now();
        self.tick_at(now)
    }

    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Vec<EngineEvent> {
        self.lifecycle.expire(now).map(EngineEvent::from).into_iter().collect()
    }

    // ===========================================
    // Search without lifecycle
    // ===========================================

    /// Search pass over the current store
    pub fn pattern_search(&self) -> PatternSearch<'_> {
        PatternSearch::new(&self.catalog, self.config.strategy, self.config.search_params())
    }

    /// Best match in the current store, stamped with the engine clock. Does not
    /// touch the current pattern.
    pub fn search(&self) -> Option<HarmonicPattern> {
        self.search_at(self.clock.now())
    }

    pub fn search_at(&self, now: DateTime<Utc>) -> Option<HarmonicPattern> {
        self.pattern_search().run(self.store.snapshot(), now)
    }

    // ===========================================
    // Introspection
    // ===========================================

    pub fn current(&self) -> Option<&HarmonicPattern> {
        self.lifecycle.current()
    }

    pub fn lifecycle_state(&self) -> &LifecycleState {
        self.lifecycle.state()
    }

    /// Stored pivots ordered by bar index
    pub fn pivots(&self) -> &[Pivot] {
        self.store.snapshot()
    }

    pub fn last_bar_index(&self) -> Option<usize> {
        self.last_bar
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    pub fn instrument(&self) -> Option<&InstrumentSpec> {
        self.instrument.as_ref()
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    /// Drop all bar, pivot and pattern state. Configuration is kept.
    pub fn reset(&mut self) {
        self.extractor.reset();
        self.store.clear();
        self.lifecycle.clear();
        self.last_bar = None;
    }
}

// ============================================================
// BUILDER
// ============================================================

/// Builder for creating HarmonicEngine instances.
///
/// Setters take raw values; the first invalid one is reported by [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct EngineBuilder<K: Clock = SystemClock> {
    config: EngineConfig,
    catalog: Option<PatternCatalog>,
    instrument: Option<InstrumentSpec>,
    clock: K,
    error: Option<HarmonicError>,
}

impl Default for EngineBuilder<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder<SystemClock> {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            catalog: None,
            instrument: None,
            clock: SystemClock,
            error: None,
        }
    }
}

impl<K: Clock> EngineBuilder<K> {
    /// Change clock
    pub fn clock<K2: Clock>(self, clock: K2) -> EngineBuilder<K2> {
        EngineBuilder {
            config: self.config,
            catalog: self.catalog,
            instrument: self.instrument,
            clock,
            error: self.error,
        }
    }

    fn record(&mut self, error: HarmonicError) {
        self.error.get_or_insert(error);
    }

    fn period(&mut self, value: usize) -> Option<Period> {
        Period::new(value).map_err(|e| self.record(e)).ok()
    }

    fn ratio(&mut self, value: f64) -> Option<Ratio> {
        Ratio::new(value).map_err(|e| self.record(e)).ok()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pivot_lookback(mut self, bars: usize) -> Self {
        if let Some(p) = self.period(bars) {
            self.config.pivot_lookback = p;
        }
        self
    }

    pub fn max_pattern_bars(mut self, bars: usize) -> Self {
        if let Some(p) = self.period(bars) {
            self.config.max_pattern_bars = p;
        }
        self
    }

    pub fn price_tolerance(mut self, tolerance: f64) -> Self {
        if let Some(r) = self.ratio(tolerance) {
            self.config.price_tolerance = r;
        }
        self
    }

    pub fn closing_leg_tolerance(mut self, tolerance: f64) -> Self {
        if let Some(r) = self.ratio(tolerance) {
            self.config.closing_leg_tolerance = r;
        }
        self
    }

    pub fn visibility_horizon(mut self, horizon: TimeDelta) -> Self {
        self.config.visibility_horizon = horizon;
        self
    }

    pub fn pivot_store_capacity(mut self, capacity: usize) -> Self {
        if let Some(p) = self.period(capacity) {
            self.config.pivot_store_capacity = p;
        }
        self
    }

    pub fn strategy(mut self, strategy: MatchingStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn quantize_prices(mut self, enable: bool) -> Self {
        self.config.quantize_prices = enable;
        self
    }

    pub fn dedup_ticks(mut self, ticks: f64) -> Self {
        self.config.dedup_ticks = ticks;
        self
    }

    pub fn relative_dedup(mut self, fraction: f64) -> Self {
        if let Some(r) = self.ratio(fraction) {
            self.config.relative_dedup = r;
        }
        self
    }

    /// Enable/disable bar validation
    pub fn validate_data(mut self, enable: bool) -> Self {
        self.config.validate_data = enable;
        self
    }

    /// Use a custom template catalog instead of the strategy default
    pub fn catalog(mut self, catalog: PatternCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn instrument(mut self, spec: InstrumentSpec) -> Self {
        self.instrument = Some(spec);
        self
    }

    /// Resolve the instrument through a lookup, falling back to the default spec
    pub fn instrument_from<L: InstrumentLookup + ?Sized>(self, lookup: &L, symbol: &str) -> Self {
        self.instrument(lookup.resolve(symbol))
    }

    /// Build the engine
    pub fn build(self) -> Result<HarmonicEngine<K>> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.config.validate()?;
        let catalog = match self.catalog {
            Some(catalog) => {
                catalog.validate()?;
                catalog
            }
            None => self.config.default_catalog()?,
        };
        log::debug!(
            "engine built: {:?} strategy, {} templates, lookback {}",
            self.config.strategy,
            catalog.len(),
            self.config.pivot_lookback.get()
        );
        Ok(HarmonicEngine::assemble(self.config, catalog, self.instrument, self.clock))
    }
}

// ============================================================
// PARALLEL REPLAY
// ============================================================

use rayon::prelude::*;

/// Result of replaying a single instrument
#[derive(Debug)]
pub struct ReplayResult {
    pub symbol: String,
    pub events: Vec<EngineEvent>,
    pub current: Option<HarmonicPattern>,
}

/// Error from replaying a single instrument
#[derive(Debug)]
pub struct ReplayError {
    pub symbol: String,
    pub error: HarmonicError,
}

/// Replay independent bar histories in parallel, one engine per symbol.
///
/// Bars are fed with their slice position as index and their own timestamp as
/// the current time. Symbols known to `lookup` get their instrument spec.
pub fn replay_parallel<'a, B, I, L, K>(
    builder: &EngineBuilder<K>,
    lookup: &L,
    instruments: I,
) -> (Vec<ReplayResult>, Vec<ReplayError>)
where
    B: Bar + Sync + 'a,
    I: IntoParallelIterator<Item = (&'a str, &'a [B])>,
    L: InstrumentLookup + Sync + ?Sized,
    K: Clock + Clone + Sync,
{
    let results: Vec<_> = instruments
        .into_par_iter()
        .map(|(symbol, bars)| {
            replay_one(builder, lookup, symbol, bars)
                .map(|(events, current)| ReplayResult {
                    symbol: symbol.to_string(),
                    events,
                    current,
                })
                .map_err(|error| ReplayError {
                    symbol: symbol.to_string(),
                    error,
                })
        })
        .collect();

    let mut successes = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(r) => successes.push(r),
            Err(e) => errors.push(e),
        }
    }

    (successes, errors)
}

fn replay_one<B, L, K>(
    builder: &EngineBuilder<K>,
    lookup: &L,
    symbol: &str,
    bars: &[B],
) -> Result<(Vec<EngineEvent>, Option<HarmonicPattern>)>
where
    B: Bar,
    L: InstrumentLookup + ?Sized,
    K: Clock + Clone,
{
    let mut builder = builder.clone();
    if let Some(spec) = lookup.lookup(symbol) {
        builder = builder.instrument(spec);
    }
    let mut engine = builder.build()?;
    let mut events = Vec::new();
    for (index, bar) in bars.iter().enumerate() {
        events.extend(engine.on_bar_at(index, bar, bar.timestamp())?);
    }
    log::info!(
        "{symbol}: replayed {} bars, {} pivots, {} events",
        bars.len(),
        engine.pivots().len(),
        events.len()
    );
    Ok((events, engine.current().cloned()))
}

// ============================================================
// TYPE ALIASES
// ============================================================

/// Engine driven by the wall clock
pub type DefaultEngine = HarmonicEngine<SystemClock>;

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    fn bar(i: usize, high: f64, low: f64) -> PriceBar {
        PriceBar::new(t0() + TimeDelta::hours(4 * i as i64), high, low)
    }

    #[test]
    fn test_ratio_validation() {
        assert!(Ratio::new(0.0).is_ok());
        assert!(Ratio::new(1.0).is_ok());
        assert!(Ratio::new(0.5).is_ok());
        assert!(Ratio::new(-0.1).is_err());
        assert!(Ratio::new(1.1).is_err());
        assert!(Ratio::new(f64::NAN).is_err());
        assert!(Ratio::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_period_validation() {
        assert!(Period::new(1).is_ok());
        assert!(Period::new(100).is_ok());
        assert!(Period::new(0).is_err());
    }

    #[test]
    fn test_bar_ext() {
        let b = bar(0, 110.0, 90.0);
        assert_eq!(b.range(), 20.0);
        assert_eq!(b.midpoint(), 100.0);
        assert!(b.validate().is_ok());
        assert!(bar(0, 90.0, 110.0).validate().is_err());
        assert!(bar(0, f64::NAN, 110.0).validate().is_err());
    }

    #[test]
    fn test_engine_builder_defaults() {
        let engine = EngineBuilder::new().build().unwrap();
        assert_eq!(engine.config(), &EngineConfig::default());
        assert_eq!(engine.catalog(), &PatternCatalog::ranged());
        assert!(engine.current().is_none());
        assert!(engine.last_bar_index().is_none());
    }

    #[test]
    fn test_projected_default_catalog_is_exact() {
        let engine = EngineBuilder::new()
            .strategy(MatchingStrategy::projected())
            .build()
            .unwrap();
        assert_eq!(engine.catalog(), &PatternCatalog::exact(0.05).unwrap());
    }

    #[test]
    fn test_builder_reports_first_error() {
        let err = EngineBuilder::new()
            .pivot_lookback(0)
            .price_tolerance(2.0)
            .build()
            .err()
            .unwrap();
        assert_eq!(err, HarmonicError::InvalidValue("Period must be > 0"));

        assert!(EngineBuilder::new().closing_leg_tolerance(0.0).build().is_err());
        assert!(EngineBuilder::new().dedup_ticks(-1.0).build().is_err());
        assert!(EngineBuilder::new().pivot_store_capacity(0).build().is_err());
    }

    #[test]
    fn test_extreme_sizes_do_not_panic() {
        let mut engine = EngineBuilder::new()
            .pivot_store_capacity(usize::MAX)
            .max_pattern_bars(usize::MAX)
            .build()
            .unwrap();
        let bar = PriceBar::new(Utc::now(), 10.0, 9.0);
        assert!(engine.on_bar(0, &bar).unwrap().is_empty());

        let err = EngineBuilder::new().pivot_lookback(usize::MAX).build().err().unwrap();
        assert!(matches!(err, HarmonicError::InvalidConfig(_)));

        let json = format!(r#"{{"pivot_lookback": {}}}"#, usize::MAX / 2 + 1);
        let config: EngineConfig = serde_json::from_str(&json).unwrap();
        assert!(config.validate().is_err());
        assert!(EngineBuilder::new().pivot_lookback(usize::MAX / 2).build().is_ok());
    }

    #[test]
    fn test_out_of_order_and_redelivery() {
        let mut engine = EngineBuilder::new().pivot_lookback(1).build().unwrap();
        engine.on_bar_at(0, &bar(0, 10.0, 9.0), t0()).unwrap();
        engine.on_bar_at(3, &bar(3, 11.0, 10.0), t0()).unwrap();

        assert!(engine.on_bar_at(3, &bar(3, 50.0, 1.0), t0()).unwrap().is_empty());
        assert_eq!(
            engine.on_bar_at(2, &bar(2, 11.0, 10.0), t0()),
            Err(HarmonicError::OutOfOrderBar { last: 3, got: 2 })
        );
        assert_eq!(engine.last_bar_index(), Some(3));
    }

    #[test]
    fn test_invalid_bar_rejected_without_side_effects() {
        let mut engine = EngineBuilder::new().validate_data(true).build().unwrap();
        engine.on_bar_at(0, &bar(0, 10.0, 9.0), t0()).unwrap();

        let err = engine.on_bar_at(1, &bar(1, 9.0, 10.0), t0()).unwrap_err();
        assert_eq!(
            err,
            HarmonicError::InvalidBar {
                index: 1,
                reason: "high < low"
            }
        );
        assert_eq!(engine.last_bar_index(), Some(0));
    }

    #[test]
    fn test_pivot_events_and_reset() {
        let mut engine = EngineBuilder::new().pivot_lookback(1).build().unwrap();
        let bars = [bar(0, 10.0, 9.0), bar(1, 12.0, 10.5), bar(2, 11.0, 10.0)];

        let events: Vec<EngineEvent> = bars
            .iter()
            .enumerate()
            .flat_map(|(i, b)| engine.on_bar_at(i, b, t0()).unwrap())
            .collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            EngineEvent::PivotConfirmed(p) if p.bar_index == 1 && p.is_high()
        ));

        engine.reset();
        assert!(engine.pivots().is_empty());
        assert!(engine.last_bar_index().is_none());
        // Earlier indices are accepted again after a reset
        assert!(engine.on_bar_at(0, &bars[0], t0()).is_ok());
    }

    #[test]
    fn test_quantized_pivots_with_instrument() {
        let mut engine = EngineBuilder::new()
            .pivot_lookback(1)
            .instrument(InstrumentSpec::new_const(0.25, 12.5))
            .build()
            .unwrap();
        engine.on_bar_at(0, &bar(0, 4500.0, 4490.0), t0()).unwrap();
        engine.on_bar_at(1, &bar(1, 4512.37, 4495.0), t0()).unwrap();
        engine.on_bar_at(2, &bar(2, 4505.0, 4491.0), t0()).unwrap();
        assert!((engine.pivots()[0].price - 4512.25).abs() < 1e-9);
    }

    #[test]
    fn test_config_serde() {
        let config = EngineConfig {
            strategy: MatchingStrategy::projected(),
            visibility_horizon: TimeDelta::days(2),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"visibility_horizon\":172800"));
        assert!(json.contains("\"kind\":\"projected\""));

        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: EngineConfig = serde_json::from_str(r#"{"pivot_lookback": 2}"#).unwrap();
        assert_eq!(partial.pivot_lookback.get(), 2);
        assert_eq!(partial.max_pattern_bars.get(), 50);

        assert!(serde_json::from_str::<EngineConfig>(r#"{"pivot_lookback": 0}"#).is_err());
        assert!(serde_json::from_str::<EngineConfig>(r#"{"price_tolerance": 1.5}"#).is_err());
    }

    #[test]
    fn test_config_with_params() {
        let mut params = HashMap::new();
        params.insert("pivot_lookback", 2.0);
        params.insert("visibility_days", 3.0);

        let config = EngineConfig::with_params(&params).unwrap();
        assert_eq!(config.pivot_lookback.get(), 2);
        assert_eq!(config.visibility_horizon, TimeDelta::days(3));
        assert_eq!(config.max_pattern_bars.get(), 50);

        params.insert("closing_leg_tolerance", 0.0);
        assert!(EngineConfig::with_params(&params).is_err());
        assert_eq!(EngineConfig::param_meta().len(), 6);
    }

    #[test]
    fn test_manual_clock_drives_engine() {
        let clock = ManualClock::new(t0());
        let engine = EngineBuilder::new().clock(clock.clone()).build().unwrap();
        clock.advance(TimeDelta::hours(3));
        assert_eq!(engine.clock().now(), t0() + TimeDelta::hours(3));
    }
}
