//! Instrument tick arithmetic
//!
//! Detection never hard-wires a contract table. The engine is handed an
//! [`InstrumentSpec`] directly, or resolves one through any
//! [`InstrumentLookup`] (a closure or an [`InstrumentTable`]).
//!
//! ```rust
//! use yahpd::instrument::{InstrumentLookup, InstrumentTable};
//!
//! let table = InstrumentTable::with_futures_defaults();
//! let es = table.resolve("ES");
//! assert_eq!(es.tick_size, 0.25);
//! // 4 points = 16 ticks at $12.50
//! assert_eq!(es.price_to_currency(4.0), 200.0);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{harmonics::helpers::quantize, HarmonicError, Result};

/// Tick size and currency value of one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub tick_size: f64,
    pub tick_value: f64,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self::new_const(0.01, 1.0)
    }
}

impl InstrumentSpec {
    pub fn new(tick_size: f64, tick_value: f64) -> Result<Self> {
        for (field, value) in [("tick_size", tick_size), ("tick_value", tick_value)] {
            if !value.is_finite() {
                return Err(HarmonicError::InvalidValue("tick size and value must be finite"));
            }
            if value <= 0.0 {
                return Err(HarmonicError::OutOfRange {
                    field,
                    value,
                    min: f64::MIN_POSITIVE,
                    max: f64::MAX,
                });
            }
        }
        Ok(Self::new_const(tick_size, tick_value))
    }

    #[doc(hidden)]
    pub const fn new_const(tick_size: f64, tick_value: f64) -> Self {
        Self {
            tick_size,
            tick_value,
        }
    }

    /// Round to the nearest tick
    #[inline]
    pub fn quantize(&self, price: f64) -> f64 {
        quantize(price, self.tick_size)
    }

    /// Currency value of a price move: `delta / tick_size * tick_value`
    #[inline]
    pub fn price_to_currency(&self, delta: f64) -> f64 {
        delta / self.tick_size * self.tick_value
    }

    /// Price move worth `value` in currency
    #[inline]
    pub fn currency_to_price(&self, value: f64) -> f64 {
        value / self.tick_value * self.tick_size
    }
}

// ============================================================
// LOOKUP
// ============================================================

/// Source of instrument specs keyed by symbol
pub trait InstrumentLookup {
    fn lookup(&self, symbol: &str) -> Option<InstrumentSpec>;

    /// Like [`lookup`](Self::lookup), falling back to [`InstrumentSpec::default`]
    fn resolve(&self, symbol: &str) -> InstrumentSpec {
        self.lookup(symbol).unwrap_or_else(|| {
            log::debug!("no instrument spec for {symbol}, using default tick size");
            InstrumentSpec::default()
        })
    }
}

impl<F> InstrumentLookup for F
where
    F: Fn(&str) -> Option<InstrumentSpec>,
{
    fn lookup(&self, symbol: &str) -> Option<InstrumentSpec> {
        self(symbol)
    }
}

/// Symbol table with a configurable fallback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentTable {
    specs: HashMap<String, InstrumentSpec>,
    #[serde(default)]
    fallback: Option<InstrumentSpec>,
}

impl InstrumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Common CME/ICE futures roots
    pub fn with_futures_defaults() -> Self {
        Self::new()
            .with("6B", InstrumentSpec::new_const(0.0001, 6.25))
            .with("CL", InstrumentSpec::new_const(0.01, 10.0))
            .with("ES", InstrumentSpec::new_const(0.25, 12.5))
            .with("GC", InstrumentSpec::new_const(0.1, 10.0))
            .with("YM", InstrumentSpec::new_const(1.0, 5.0))
    }

    pub fn insert(
        &mut self,
        symbol: impl Into<String>,
        spec: InstrumentSpec,
    ) -> Option<InstrumentSpec> {
        self.specs.insert(symbol.into(), spec)
    }

    pub fn with(mut self, symbol: impl Into<String>, spec: InstrumentSpec) -> Self {
        self.insert(symbol, spec);
        self
    }

    /// Spec returned for unknown symbols instead of `None`
    pub fn fallback(mut self, spec: InstrumentSpec) -> Self {
        self.fallback = Some(spec);
        self
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl InstrumentLookup for InstrumentTable {
    fn lookup(&self, symbol: &str) -> Option<InstrumentSpec> {
        self.specs.get(symbol).copied().or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(InstrumentSpec::new(0.25, 12.5).is_ok());
        assert!(InstrumentSpec::new(0.0, 12.5).is_err());
        assert!(InstrumentSpec::new(0.25, -1.0).is_err());
        assert!(InstrumentSpec::new(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_currency_conversion() {
        let cl = InstrumentSpec::new_const(0.01, 10.0);
        assert!((cl.price_to_currency(0.5) - 500.0).abs() < 1e-9);
        assert!((cl.currency_to_price(500.0) - 0.5).abs() < 1e-9);
        assert!((cl.quantize(71.234) - 71.23).abs() < 1e-9);
    }

    #[test]
    fn test_table_lookup_and_fallback() {
        let table = InstrumentTable::with_futures_defaults();
        assert_eq!(table.len(), 5);
        assert_eq!(table.lookup("YM"), Some(InstrumentSpec::new_const(1.0, 5.0)));
        assert_eq!(table.lookup("NQ"), None);
        assert_eq!(table.resolve("NQ"), InstrumentSpec::default());

        let table = table.fallback(InstrumentSpec::new_const(0.5, 2.0));
        assert_eq!(table.lookup("NQ"), Some(InstrumentSpec::new_const(0.5, 2.0)));
    }

    #[test]
    fn test_closure_lookup() {
        let lookup = |symbol: &str| (symbol == "GC").then(|| InstrumentSpec::new_const(0.1, 10.0));
        assert_eq!(lookup.resolve("GC").tick_size, 0.1);
        assert_eq!(lookup.resolve("ZB"), InstrumentSpec::default());
    }
}
