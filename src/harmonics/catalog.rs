//! Fibonacci ratio templates for harmonic patterns
//!
//! Two catalogs ship with the crate:
//! - [`PatternCatalog::ranged`]: min/max ranges per leg, closing leg measured as AD/XA
//! - [`PatternCatalog::exact`]: exact targets with a symmetric tolerance, closing leg XD/XA

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{
    helpers::{leg, leg_ratio},
    Pivot,
};
use crate::{HarmonicError, Result};

pub const GARTLEY: &str = "Gartley";
pub const BAT: &str = "Bat";
pub const BUTTERFLY: &str = "Butterfly";
pub const CRAB: &str = "Crab";

// ============================================================
// RATIO CONSTRAINT
// ============================================================

/// Constraint on a single leg ratio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum RatioConstraint {
    /// `|actual / target - 1| <= tolerance`
    Exact { target: f64, tolerance: f64 },
    /// `min <= actual <= max`
    Range { min: f64, max: f64 },
}

impl RatioConstraint {
    pub const fn exact(target: f64, tolerance: f64) -> Self {
        Self::Exact { target, tolerance }
    }

    pub const fn range(min: f64, max: f64) -> Self {
        Self::Range { min, max }
    }

    /// Check an observed ratio against the constraint
    #[inline]
    pub fn contains(&self, actual: f64) -> bool {
        match *self {
            Self::Exact { target, tolerance } => {
                target > 0.0 && (actual / target - 1.0).abs() <= tolerance
            }
            Self::Range { min, max } => actual >= min && actual <= max,
        }
    }

    /// Ratio used when projecting an expected price: the exact target or the range midpoint
    #[inline]
    pub fn target(&self) -> f64 {
        match *self {
            Self::Exact { target, .. } => target,
            Self::Range { min, max } => (min + max) / 2.0,
        }
    }

    fn check(&self) -> std::result::Result<(), &'static str> {
        match *self {
            Self::Exact { target, tolerance } => {
                if !target.is_finite() || !tolerance.is_finite() {
                    return Err("exact constraint must be finite");
                }
                if target <= 0.0 {
                    return Err("exact target must be > 0");
                }
                if tolerance <= 0.0 {
                    return Err("tolerance must be > 0");
                }
            }
            Self::Range { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err("range bounds must be finite");
                }
                if min <= 0.0 {
                    return Err("range min must be > 0");
                }
                if min > max {
                    return Err("range min > max");
                }
            }
        }
        Ok(())
    }
}

// ============================================================
// CLOSING LEG
// ============================================================

/// How the closing point D is measured against the XA leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingLeg {
    /// `|D - X| / |A - X|`
    Xd,
    /// `|D - A| / |A - X|`, the retracement of XA measured from A
    Ad,
}

impl ClosingLeg {
    #[inline]
    pub fn measure(self, x: f64, a: f64, d: f64) -> f64 {
        match self {
            ClosingLeg::Xd => leg(x, d),
            ClosingLeg::Ad => leg(a, d),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ClosingLeg::Xd => "XD/XA",
            ClosingLeg::Ad => "AD/XA",
        }
    }
}

// ============================================================
// RATIO TEMPLATE
// ============================================================

/// Named set of leg constraints describing one harmonic pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioTemplate {
    pub name: String,
    pub ab_xa: RatioConstraint,
    pub bc_ab: RatioConstraint,
    pub cd_bc: RatioConstraint,
    pub closing_leg: ClosingLeg,
    pub closing: RatioConstraint,
}

impl RatioTemplate {
    pub fn new(
        name: impl Into<String>,
        ab_xa: RatioConstraint,
        bc_ab: RatioConstraint,
        cd_bc: RatioConstraint,
        closing_leg: ClosingLeg,
        closing: RatioConstraint,
    ) -> Self {
        Self {
            name: name.into(),
            ab_xa,
            bc_ab,
            cd_bc,
            closing_leg,
            closing,
        }
    }

    /// Realized closing ratio for the given X, A and D, `None` if XA is degenerate
    #[inline]
    pub fn closing_ratio(&self, x: &Pivot, a: &Pivot, d: &Pivot) -> Option<f64> {
        let closing = self.closing_leg.measure(x.price, a.price, d.price);
        leg_ratio(closing, leg(x.price, a.price))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HarmonicError::InvalidTemplate {
                name: self.name.clone(),
                reason: "template name is empty".to_string(),
            });
        }
        let legs = [
            ("AB/XA", &self.ab_xa),
            ("BC/AB", &self.bc_ab),
            ("CD/BC", &self.cd_bc),
            (self.closing_leg.label(), &self.closing),
        ];
        for (label, constraint) in legs {
            constraint.check().map_err(|reason| HarmonicError::InvalidTemplate {
                name: self.name.clone(),
                reason: format!("{label}: {reason}"),
            })?;
        }
        Ok(())
    }
}

// ============================================================
// PATTERN CATALOG
// ============================================================

/// Ordered, read-only table of ratio templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternCatalog {
    templates: Vec<RatioTemplate>,
}

impl Default for PatternCatalog {
    fn default() -> Self {
        Self::ranged()
    }
}

impl PatternCatalog {
    /// Build a catalog, validating every template
    pub fn new(templates: Vec<RatioTemplate>) -> Result<Self> {
        let catalog = Self { templates };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Range-based templates with the closing leg measured as AD/XA
    pub fn ranged() -> Self {
        use RatioConstraint as R;

        let bc = R::range(0.382, 0.886);
        Self {
            templates: vec![
                RatioTemplate::new(
                    GARTLEY,
                    R::range(0.613, 0.623),
                    bc,
                    R::range(1.27, 1.618),
                    ClosingLeg::Ad,
                    R::range(0.781, 0.791),
                ),
                RatioTemplate::new(
                    BAT,
                    R::range(0.382, 0.50),
                    bc,
                    R::range(1.618, 2.618),
                    ClosingLeg::Ad,
                    R::range(0.881, 0.891),
                ),
                RatioTemplate::new(
                    BUTTERFLY,
                    R::range(0.781, 0.791),
                    bc,
                    R::range(1.618, 2.618),
                    ClosingLeg::Ad,
                    R::range(1.27, 1.618),
                ),
                RatioTemplate::new(
                    CRAB,
                    R::range(0.382, 0.618),
                    bc,
                    R::range(2.24, 3.618),
                    ClosingLeg::Ad,
                    R::range(1.613, 1.623),
                ),
            ],
        }
    }

    /// Exact-target templates with the closing leg measured as XD/XA.
    ///
    /// `tolerance` applies to every leg.
    pub fn exact(tolerance: f64) -> Result<Self> {
        let e = |target| RatioConstraint::exact(target, tolerance);
        Self::new(vec![
            RatioTemplate::new(GARTLEY, e(0.618), e(0.382), e(1.272), ClosingLeg::Xd, e(0.786)),
            RatioTemplate::new(BAT, e(0.382), e(0.382), e(1.618), ClosingLeg::Xd, e(0.886)),
            RatioTemplate::new(BUTTERFLY, e(0.786), e(0.382), e(1.618), ClosingLeg::Xd, e(1.27)),
            RatioTemplate::new(CRAB, e(0.382), e(0.382), e(2.618), ClosingLeg::Xd, e(1.618)),
        ])
    }

    /// Validate all templates. Needed after deserializing a catalog.
    pub fn validate(&self) -> Result<()> {
        if self.templates.is_empty() {
            return Err(HarmonicError::InvalidConfig("catalog has no templates".to_string()));
        }
        let mut seen = HashSet::new();
        for template in &self.templates {
            template.validate()?;
            if !seen.insert(template.name.as_str()) {
                return Err(HarmonicError::InvalidTemplate {
                    name: template.name.clone(),
                    reason: "duplicate template name".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RatioTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Templates in catalog order
    pub fn iter(&self) -> std::slice::Iter<'_, RatioTemplate> {
        self.templates.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl<'a> IntoIterator for &'a PatternCatalog {
    type Item = &'a RatioTemplate;
    type IntoIter = std::slice::Iter<'a, RatioTemplate>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
