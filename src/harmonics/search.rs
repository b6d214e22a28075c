//! XABCD search over an ordered pivot snapshot
//!
//! Two strategies are available:
//!
//! - [`MatchingStrategy::Projected`]: project the expected B, C and D prices from
//!   each template's target ratios and pick the nearest actual pivot within
//!   `price_tolerance`. No backtracking once a point is picked.
//! - [`MatchingStrategy::Direct`]: enumerate actual B, C and D pivots and test the
//!   realized ratios against the template constraints, pruning on geometry.
//!
//! Both keep the candidate with the most recent completion point by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    catalog::{PatternCatalog, RatioTemplate},
    helpers::*,
    HarmonicPattern, Pivot, PivotKind,
};
use crate::Direction;

// ============================================================
// STRATEGY SELECTION
// ============================================================

/// Which candidate a projected scan reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Scan every pair and template, keep the greatest D bar index
    #[default]
    MostRecent,
    /// Stop at the first confirmed candidate in scan order
    FirstMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchingStrategy {
    Projected {
        #[serde(default)]
        scan: ScanMode,
    },
    Direct,
}

impl Default for MatchingStrategy {
    fn default() -> Self {
        Self::Direct
    }
}

impl MatchingStrategy {
    pub const fn projected() -> Self {
        Self::Projected {
            scan: ScanMode::MostRecent,
        }
    }
}

/// Numeric limits of one search pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Maximum bars between X and A
    pub max_pattern_bars: usize,
    /// Relative distance allowed from a projected price (projected strategy only)
    pub price_tolerance: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_pattern_bars: DEFAULT_MAX_PATTERN_BARS,
            price_tolerance: DEFAULT_PRICE_TOLERANCE,
        }
    }
}

// ============================================================
// CANDIDATE
// ============================================================

/// Matched quintuple, kept by reference until it is reported
#[derive(Debug, Clone, Copy)]
struct Candidate<'t> {
    template: &'t RatioTemplate,
    points: [Pivot; PATTERN_POINTS],
    direction: Direction,
}

impl Candidate<'_> {
    #[inline]
    fn completion_index(&self) -> usize {
        self.points[4].bar_index
    }

    fn into_pattern(self, detected_at: DateTime<Utc>) -> HarmonicPattern {
        let [x, a, b, c, d] = self.points;
        HarmonicPattern {
            template: self.template.name.clone(),
            x,
            a,
            b,
            c,
            d,
            direction: self.direction,
            detected_at,
        }
    }
}

/// Strictly later completion replaces, so ties keep the first found
#[inline]
fn keep_most_recent<'t>(best: &mut Option<Candidate<'t>>, candidate: Candidate<'t>) {
    if best.map_or(true, |b| candidate.completion_index() > b.completion_index()) {
        *best = Some(candidate);
    }
}

// ============================================================
// PATTERN SEARCH
// ============================================================

/// One search pass over a borrowed catalog
#[derive(Debug, Clone, Copy)]
pub struct PatternSearch<'a> {
    catalog: &'a PatternCatalog,
    strategy: MatchingStrategy,
    params: SearchParams,
}

impl<'a> PatternSearch<'a> {
    pub fn new(
        catalog: &'a PatternCatalog,
        strategy: MatchingStrategy,
        params: SearchParams,
    ) -> Self {
        Self {
            catalog,
            strategy,
            params,
        }
    }

    pub fn strategy(&self) -> MatchingStrategy {
        self.strategy
    }

    pub fn params(&self) -> SearchParams {
        self.params
    }

    /// Best completed match in `pivots` (ordered by bar index), stamped with `detected_at`
    pub fn run(&self, pivots: &[Pivot], detected_at: DateTime<Utc>) -> Option<HarmonicPattern> {
        if pivots.len() < PATTERN_POINTS {
            return None;
        }
        let best = match self.strategy {
            MatchingStrategy::Projected { scan } => self.projected(pivots, scan),
            MatchingStrategy::Direct => self.direct(pivots),
        }?;
        log::debug!(
            "{} {} completed at bar {} (X at bar {})",
            best.direction,
            best.template.name,
            best.completion_index(),
            best.points[0].bar_index
        );
        Some(best.into_pattern(detected_at))
    }

    /// Valid X->A pairs in scan order: X ascending, A ascending within the span limit
    fn xa_pairs<'p>(
        &self,
        pivots: &'p [Pivot],
    ) -> impl Iterator<Item = (usize, &'p Pivot, usize, &'p Pivot, Direction)> + 'p {
        let max_bars = self.params.max_pattern_bars;
        pivots.iter().enumerate().flat_map(move |(xi, x)| {
            pivots
                .iter()
                .enumerate()
                .skip(xi + 1)
                .take_while(move |(_, a)| a.bar_index - x.bar_index <= max_bars)
                .filter_map(move |(ai, a)| xa_direction(x, a).map(|dir| (xi, x, ai, a, dir)))
        })
    }

    // ------------------------------------------------------------
    // Strategy A: projected nearest
    // ------------------------------------------------------------

    fn projected(&self, pivots: &[Pivot], scan: ScanMode) -> Option<Candidate<'a>> {
        let mut best = None;
        for (_, x, ai, a, direction) in self.xa_pairs(pivots) {
            for template in self.catalog {
                let Some(candidate) = self.project_from(pivots, x, ai, a, direction, template)
                else {
                    continue;
                };
                match scan {
                    ScanMode::FirstMatch => return Some(candidate),
                    ScanMode::MostRecent => keep_most_recent(&mut best, candidate),
                }
            }
        }
        best
    }

    fn project_from(
        &self,
        pivots: &[Pivot],
        x: &Pivot,
        ai: usize,
        a: &Pivot,
        direction: Direction,
        template: &'a RatioTemplate,
    ) -> Option<Candidate<'a>> {
        let tolerance = self.params.price_tolerance;
        let bullish = direction.is_bullish();
        log::trace!(
            "projecting {} from X bar {} / A bar {}",
            template.name,
            x.bar_index,
            a.bar_index
        );

        let xa = leg(x.price, a.price);
        let expected_b = project(a.price, xa, template.ab_xa.target(), !bullish);
        let bi = find_nearest(pivots, ai, a.kind.opposite(), expected_b, tolerance)?;
        let b = &pivots[bi];

        let ab = leg(a.price, b.price);
        if ab <= f64::EPSILON {
            return None;
        }
        let expected_c = project(b.price, ab, template.bc_ab.target(), bullish);
        let ci = find_nearest(pivots, bi, b.kind.opposite(), expected_c, tolerance)?;
        let c = &pivots[ci];

        let bc = leg(b.price, c.price);
        if bc <= f64::EPSILON {
            return None;
        }
        let expected_d = project(c.price, bc, template.cd_bc.target(), !bullish);
        let di = find_nearest(pivots, ci, c.kind.opposite(), expected_d, tolerance)?;
        let d = &pivots[di];

        let closing = template.closing_ratio(x, a, d)?;
        template.closing.contains(closing).then_some(Candidate {
            template,
            points: [*x, *a, *b, *c, *d],
            direction,
        })
    }

    // ------------------------------------------------------------
    // Strategy B: direct ratio ranges
    // ------------------------------------------------------------

    fn direct(&self, pivots: &[Pivot]) -> Option<Candidate<'a>> {
        let mut best = None;
        for template in self.catalog {
            log::trace!("direct scan for {}", template.name);
            for (_, x, ai, a, direction) in self.xa_pairs(pivots) {
                self.direct_from(pivots, x, ai, a, direction, template, &mut best);
            }
        }
        best
    }

    #[allow(clippy::too_many_arguments)]
    fn direct_from(
        &self,
        pivots: &[Pivot],
        x: &Pivot,
        ai: usize,
        a: &Pivot,
        direction: Direction,
        template: &'a RatioTemplate,
        best: &mut Option<Candidate<'a>>,
    ) {
        let xa = leg(x.price, a.price);
        for (bi, b) in successors(pivots, ai, x.kind) {
            if !strictly_between(b.price, x.price, a.price) {
                continue;
            }
            let ab = leg(a.price, b.price);
            if !leg_ratio(ab, xa).is_some_and(|r| template.ab_xa.contains(r)) {
                continue;
            }
            for (ci, c) in successors(pivots, bi, a.kind) {
                if !strictly_between(c.price, b.price, a.price) {
                    continue;
                }
                let bc = leg(b.price, c.price);
                if !leg_ratio(bc, ab).is_some_and(|r| template.bc_ab.contains(r)) {
                    continue;
                }
                for (_, d) in successors(pivots, ci, x.kind) {
                    if !beyond_bc(d.price, b.price, c.price, direction) {
                        continue;
                    }
                    let cd = leg(c.price, d.price);
                    if !leg_ratio(cd, bc).is_some_and(|r| template.cd_bc.contains(r)) {
                        continue;
                    }
                    if template
                        .closing_ratio(x, a, d)
                        .is_some_and(|r| template.closing.contains(r))
                    {
                        keep_most_recent(
                            best,
                            Candidate {
                                template,
                                points: [*x, *a, *b, *c, *d],
                                direction,
                            },
                        );
                    }
                }
            }
        }
    }
}

/// Pivots of `kind` strictly after the pivot at `from` by bar index
fn successors(
    pivots: &[Pivot],
    from: usize,
    kind: PivotKind,
) -> impl Iterator<Item = (usize, &Pivot)> {
    let after = pivots[from].bar_index;
    pivots
        .iter()
        .enumerate()
        .skip(from + 1)
        .filter(move |(_, p)| p.kind == kind && p.bar_index > after)
}

/// Position of the pivot of `kind` after `from` whose price is nearest `expected`
/// and within `tolerance`. The earliest wins among equally near pivots.
fn find_nearest(
    pivots: &[Pivot],
    from: usize,
    kind: PivotKind,
    expected: f64,
    tolerance: f64,
) -> Option<usize> {
    if expected <= 0.0 {
        return None;
    }
    let mut nearest: Option<(usize, f64)> = None;
    for (i, p) in successors(pivots, from, kind) {
        if !within_relative(p.price, expected, tolerance) {
            continue;
        }
        let distance = (p.price - expected).abs();
        if nearest.map_or(true, |(_, best)| distance < best) {
            nearest = Some((i, distance));
        }
    }
    nearest.map(|(i, _)| i)
}
