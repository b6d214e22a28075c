//! Bounded, deduplicated pivot history ordered by bar index

use serde::{Deserialize, Serialize};

use super::Pivot;
use crate::{instrument::InstrumentSpec, Period};

/// Threshold under which two same-kind pivots at adjacent bars count as the same price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PriceEquality {
    /// `multiple * tick_size`
    Ticks { tick_size: f64, multiple: f64 },
    /// `fraction * |price|`
    Relative { fraction: f64 },
}

impl PriceEquality {
    /// Tick-based when the instrument is known, relative otherwise
    pub fn for_instrument(instrument: Option<&InstrumentSpec>, ticks: f64, fraction: f64) -> Self {
        match instrument {
            Some(spec) => Self::Ticks {
                tick_size: spec.tick_size,
                multiple: ticks,
            },
            None => Self::Relative { fraction },
        }
    }

    #[inline]
    pub fn threshold(&self, price: f64) -> f64 {
        match *self {
            Self::Ticks {
                tick_size,
                multiple,
            } => tick_size * multiple,
            Self::Relative { fraction } => price.abs() * fraction,
        }
    }
}

/// Pivot history, the engine's persistent swing state
#[derive(Debug, Clone)]
pub struct PivotStore {
    pivots: Vec<Pivot>,
    capacity: Period,
    equality: PriceEquality,
}

impl PivotStore {
    pub fn new(capacity: Period, equality: PriceEquality) -> Self {
        Self {
            pivots: Vec::new(),
            capacity,
            equality,
        }
    }

    /// Same kind, at most one bar apart and closer than the price-equality threshold
    pub fn is_duplicate(&self, candidate: &Pivot) -> bool {
        let threshold = self.equality.threshold(candidate.price);
        self.pivots.iter().any(|p| {
            p.kind == candidate.kind
                && p.bar_index.abs_diff(candidate.bar_index) <= 1
                && (p.price - candidate.price).abs() < threshold
        })
    }

    /// Insert keeping bar order; entries sharing a bar index stay in arrival order.
    /// Returns `false` if the pivot duplicates a stored one.
    pub fn insert(&mut self, pivot: Pivot) -> bool {
        if self.is_duplicate(&pivot) {
            log::trace!(
                "rejected duplicate {:?} pivot at bar {} price {:.5}",
                pivot.kind,
                pivot.bar_index,
                pivot.price
            );
            return false;
        }
        let pos = self.pivots.partition_point(|p| p.bar_index <= pivot.bar_index);
        self.pivots.insert(pos, pivot);
        true
    }

    /// Remove the oldest pivots until at most `max_size` remain. Returns the number removed.
    pub fn prune(&mut self, max_size: usize) -> usize {
        let excess = self.pivots.len().saturating_sub(max_size);
        if excess > 0 {
            self.pivots.drain(..excess);
            log::debug!(
                "removed {} old pivots, keeping {} recent ones",
                excess,
                self.pivots.len()
            );
        }
        excess
    }

    /// Insert a batch then prune to capacity. Returns the accepted pivots.
    pub fn insert_batch(&mut self, pivots: impl IntoIterator<Item = Pivot>) -> Vec<Pivot> {
        let accepted: Vec<Pivot> = pivots.into_iter().filter(|p| self.insert(*p)).collect();
        self.prune(self.capacity.get());
        accepted
    }

    /// Ordered view for searching
    #[inline]
    pub fn snapshot(&self) -> &[Pivot] {
        &self.pivots
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pivots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pivots.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn equality(&self) -> PriceEquality {
        self.equality
    }

    pub fn clear(&mut self) {
        self.pivots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harmonics::PivotKind;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn relative_store(capacity: usize) -> PivotStore {
        PivotStore::new(
            Period::new(capacity).unwrap(),
            PriceEquality::Relative { fraction: 0.001 },
        )
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut store = relative_store(100);
        assert!(store.insert(Pivot::high(10, 100.0, t0())));
        // one bar later, 0.05% away
        assert!(!store.insert(Pivot::high(11, 100.05, t0())));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_not_duplicate_when_far_or_other_kind() {
        let mut store = relative_store(100);
        assert!(store.insert(Pivot::high(10, 100.0, t0())));
        assert!(store.insert(Pivot::high(12, 100.0, t0())));
        assert!(store.insert(Pivot::high(13, 101.0, t0())));
        assert!(store.insert(Pivot::low(10, 100.0, t0())));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_tick_threshold() {
        let es = InstrumentSpec::new_const(0.25, 12.5);
        let mut store = PivotStore::new(
            Period::new_const(100),
            PriceEquality::for_instrument(Some(&es), 2.0, 0.001),
        );
        assert!(store.insert(Pivot::low(5, 4500.0, t0())));
        assert!(!store.insert(Pivot::low(6, 4500.25, t0())));
        // exactly two ticks is not below the threshold
        assert!(store.insert(Pivot::low(6, 4500.5, t0())));
    }

    #[test]
    fn test_ordering_with_ties() {
        let mut store = relative_store(100);
        store.insert(Pivot::high(4, 10.0, t0()));
        store.insert(Pivot::low(7, 8.0, t0()));
        store.insert(Pivot::high(7, 12.0, t0()));
        store.insert(Pivot::low(5, 9.0, t0()));

        let snapshot = store.snapshot();
        let order: Vec<(usize, PivotKind)> =
            snapshot.iter().map(|p| (p.bar_index, p.kind)).collect();
        assert_eq!(
            order,
            vec![
                (4, PivotKind::High),
                (5, PivotKind::Low),
                (7, PivotKind::Low),
                (7, PivotKind::High),
            ]
        );
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let mut store = relative_store(3);
        let accepted =
            store.insert_batch((0..6).map(|i| Pivot::high(i * 3, 100.0 + i as f64, t0())));
        assert_eq!(accepted.len(), 6);
        assert_eq!(store.len(), 3);
        let bars: Vec<usize> = store.snapshot().iter().map(|p| p.bar_index).collect();
        assert_eq!(bars, vec![9, 12, 15]);
    }

    #[test]
    fn test_prune_explicit() {
        let mut store = relative_store(100);
        for i in 0..10 {
            store.insert(Pivot::low(i * 2, 50.0 + i as f64, t0()));
        }
        assert_eq!(store.prune(4), 6);
        assert_eq!(store.prune(4), 0);
        assert_eq!(store.snapshot()[0].bar_index, 12);
    }

    #[test]
    fn test_huge_capacity_allocates_lazily() {
        let mut store = relative_store(usize::MAX);
        assert_eq!(store.capacity(), usize::MAX);
        assert_eq!(store.insert_batch([Pivot::low(0, 50.0, t0())]).len(), 1);
        assert_eq!(store.len(), 1);
    }
}
