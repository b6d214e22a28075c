//! Current-pattern slot with recency replacement and time-based expiry

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::HarmonicPattern;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LifecycleState {
    #[default]
    Idle,
    Active(HarmonicPattern),
}

/// Transition emitted by [`PatternLifecycle`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Detected(HarmonicPattern),
    Expired(HarmonicPattern),
}

/// Owns the single current pattern.
///
/// While active, only a pattern completing strictly later than the current one
/// replaces it. Once idle, the next offered pattern is accepted, including one
/// that completes on the same bar as an expired pattern.
#[derive(Debug, Clone)]
pub struct PatternLifecycle {
    state: LifecycleState,
    horizon: TimeDelta,
}

impl PatternLifecycle {
    /// A horizon of zero or less disables expiry
    pub fn new(horizon: TimeDelta) -> Self {
        Self {
            state: LifecycleState::Idle,
            horizon,
        }
    }

    pub fn horizon(&self) -> TimeDelta {
        self.horizon
    }

    /// Accept `pattern` when idle, or when it completes strictly later than the current one
    pub fn offer(&mut self, pattern: HarmonicPattern) -> Option<LifecycleEvent> {
        let completion = pattern.completion_index();
        match &self.state {
            LifecycleState::Active(current) if completion <= current.completion_index() => {
                return None;
            }
            _ => {}
        }
        log::debug!(
            "{} {} active, D at bar {} price {:.5}",
            pattern.direction,
            pattern.template,
            completion,
            pattern.d.price
        );
        self.state = LifecycleState::Active(pattern.clone());
        Some(LifecycleEvent::Detected(pattern))
    }

    /// Expire the current pattern if `now` is past its visibility deadline
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<LifecycleEvent> {
        let expired = matches!(&self.state, LifecycleState::Active(p) if self.is_expired(p, now));
        if !expired {
            return None;
        }
        match std::mem::take(&mut self.state) {
            LifecycleState::Active(pattern) => {
                log::debug!(
                    "{} detected at {} expired at {}",
                    pattern.template,
                    pattern.detected_at,
                    now
                );
                Some(LifecycleEvent::Expired(pattern))
            }
            LifecycleState::Idle => None,
        }
    }

    /// `now > detected_at + horizon`; never for a non-positive horizon or an overflowing deadline
    pub fn is_expired(&self, pattern: &HarmonicPattern, now: DateTime<Utc>) -> bool {
        if self.horizon <= TimeDelta::zero() {
            return false;
        }
        pattern
            .detected_at
            .checked_add_signed(self.horizon)
            .is_some_and(|deadline| now > deadline)
    }

    pub fn current(&self) -> Option<&HarmonicPattern> {
        match &self.state {
            LifecycleState::Active(pattern) => Some(pattern),
            LifecycleState::Idle => None,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.state, LifecycleState::Active(_))
    }

    /// Back to `Idle`
    pub fn clear(&mut self) {
        self.state = LifecycleState::Idle;
    }
}
