/// Reconciled counters (likes, comments, views, followers)
/// The displayed value is the last server-confirmed value plus the net
/// effect of optimistic deltas that have not been settled yet.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct Counter {
    confirmed: u64,
    pending: i64,
}

impl Counter {
    pub const fn new(confirmed: u64) -> Self {
        Self {
            confirmed,
            pending: 0,
        }
    }

    /// Value to display, never below zero.
    pub fn value(&self) -> u64 {
        (self.confirmed as i128 + self.pending as i128).max(0) as u64
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    pub fn pending(&self) -> i64 {
        self.pending
    }

    /// Apply an optimistic delta and return the part that was actually
    /// applied after flooring at zero. The returned amount is what must be
    /// handed back to `retract` or `settle` later.
    pub fn predict(&mut self, delta: i64) -> i64 {
        let current = self.value() as i64;
        let next = current.saturating_add(delta).max(0);
        let applied = next - current;
        self.pending += applied;
        applied
    }

    /// Undo a prediction (failed request).
    pub fn retract(&mut self, applied: i64) {
        self.pending -= applied;
    }

    /// The server acknowledged a prediction: move it from pending into the
    /// confirmed value. The displayed value does not change.
    pub fn settle(&mut self, applied: i64) {
        self.pending -= applied;
        self.apply_confirmed(applied);
    }

    /// Apply a server-side change observed from someone else.
    pub fn apply_confirmed(&mut self, delta: i64) {
        self.confirmed = if delta >= 0 {
            self.confirmed.saturating_add(delta as u64)
        } else {
            self.confirmed.saturating_sub(delta.unsigned_abs())
        };
    }

    /// Replace the confirmed value with a fresh server snapshot, keeping any
    /// outstanding prediction on top.
    pub fn reset_confirmed(&mut self, value: u64) {
        self.confirmed = value;
    }

    /// Drop an outstanding prediction because a snapshot already includes it.
    pub fn absorb(&mut self, applied: i64) {
        self.pending -= applied;
    }
}

impl From<u64> for Counter {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<Counter> for u64 {
    fn from(counter: Counter) -> Self {
        counter.value()
    }
}
