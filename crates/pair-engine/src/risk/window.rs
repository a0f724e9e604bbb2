//! Per-window exposure accounting.
//!
//! Tracks cumulative USD deployed into each market's 15-minute window so
//! the gate can enforce `max_per_window_usd`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// Cumulative spend per condition id, pruned when windows close.
#[derive(Debug, Default)]
pub struct WindowLedger {
    inner: Mutex<HashMap<String, Spend>>,
}

#[derive(Debug, Clone)]
struct Spend {
    amount: Decimal,
    window_end: DateTime<Utc>,
}

impl WindowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record USD deployed into a market window.
    pub fn add(&self, condition_id: &str, amount: Decimal, window_end: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner
            .entry(condition_id.to_string())
            .and_modify(|s| s.amount += amount)
            .or_insert(Spend {
                amount,
                window_end,
            });
    }

    /// USD already deployed into this window.
    pub fn spent(&self, condition_id: &str) -> Decimal {
        self.inner
            .lock()
            .get(condition_id)
            .map(|s| s.amount)
            .unwrap_or(Decimal::ZERO)
    }

    /// Drop entries whose windows have closed. Returns how many were pruned.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, s| s.window_end > now);
        before - inner.len()
    }
}
