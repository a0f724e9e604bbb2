//! Multi-level circuit breaker.
//!
//! Accumulates consecutive execution failures and daily realized P&L and
//! maps them to a coarse safety level. Within a day bucket the level only
//! escalates; it returns to NORMAL at the configured daily reset.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerSettings;
use crate::store::CircuitBreakerSnapshot;

/// Safety level, worst to mildest effect:
/// HALT blocks everything mutating except cancels, CAUTION blocks entries,
/// WARNING halves sizing, NORMAL is unrestricted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreakerLevel {
    Normal,
    Warning,
    Caution,
    Halt,
}

impl BreakerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerLevel::Normal => "NORMAL",
            BreakerLevel::Warning => "WARNING",
            BreakerLevel::Caution => "CAUTION",
            BreakerLevel::Halt => "HALT",
        }
    }

    /// Sizing multiplier applied to admitted budgets.
    pub fn size_multiplier(&self) -> Decimal {
        match self {
            BreakerLevel::Normal => Decimal::ONE,
            BreakerLevel::Warning => Decimal::new(5, 1), // 0.5
            BreakerLevel::Caution | BreakerLevel::Halt => Decimal::ZERO,
        }
    }

    /// Whether new entries are allowed at this level.
    pub fn entries_allowed(&self) -> bool {
        *self < BreakerLevel::Caution
    }

    /// Whether closing flows (rebalance, settlement) are allowed.
    pub fn closing_allowed(&self) -> bool {
        *self < BreakerLevel::Halt
    }
}

impl std::fmt::Display for BreakerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Escalation thresholds.
#[derive(Debug, Clone)]
pub struct BreakerThresholds {
    pub warn_failures: u32,
    pub caution_failures: u32,
    pub halt_failures: u32,
    pub warn_loss: Decimal,
    pub caution_loss: Decimal,
    pub halt_loss: Decimal,
    /// Hour (UTC) the day bucket rolls over.
    pub daily_reset_hour_utc: u32,
}

impl From<&BreakerSettings> for BreakerThresholds {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            warn_failures: s.warn_failures,
            caution_failures: s.caution_failures,
            halt_failures: s.halt_failures,
            warn_loss: s.warn_loss_usd,
            caution_loss: s.caution_loss_usd,
            halt_loss: s.halt_loss_usd,
            daily_reset_hour_utc: s.daily_reset_hour_utc,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerInner {
    level: BreakerLevel,
    consecutive_failures: u32,
    daily_pnl: Decimal,
    day: NaiveDate,
}

/// Mutex-guarded breaker state; level transitions are the only mutation.
#[derive(Debug)]
pub struct CircuitBreaker {
    thresholds: BreakerThresholds,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(thresholds: BreakerThresholds, now: DateTime<Utc>) -> Self {
        let day = Self::day_bucket(&thresholds, now);
        Self {
            thresholds,
            inner: Mutex::new(BreakerInner {
                level: BreakerLevel::Normal,
                consecutive_failures: 0,
                daily_pnl: Decimal::ZERO,
                day,
            }),
        }
    }

    fn day_bucket(thresholds: &BreakerThresholds, now: DateTime<Utc>) -> NaiveDate {
        (now - chrono::Duration::hours(thresholds.daily_reset_hour_utc as i64)).date_naive()
    }

    /// Current level.
    pub fn level(&self) -> BreakerLevel {
        self.inner.lock().level
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Today's realized P&L.
    pub fn daily_pnl(&self) -> Decimal {
        self.inner.lock().daily_pnl
    }

    /// Level implied by a set of counters (ignoring monotonicity).
    fn implied_level(&self, failures: u32, pnl: Decimal) -> BreakerLevel {
        let t = &self.thresholds;
        let by_failures = if failures >= t.halt_failures {
            BreakerLevel::Halt
        } else if failures >= t.caution_failures {
            BreakerLevel::Caution
        } else if failures >= t.warn_failures {
            BreakerLevel::Warning
        } else {
            BreakerLevel::Normal
        };
        let by_loss = if pnl <= -t.halt_loss {
            BreakerLevel::Halt
        } else if pnl <= -t.caution_loss {
            BreakerLevel::Caution
        } else if pnl <= -t.warn_loss {
            BreakerLevel::Warning
        } else {
            BreakerLevel::Normal
        };
        by_failures.max(by_loss)
    }

    fn roll_day(&self, inner: &mut BreakerInner, now: DateTime<Utc>) -> bool {
        let bucket = Self::day_bucket(&self.thresholds, now);
        if bucket != inner.day {
            info!(
                previous_pnl = %inner.daily_pnl,
                previous_level = %inner.level,
                "Circuit breaker daily reset"
            );
            *inner = BreakerInner {
                level: BreakerLevel::Normal,
                consecutive_failures: 0,
                daily_pnl: Decimal::ZERO,
                day: bucket,
            };
            true
        } else {
            false
        }
    }

    fn escalate(&self, inner: &mut BreakerInner) -> Option<BreakerLevel> {
        let implied = self.implied_level(inner.consecutive_failures, inner.daily_pnl);
        if implied > inner.level {
            warn!(
                from = %inner.level,
                to = %implied,
                failures = inner.consecutive_failures,
                daily_pnl = %inner.daily_pnl,
                "Circuit breaker escalated"
            );
            inner.level = implied;
            Some(implied)
        } else {
            None
        }
    }

    /// Record an execution failure. Returns the new level if escalated.
    pub fn record_failure(&self, now: DateTime<Utc>) -> Option<BreakerLevel> {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner, now);
        inner.consecutive_failures += 1;
        self.escalate(&mut inner)
    }

    /// Record a fully successful execution: clears the failure streak but
    /// never de-escalates the level on its own.
    pub fn record_success(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner, now);
        inner.consecutive_failures = 0;
    }

    /// Record realized P&L. Returns the new level if escalated.
    pub fn record_pnl(&self, pnl: Decimal, now: DateTime<Utc>) -> Option<BreakerLevel> {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner, now);
        inner.daily_pnl += pnl;
        self.escalate(&mut inner)
    }

    /// Roll the day bucket if the reset boundary has passed.
    pub fn maybe_daily_reset(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        self.roll_day(&mut inner, now)
    }

    /// Snapshot for persistence.
    pub fn snapshot(&self, now: DateTime<Utc>) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            day: inner.day,
            level: inner.level,
            consecutive_failures: inner.consecutive_failures,
            daily_pnl: inner.daily_pnl,
            updated_at: now,
        }
    }

    /// Restore a persisted snapshot; ignored if it belongs to an older day.
    pub fn restore(&self, snap: &CircuitBreakerSnapshot, now: DateTime<Utc>) -> bool {
        let bucket = Self::day_bucket(&self.thresholds, now);
        if snap.day != bucket {
            return false;
        }
        let mut inner = self.inner.lock();
        inner.level = snap.level;
        inner.consecutive_failures = snap.consecutive_failures;
        inner.daily_pnl = snap.daily_pnl;
        inner.day = snap.day;
        info!(level = %snap.level, daily_pnl = %snap.daily_pnl, "Circuit breaker restored");
        true
    }
}
