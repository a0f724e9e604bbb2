//! Admission control for detected opportunities.
//!
//! A pure decision combining blackout, circuit breaker, per-market dedup,
//! per-window budget and arbitrage validity, applied in that order; first
//! match wins. Admission yields the budget the sizer may spend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::config::TradingConfig;
use crate::detector::Opportunity;
use crate::executor::InFlight;
use crate::position::PositionManager;
use crate::risk::{BlackoutWindow, BreakerLevel, CircuitBreaker, WindowLedger};

/// Why an opportunity was rejected. No state changes on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// Inside the scheduled blackout window.
    Blackout,
    /// Circuit breaker blocks entries at this level.
    Halted { level: BreakerLevel },
    /// The market already has an open position or an in-flight execution.
    Duplicate,
    /// The window's cumulative budget is exhausted.
    WindowFull,
    /// `yes_ask + no_ask >= 1`: not an arbitrage.
    InvalidSpread,
    /// The admitted budget would be below two minimum-size legs.
    BudgetTooSmall { budget: Decimal },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Blackout => write!(f, "BLACKOUT"),
            RejectReason::Halted { level } => write!(f, "HALTED({level})"),
            RejectReason::Duplicate => write!(f, "DUPLICATE"),
            RejectReason::WindowFull => write!(f, "WINDOW_FULL"),
            RejectReason::InvalidSpread => write!(f, "INVALID_SPREAD"),
            RejectReason::BudgetTooSmall { budget } => {
                write!(f, "BUDGET_TOO_SMALL(${budget})")
            }
        }
    }
}

/// Successful admission: the budget available for this trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub budget: Decimal,
}

/// Sizing inputs the gate needs from config.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub balance_sizing_pct: Decimal,
    pub max_trade_size_usd: Decimal,
    pub min_trade_size_usd: Decimal,
    pub max_per_window_usd: Decimal,
}

impl From<&TradingConfig> for GateConfig {
    fn from(t: &TradingConfig) -> Self {
        Self {
            balance_sizing_pct: t.balance_sizing_pct,
            max_trade_size_usd: t.max_trade_size_usd,
            min_trade_size_usd: t.min_trade_size_usd,
            max_per_window_usd: t.max_per_window_usd,
        }
    }
}

/// Admission gate.
pub struct RiskGate {
    config: GateConfig,
    blackout: BlackoutWindow,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<WindowLedger>,
    positions: Arc<PositionManager>,
    in_flight: Arc<InFlight>,
}

impl RiskGate {
    pub fn new(
        config: GateConfig,
        blackout: BlackoutWindow,
        breaker: Arc<CircuitBreaker>,
        ledger: Arc<WindowLedger>,
        positions: Arc<PositionManager>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            config,
            blackout,
            breaker,
            ledger,
            positions,
            in_flight,
        }
    }

    /// Decide whether an opportunity may proceed and with what budget.
    pub fn admit(
        &self,
        opp: &Opportunity,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Admission, RejectReason> {
        // 1. Blackout.
        if self.blackout.contains(now) {
            return Err(RejectReason::Blackout);
        }

        // 2. Circuit breaker: CAUTION and above block entries.
        let level = self.breaker.level();
        if !level.entries_allowed() {
            return Err(RejectReason::Halted { level });
        }

        // 3. Per-market dedup: one position and one in-flight execution max.
        let condition_id = &opp.market.condition_id;
        if self.positions.has_position(condition_id) || self.in_flight.contains(condition_id) {
            return Err(RejectReason::Duplicate);
        }

        // 4. Per-window budget.
        let spent = self.ledger.spent(condition_id);
        if spent >= self.config.max_per_window_usd {
            return Err(RejectReason::WindowFull);
        }

        // 5. Arbitrage validity.
        if opp.yes_ask + opp.no_ask >= Decimal::ONE {
            return Err(RejectReason::InvalidSpread);
        }

        // Budget: balance fraction capped per trade, attenuated by the
        // breaker level, then capped to the window's remainder.
        let proposed = (balance * self.config.balance_sizing_pct)
            .min(self.config.max_trade_size_usd)
            * level.size_multiplier();
        let budget = proposed.min(self.config.max_per_window_usd - spent);

        let floor = self.config.min_trade_size_usd * Decimal::TWO;
        if budget < floor {
            return Err(RejectReason::BudgetTooSmall { budget });
        }

        debug!(
            condition_id = %condition_id,
            budget = %budget,
            window_spent = %spent,
            level = %level,
            "Opportunity admitted"
        );
        Ok(Admission { budget })
    }
}
