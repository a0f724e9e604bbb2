//! Opportunity detection.
//!
//! Consumes book updates and emits an [`Opportunity`] whenever the YES and
//! NO asks sum to strictly less than $1.00 by at least the configured
//! spread. Stateless across markets except for a per-(market, revision)
//! limiter that prevents re-emitting the same book state downstream.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;

use pair_common::SlotMarket;
use pair_market::MarketState;

/// A detected two-sided arbitrage candidate. Ephemeral; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub market: SlotMarket,
    /// Best YES ask at detection.
    pub yes_ask: Decimal,
    /// Best NO ask at detection.
    pub no_ask: Decimal,
    pub detected_at: DateTime<Utc>,
    /// `(1 - yes_ask - no_ask) * 100`.
    pub spread_cents: Decimal,
}

impl Opportunity {
    /// Spread in dollars.
    pub fn spread(&self) -> Decimal {
        self.spread_cents / Decimal::ONE_HUNDRED
    }

    /// Cost of one YES+NO pair.
    pub fn cost_per_pair(&self) -> Decimal {
        self.yes_ask + self.no_ask
    }
}

/// Why a book update produced no opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSkip {
    /// Book older than the staleness threshold.
    Stale,
    /// One or both sides missing an ask.
    NoQuotes,
    /// Spread below the minimum.
    BelowThreshold,
    /// This (market, revision) was already emitted.
    AlreadyEmitted,
}

/// Spread detector over tracked market states.
pub struct OpportunityDetector {
    min_spread: Decimal,
    stale_threshold: Duration,
    /// condition_id -> last emitted revision.
    last_emitted: DashMap<String, u64>,
}

impl OpportunityDetector {
    pub fn new(min_spread: Decimal, stale_threshold: Duration) -> Self {
        Self {
            min_spread,
            stale_threshold,
            last_emitted: DashMap::new(),
        }
    }

    /// Evaluate a market state at `now`.
    pub fn evaluate(
        &self,
        state: &MarketState,
        now: DateTime<Utc>,
    ) -> Result<Opportunity, DetectorSkip> {
        if state.is_stale(now, self.stale_threshold) {
            return Err(DetectorSkip::Stale);
        }

        let (Some(yes_ask), Some(no_ask)) = (state.yes_ask(), state.no_ask()) else {
            return Err(DetectorSkip::NoQuotes);
        };

        let spread = Decimal::ONE - yes_ask - no_ask;
        if spread < self.min_spread {
            return Err(DetectorSkip::BelowThreshold);
        }

        // At most one emission per book revision.
        let condition_id = &state.market.condition_id;
        if let Some(prev) = self.last_emitted.get(condition_id) {
            if *prev >= state.revision {
                return Err(DetectorSkip::AlreadyEmitted);
            }
        }
        self.last_emitted
            .insert(condition_id.clone(), state.revision);

        Ok(Opportunity {
            market: state.market.clone(),
            yes_ask,
            no_ask,
            detected_at: now,
            spread_cents: spread * Decimal::ONE_HUNDRED,
        })
    }

    /// Forget a market (after expiry).
    pub fn forget(&self, condition_id: &str) {
        self.last_emitted.remove(condition_id);
    }
}
