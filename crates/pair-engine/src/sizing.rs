//! Equal-share pair sizing.
//!
//! The arbitrage pays `num_pairs * spread`, so both legs carry the same
//! share count; the budget splits unevenly across the legs (more USD on
//! the pricier side). Share counts are quantized to two decimal places by
//! truncation, and each side's consumption is capped to a fraction of the
//! displayed depth at the limit price.

use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::debug;

use pair_common::Order;
use pair_market::MarketState;

use crate::config::TradingConfig;
use crate::detector::Opportunity;

/// Share quantization: two decimal places, truncated.
fn quantize(shares: Decimal) -> Decimal {
    shares.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// One dual-leg order at matched share counts.
#[derive(Debug, Clone)]
pub struct OrderPair {
    pub num_pairs: Decimal,
    pub yes: Order,
    pub no: Order,
}

impl OrderPair {
    /// Total USD cost of both legs at their limit prices.
    pub fn total_cost(&self) -> Decimal {
        self.yes.notional() + self.no.notional()
    }
}

/// A sized entry: one pair, or several tranches executed with a delay.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub tranches: Vec<OrderPair>,
    /// Delay between tranches (zero for single entries).
    pub tranche_delay: Duration,
}

impl EntryPlan {
    pub fn total_pairs(&self) -> Decimal {
        self.tranches.iter().map(|t| t.num_pairs).sum()
    }

    pub fn total_cost(&self) -> Decimal {
        self.tranches.iter().map(|t| t.total_cost()).sum()
    }
}

/// Why sizing declined the opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SizingSkip {
    /// After the liquidity cap, a leg would fall below the minimum notional.
    InsufficientLiquidity { per_leg_usd: Decimal },
    /// The pair cost leaves no room for profit.
    InvalidPrices,
}

impl std::fmt::Display for SizingSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizingSkip::InsufficientLiquidity { per_leg_usd } => {
                write!(f, "INSUFFICIENT_LIQUIDITY(${per_leg_usd})")
            }
            SizingSkip::InvalidPrices => write!(f, "INVALID_PRICES"),
        }
    }
}

/// Sizing parameters.
#[derive(Debug, Clone)]
pub struct SizerConfig {
    pub min_trade_size_usd: Decimal,
    pub max_liquidity_consumption_pct: Decimal,
    pub gradual_enabled: bool,
    pub gradual_tranches: u32,
    pub gradual_delay: Duration,
    pub gradual_min_spread_cents: Decimal,
}

impl From<&TradingConfig> for SizerConfig {
    fn from(t: &TradingConfig) -> Self {
        Self {
            min_trade_size_usd: t.min_trade_size_usd,
            max_liquidity_consumption_pct: t.max_liquidity_consumption_pct,
            gradual_enabled: t.gradual_entry.enabled,
            gradual_tranches: t.gradual_entry.tranches.max(1),
            gradual_delay: Duration::from_secs(t.gradual_entry.delay_secs),
            gradual_min_spread_cents: t.gradual_entry.min_spread_cents,
        }
    }
}

/// Computes equal-share budgets from price, budget and book depth.
pub struct Sizer {
    config: SizerConfig,
}

impl Sizer {
    pub fn new(config: SizerConfig) -> Self {
        Self { config }
    }

    /// Size an admitted opportunity against the current book state.
    pub fn size(
        &self,
        opp: &Opportunity,
        budget: Decimal,
        state: &MarketState,
    ) -> Result<EntryPlan, SizingSkip> {
        let cost_per_pair = opp.yes_ask + opp.no_ask;
        if cost_per_pair <= Decimal::ZERO || cost_per_pair >= Decimal::ONE {
            return Err(SizingSkip::InvalidPrices);
        }

        let mut num_pairs = quantize(budget / cost_per_pair);

        // Cap each side to a fraction of the displayed depth at our price.
        let pct = self.config.max_liquidity_consumption_pct;
        let yes_cap = quantize(state.yes_book.ask_depth_at_or_below(opp.yes_ask) * pct);
        let no_cap = quantize(state.no_book.ask_depth_at_or_below(opp.no_ask) * pct);
        num_pairs = num_pairs.min(yes_cap).min(no_cap);

        let yes_amount = num_pairs * opp.yes_ask;
        let no_amount = num_pairs * opp.no_ask;
        let per_leg = yes_amount.min(no_amount);
        if num_pairs <= Decimal::ZERO || per_leg < self.config.min_trade_size_usd {
            debug!(
                condition_id = %opp.market.condition_id,
                num_pairs = %num_pairs,
                per_leg = %per_leg,
                "Sizing skipped: insufficient liquidity"
            );
            return Err(SizingSkip::InsufficientLiquidity {
                per_leg_usd: per_leg,
            });
        }

        let tranche_counts = self.split_tranches(opp, num_pairs);
        let tranches = tranche_counts
            .into_iter()
            .map(|pairs| OrderPair {
                num_pairs: pairs,
                yes: Order::fok_buy(&opp.market.yes_token_id, opp.yes_ask, pairs),
                no: Order::fok_buy(&opp.market.no_token_id, opp.no_ask, pairs),
            })
            .collect::<Vec<_>>();

        let tranche_delay = if tranches.len() > 1 {
            self.config.gradual_delay
        } else {
            Duration::ZERO
        };

        Ok(EntryPlan {
            tranches,
            tranche_delay,
        })
    }

    /// Split the pair count into tranches when gradual entry applies.
    fn split_tranches(&self, opp: &Opportunity, num_pairs: Decimal) -> Vec<Decimal> {
        let n = self.config.gradual_tranches;
        if !self.config.gradual_enabled
            || n <= 1
            || opp.spread_cents < self.config.gradual_min_spread_cents
        {
            return vec![num_pairs];
        }

        let base = quantize(num_pairs / Decimal::from(n));
        if base.is_zero() {
            return vec![num_pairs];
        }
        let mut tranches = vec![base; (n - 1) as usize];
        tranches.push(num_pairs - base * Decimal::from(n - 1));
        tranches.retain(|t| *t > Decimal::ZERO);
        tranches
    }
}
