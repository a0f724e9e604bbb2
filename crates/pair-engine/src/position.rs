//! Position lifecycle and rebalancing policy.
//!
//! `PositionManager` exclusively owns `ActivePosition` mutation. Positions
//! are created from executor fills, mutated by rebalance fills applied
//! through [`PositionManager::apply_fill`], and closed when every
//! settlement row is claimed or abandoned (or, for dry runs, when the
//! market resolves).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use pair_common::{Outcome, Side, SlotMarket};
use pair_market::MarketState;

use crate::config::RebalanceSettings;
use crate::store::TradeRecord;

/// An open YES/NO pair position bound to one market.
#[derive(Debug, Clone)]
pub struct ActivePosition {
    pub trade_id: String,
    pub market: SlotMarket,
    pub yes_shares: Decimal,
    pub no_shares: Decimal,
    /// Weighted average entry prices.
    pub yes_avg_cost: Decimal,
    pub no_avg_cost: Decimal,
    /// Budget admitted for the entry; rebalance buys spend from what
    /// remains of it.
    pub original_budget: Decimal,
    pub created_at: DateTime<Utc>,
    pub rebalance_attempts: u32,
    pub dry_run: bool,
    /// Token ids still awaiting claim (empty for dry runs).
    pending_claims: HashSet<String>,
}

impl ActivePosition {
    /// `min(yes, no) / max(yes, no)`; 0 when one side is empty.
    pub fn hedge_ratio(&self) -> Decimal {
        let max = self.yes_shares.max(self.no_shares);
        if max.is_zero() {
            return Decimal::ZERO;
        }
        self.yes_shares.min(self.no_shares) / max
    }

    /// Balanced at or above the threshold (boundary counts as balanced).
    pub fn is_balanced(&self, threshold: Decimal) -> bool {
        self.hedge_ratio() >= threshold
    }

    /// The side holding more shares.
    pub fn excess_outcome(&self) -> Outcome {
        if self.yes_shares > self.no_shares {
            Outcome::Yes
        } else {
            Outcome::No
        }
    }

    /// Share imbalance between the sides.
    pub fn excess_shares(&self) -> Decimal {
        (self.yes_shares - self.no_shares).abs()
    }

    /// Total cost basis of the position.
    pub fn total_cost(&self) -> Decimal {
        self.yes_shares * self.yes_avg_cost + self.no_shares * self.no_avg_cost
    }

    /// Guaranteed $1.00-per-pair payout at resolution.
    pub fn guaranteed_return(&self) -> Decimal {
        self.yes_shares.min(self.no_shares)
    }

    /// Expected profit from the hedged part of the position.
    pub fn expected_profit(&self) -> Decimal {
        self.guaranteed_return() - self.total_cost()
    }

    /// Capacity left from the entry budget for rebalance buys. Sells free
    /// capacity back up; buys consume it.
    pub fn remaining_budget(&self) -> Decimal {
        (self.original_budget - self.total_cost()).max(Decimal::ZERO)
    }

    /// Seconds until the market resolves.
    pub fn seconds_to_resolution(&self, now: DateTime<Utc>) -> i64 {
        (self.market.window_end - now).num_seconds()
    }

    /// Rebuild a position from durable settlement rows (startup recovery).
    #[allow(clippy::too_many_arguments)]
    pub fn restored(
        trade_id: impl Into<String>,
        market: SlotMarket,
        yes_shares: Decimal,
        no_shares: Decimal,
        yes_avg_cost: Decimal,
        no_avg_cost: Decimal,
        original_budget: Decimal,
        created_at: DateTime<Utc>,
        pending_claims: HashSet<String>,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            market,
            yes_shares,
            no_shares,
            yes_avg_cost,
            no_avg_cost,
            original_budget,
            created_at,
            rebalance_attempts: 0,
            dry_run: false,
            pending_claims,
        }
    }

    fn shares(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_shares,
            Outcome::No => self.no_shares,
        }
    }

    fn avg_cost(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_avg_cost,
            Outcome::No => self.no_avg_cost,
        }
    }
}

/// A rebalancing action on one side of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebalanceAction {
    SellYes,
    SellNo,
    BuyYes,
    BuyNo,
}

impl RebalanceAction {
    pub fn outcome(&self) -> Outcome {
        match self {
            RebalanceAction::SellYes | RebalanceAction::BuyYes => Outcome::Yes,
            RebalanceAction::SellNo | RebalanceAction::BuyNo => Outcome::No,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            RebalanceAction::SellYes | RebalanceAction::SellNo => Side::Sell,
            RebalanceAction::BuyYes | RebalanceAction::BuyNo => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceAction::SellYes => "SELL_YES",
            RebalanceAction::SellNo => "SELL_NO",
            RebalanceAction::BuyYes => "BUY_YES",
            RebalanceAction::BuyNo => "BUY_NO",
        }
    }
}

impl std::fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A candidate rebalancing trade.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceOption {
    pub action: RebalanceAction,
    pub shares: Decimal,
    pub price: Decimal,
    /// Expected profit / improvement from this action.
    pub profit: Decimal,
}

impl RebalanceOption {
    pub fn profit_per_share(&self) -> Decimal {
        if self.shares.is_zero() {
            Decimal::ZERO
        } else {
            self.profit / self.shares
        }
    }
}

/// Result of applying a rebalance fill.
#[derive(Debug, Clone)]
pub struct AppliedFill {
    /// Realized profit (sells only; zero for buys).
    pub realized_profit: Decimal,
    pub hedge_ratio: Decimal,
    pub balanced: bool,
}

/// Owns all open positions; at most one per market.
pub struct PositionManager {
    config: RebalanceSettings,
    positions: Mutex<HashMap<String, ActivePosition>>,
}

impl PositionManager {
    pub fn new(config: RebalanceSettings) -> Self {
        Self {
            config,
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a position from an execution fill. One per market; fills
    /// from later tranches of the same entry accumulate into it. `budget`
    /// is the admitted entry budget and bounds later rebalance buys.
    pub fn open_from_trade(&self, trade: &TradeRecord, market: SlotMarket, budget: Decimal) {
        let mut positions = self.positions.lock();

        if let Some(position) = positions.get_mut(&trade.condition_id) {
            if trade.yes_shares > Decimal::ZERO {
                let total = position.yes_shares * position.yes_avg_cost + trade.yes_cost;
                position.yes_shares += trade.yes_shares;
                position.yes_avg_cost = total / position.yes_shares;
                if !trade.dry_run {
                    position.pending_claims.insert(trade.yes_token_id.clone());
                }
            }
            if trade.no_shares > Decimal::ZERO {
                let total = position.no_shares * position.no_avg_cost + trade.no_cost;
                position.no_shares += trade.no_shares;
                position.no_avg_cost = total / position.no_shares;
                if !trade.dry_run {
                    position.pending_claims.insert(trade.no_token_id.clone());
                }
            }
            debug!(
                trade_id = %trade.trade_id,
                condition_id = %trade.condition_id,
                yes_shares = %position.yes_shares,
                no_shares = %position.no_shares,
                "Tranche fill added to position"
            );
            return;
        }

        let mut pending = HashSet::new();
        if !trade.dry_run {
            if trade.yes_shares > Decimal::ZERO {
                pending.insert(trade.yes_token_id.clone());
            }
            if trade.no_shares > Decimal::ZERO {
                pending.insert(trade.no_token_id.clone());
            }
        }
        let position = ActivePosition {
            trade_id: trade.trade_id.clone(),
            market,
            yes_shares: trade.yes_shares,
            no_shares: trade.no_shares,
            yes_avg_cost: trade.yes_price,
            no_avg_cost: trade.no_price,
            original_budget: budget,
            created_at: trade.created_at,
            rebalance_attempts: 0,
            dry_run: trade.dry_run,
            pending_claims: pending,
        };
        info!(
            trade_id = %position.trade_id,
            condition_id = %trade.condition_id,
            yes_shares = %position.yes_shares,
            no_shares = %position.no_shares,
            hedge_ratio = %position.hedge_ratio(),
            budget = %budget,
            "Position opened"
        );
        positions.insert(trade.condition_id.clone(), position);
    }

    /// Re-insert a recovered position.
    pub fn restore(&self, position: ActivePosition) {
        info!(
            trade_id = %position.trade_id,
            condition_id = %position.market.condition_id,
            yes_shares = %position.yes_shares,
            no_shares = %position.no_shares,
            "Position restored"
        );
        self.positions
            .lock()
            .insert(position.market.condition_id.clone(), position);
    }

    /// Whether a market already has an open position.
    pub fn has_position(&self, condition_id: &str) -> bool {
        self.positions.lock().contains_key(condition_id)
    }

    /// Snapshot of one position.
    pub fn get(&self, condition_id: &str) -> Option<ActivePosition> {
        self.positions.lock().get(condition_id).cloned()
    }

    /// Number of open positions.
    pub fn len(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.lock().is_empty()
    }

    /// Positions below the hedge-ratio threshold, keyed by condition id.
    pub fn imbalanced(&self) -> Vec<(String, ActivePosition)> {
        self.positions
            .lock()
            .iter()
            .filter(|(_, p)| !p.is_balanced(self.config.threshold))
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    /// Count a rebalance attempt against a position's cap.
    pub fn record_attempt(&self, condition_id: &str) {
        if let Some(p) = self.positions.lock().get_mut(condition_id) {
            p.rebalance_attempts += 1;
        }
    }

    /// Viable rebalance options for a position at current prices.
    ///
    /// Sell-excess locks in profit when the bid clears average cost by the
    /// profit floor; buy-deficit must improve the guaranteed return and
    /// keep the blended entry spread above the floor.
    pub fn options_for(
        &self,
        position: &ActivePosition,
        state: &MarketState,
    ) -> Vec<RebalanceOption> {
        let mut options = Vec::new();
        let excess = position.excess_shares();
        if excess.is_zero() {
            return options;
        }

        let heavy = position.excess_outcome();
        let light = heavy.opposite();

        // Option A: sell the excess on the heavy side at the bid.
        if let Some(bid) = state.book(heavy).best_bid() {
            let avg = position.avg_cost(heavy);
            if bid > avg {
                options.push(RebalanceOption {
                    action: match heavy {
                        Outcome::Yes => RebalanceAction::SellYes,
                        Outcome::No => RebalanceAction::SellNo,
                    },
                    shares: excess,
                    price: bid,
                    profit: excess * (bid - avg),
                });
            }
        }

        // Option B: buy the deficit side at the ask, within what remains
        // of the entry budget. The hedged payout after the purchase must
        // itself be positive, and the option's profit is the improvement
        // over the current expected profit.
        if let Some(ask) = state.book(light).best_ask() {
            if ask > Decimal::ZERO && ask < Decimal::ONE {
                let max_affordable = position.remaining_budget() / ask;
                let shares_to_buy = excess.min(max_affordable);
                if shares_to_buy > Decimal::ZERO {
                    let buy_cost = shares_to_buy * ask;
                    let new_min = position
                        .shares(heavy)
                        .min(position.shares(light) + shares_to_buy);
                    let new_profit = new_min - (position.total_cost() + buy_cost);
                    let improvement = new_profit - position.expected_profit();
                    if new_profit > Decimal::ZERO && improvement > Decimal::ZERO {
                        options.push(RebalanceOption {
                            action: match light {
                                Outcome::Yes => RebalanceAction::BuyYes,
                                Outcome::No => RebalanceAction::BuyNo,
                            },
                            shares: shares_to_buy,
                            price: ask,
                            profit: improvement,
                        });
                    }
                }
            }
        }

        options
    }

    /// Pick the best option: profit floor applied, sells preferred.
    pub fn select_option(&self, options: Vec<RebalanceOption>) -> Option<RebalanceOption> {
        let viable: Vec<_> = options
            .into_iter()
            .filter(|o| o.profit_per_share() >= self.config.min_profit_per_share)
            .collect();
        if viable.is_empty() {
            return None;
        }

        let best_sell = viable
            .iter()
            .filter(|o| o.action.side() == Side::Sell)
            .max_by(|a, b| a.profit.cmp(&b.profit))
            .cloned();
        if best_sell.is_some() {
            return best_sell;
        }
        viable.into_iter().max_by(|a, b| a.profit.cmp(&b.profit))
    }

    /// Final check before executing an option: partial sizing must be
    /// allowed when the option covers less than the full imbalance, and a
    /// buy must keep the blended entry spread above the floor.
    pub fn should_execute(&self, position: &ActivePosition, option: &RebalanceOption) -> bool {
        if !self.config.allow_partial_rebalance && option.shares < position.excess_shares() {
            debug!(
                action = %option.action,
                shares = %option.shares,
                excess = %position.excess_shares(),
                "Rebalance rejected: partial sizing disabled"
            );
            return false;
        }
        if option.action.side() != Side::Buy {
            return true;
        }
        let outcome = option.action.outcome();
        let old_shares = position.shares(outcome);
        let new_shares = old_shares + option.shares;
        if new_shares.is_zero() {
            return false;
        }
        let blended =
            (old_shares * position.avg_cost(outcome) + option.shares * option.price) / new_shares;
        let other_avg = position.avg_cost(outcome.opposite());
        let new_spread = Decimal::ONE - blended - other_avg;
        if new_spread < self.config.min_spread_usd {
            debug!(
                action = %option.action,
                new_spread = %new_spread,
                "Rebalance buy rejected: spread floor"
            );
            return false;
        }
        true
    }

    /// Whether a position may be rebalanced right now.
    pub fn may_rebalance(&self, position: &ActivePosition, now: DateTime<Utc>) -> bool {
        if position.dry_run {
            return false;
        }
        if position.rebalance_attempts >= self.config.max_attempts {
            return false;
        }
        position.seconds_to_resolution(now) >= self.config.no_go_secs_before_end as i64
    }

    /// Apply a rebalance fill to the position. Returns the realized profit
    /// (sells) and the new balance state; `None` if the market is unknown.
    pub fn apply_fill(
        &self,
        condition_id: &str,
        action: RebalanceAction,
        filled_shares: Decimal,
        price: Decimal,
    ) -> Option<AppliedFill> {
        let mut positions = self.positions.lock();
        let position = positions.get_mut(condition_id)?;
        let outcome = action.outcome();

        let realized_profit = match action.side() {
            Side::Sell => {
                let avg = position.avg_cost(outcome);
                match outcome {
                    Outcome::Yes => position.yes_shares -= filled_shares,
                    Outcome::No => position.no_shares -= filled_shares,
                }
                (price - avg) * filled_shares
            }
            Side::Buy => {
                match outcome {
                    Outcome::Yes => {
                        let total =
                            position.yes_shares * position.yes_avg_cost + filled_shares * price;
                        position.yes_shares += filled_shares;
                        position.yes_avg_cost = total / position.yes_shares;
                    }
                    Outcome::No => {
                        let total =
                            position.no_shares * position.no_avg_cost + filled_shares * price;
                        position.no_shares += filled_shares;
                        position.no_avg_cost = total / position.no_shares;
                    }
                }
                Decimal::ZERO
            }
        };

        let hedge_ratio = position.hedge_ratio();
        let balanced = position.is_balanced(self.config.threshold);
        debug!(
            condition_id = %condition_id,
            action = %action,
            filled = %filled_shares,
            hedge_ratio = %hedge_ratio,
            "Rebalance fill applied"
        );
        Some(AppliedFill {
            realized_profit,
            hedge_ratio,
            balanced,
        })
    }

    /// Mark one settlement row resolved (claimed or abandoned); the
    /// position closes when no rows remain pending.
    pub fn settlement_resolved(&self, condition_id: &str, token_id: &str) {
        let mut positions = self.positions.lock();
        let closed = if let Some(position) = positions.get_mut(condition_id) {
            position.pending_claims.remove(token_id);
            position.pending_claims.is_empty()
        } else {
            false
        };
        if closed {
            if let Some(position) = positions.remove(condition_id) {
                info!(
                    trade_id = %position.trade_id,
                    condition_id = %condition_id,
                    "Position closed"
                );
            }
        }
    }

    /// Drop positions whose markets resolved with nothing left to claim
    /// (dry runs). Returns the condition ids pruned.
    pub fn prune_resolved(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut positions = self.positions.lock();
        let mut pruned = Vec::new();
        positions.retain(|cid, p| {
            if p.pending_claims.is_empty() && p.market.is_expired(now) {
                pruned.push(cid.clone());
                false
            } else {
                true
            }
        });
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pair_common::{CryptoAsset, OrderBookLevel};
    use rust_decimal_macros::dec;

    use crate::store::ExecutionStatus;

    fn market() -> SlotMarket {
        let (start, end) = SlotMarket::window_for_end(1_700_000_100);
        SlotMarket {
            condition_id: "m1".to_string(),
            slug: SlotMarket::slug_for(CryptoAsset::Btc, 1_700_000_100),
            asset: CryptoAsset::Btc,
            yes_token_id: "m1-yes".to_string(),
            no_token_id: "m1-no".to_string(),
            window_start: start,
            window_end: end,
        }
    }

    fn trade(yes_shares: Decimal, no_shares: Decimal, dry_run: bool) -> TradeRecord {
        TradeRecord {
            trade_id: "t-1".to_string(),
            created_at: Utc::now(),
            condition_id: "m1".to_string(),
            asset: CryptoAsset::Btc,
            market_slug: "btc-updown-15m-1700000100".to_string(),
            market_end_time: market().window_end,
            yes_token_id: "m1-yes".to_string(),
            no_token_id: "m1-no".to_string(),
            yes_price: dec!(0.40),
            no_price: dec!(0.58),
            intended_shares: dec!(20),
            yes_shares,
            no_shares,
            intended_cost: dec!(19.60),
            yes_cost: yes_shares * dec!(0.40),
            no_cost: no_shares * dec!(0.58),
            spread_cents: dec!(2),
            execution_status: ExecutionStatus::OneLegOnly,
            yes_order_status: "MATCHED".to_string(),
            no_order_status: "FAILED".to_string(),
            hedge_ratio: TradeRecord::hedge_ratio_of(yes_shares, no_shares),
            yes_liquidity_at_price: dec!(100),
            no_liquidity_at_price: dec!(100),
            yes_book_depth_total: dec!(500),
            no_book_depth_total: dec!(500),
            dry_run,
        }
    }

    fn manager() -> PositionManager {
        PositionManager::new(RebalanceSettings::default())
    }

    fn state_with(yes_bid: Decimal, yes_ask: Decimal, no_bid: Decimal, no_ask: Decimal) -> MarketState {
        let mut state = MarketState::new(market());
        state.yes_book.apply_snapshot(
            vec![OrderBookLevel::new(yes_bid, dec!(100))],
            vec![OrderBookLevel::new(yes_ask, dec!(100))],
        );
        state.no_book.apply_snapshot(
            vec![OrderBookLevel::new(no_bid, dec!(100))],
            vec![OrderBookLevel::new(no_ask, dec!(100))],
        );
        state.last_update = Some(Utc::now());
        state.revision = 1;
        state
    }

    #[test]
    fn test_hedge_ratio_boundaries() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();
        assert_eq!(p.hedge_ratio(), dec!(0));
        assert!(!p.is_balanced(dec!(0.80)));

        // Exactly at the threshold counts as balanced.
        let pm2 = manager();
        pm2.open_from_trade(&trade(dec!(20), dec!(16), false), market(), dec!(25));
        let p2 = pm2.get("m1").unwrap();
        assert_eq!(p2.hedge_ratio(), dec!(0.8));
        assert!(p2.is_balanced(dec!(0.80)));
        assert!(pm2.imbalanced().is_empty());
    }

    #[test]
    fn test_imbalanced_scan() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let imbalanced = pm.imbalanced();
        assert_eq!(imbalanced.len(), 1);
        assert_eq!(imbalanced[0].0, "m1");
    }

    #[test]
    fn test_sell_excess_option() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();

        // YES bid 0.45 clears the 0.40 avg cost.
        let state = state_with(dec!(0.45), dec!(0.46), dec!(0.53), dec!(0.99));
        let options = pm.options_for(&p, &state);
        let sell = options
            .iter()
            .find(|o| o.action == RebalanceAction::SellYes)
            .unwrap();
        assert_eq!(sell.shares, dec!(20));
        assert_eq!(sell.price, dec!(0.45));
        assert_eq!(sell.profit, dec!(1.00));
        assert_eq!(sell.profit_per_share(), dec!(0.05));
    }

    #[test]
    fn test_buy_deficit_option_profitable() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();

        // NO ask 0.50: buying 20 NO costs $10; guaranteed return becomes
        // $20 against total cost $8 + $10 = $18, so the hedged payout is
        // +$2 and the improvement over the unhedged -$8 is $10.
        let state = state_with(dec!(0.39), dec!(0.46), dec!(0.49), dec!(0.50));
        let options = pm.options_for(&p, &state);
        let buy = options
            .iter()
            .find(|o| o.action == RebalanceAction::BuyNo)
            .unwrap();
        assert_eq!(buy.shares, dec!(20));
        assert_eq!(buy.profit, dec!(10.00));
    }

    #[test]
    fn test_buy_deficit_rejected_when_hedge_stays_negative() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();

        // NO ask 0.62: 20 - (8 + 12.40) < 0, the hedge would lock a loss.
        let state = state_with(dec!(0.39), dec!(0.46), dec!(0.61), dec!(0.62));
        let options = pm.options_for(&p, &state);
        assert!(options
            .iter()
            .all(|o| o.action != RebalanceAction::BuyNo));
    }

    #[test]
    fn test_buy_deficit_capped_by_remaining_budget() {
        let pm = manager();
        // $17 budget with $8 already spent leaves $9; at a $0.50 ask that
        // affords 18 of the 20 deficit shares.
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(17));
        let p = pm.get("m1").unwrap();
        assert_eq!(p.remaining_budget(), dec!(9.00));

        let state = state_with(dec!(0.39), dec!(0.46), dec!(0.49), dec!(0.50));
        let options = pm.options_for(&p, &state);
        let buy = options
            .iter()
            .find(|o| o.action == RebalanceAction::BuyNo)
            .unwrap();
        assert_eq!(buy.shares, dec!(18));
        // min(20, 18) = 18 pairs against $17 total cost.
        assert_eq!(buy.profit, dec!(9.00));
    }

    #[test]
    fn test_buy_deficit_skipped_when_budget_exhausted() {
        let pm = manager();
        // The entry consumed the whole budget; nothing left to buy with.
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(8));
        let p = pm.get("m1").unwrap();
        assert_eq!(p.remaining_budget(), dec!(0));

        let state = state_with(dec!(0.39), dec!(0.46), dec!(0.49), dec!(0.50));
        let options = pm.options_for(&p, &state);
        assert!(options
            .iter()
            .all(|o| o.action != RebalanceAction::BuyNo));
    }

    #[test]
    fn test_select_prefers_sell() {
        let pm = manager();
        let options = vec![
            RebalanceOption {
                action: RebalanceAction::BuyNo,
                shares: dec!(20),
                price: dec!(0.50),
                profit: dec!(3.00),
            },
            RebalanceOption {
                action: RebalanceAction::SellYes,
                shares: dec!(20),
                price: dec!(0.45),
                profit: dec!(1.00),
            },
        ];
        let chosen = pm.select_option(options).unwrap();
        assert_eq!(chosen.action, RebalanceAction::SellYes);
    }

    #[test]
    fn test_select_applies_profit_floor() {
        let pm = manager();
        // $0.01 per share is below the $0.02 floor.
        let options = vec![RebalanceOption {
            action: RebalanceAction::SellYes,
            shares: dec!(20),
            price: dec!(0.41),
            profit: dec!(0.20),
        }];
        assert!(pm.select_option(options).is_none());
    }

    #[test]
    fn test_should_execute_blocks_thin_buys() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();

        // Buying NO at 0.59 blends to 1 - 0.40 - 0.59 = 0.01 < 0.02 floor.
        let thin = RebalanceOption {
            action: RebalanceAction::BuyNo,
            shares: dec!(20),
            price: dec!(0.59),
            profit: dec!(1.00),
        };
        assert!(!pm.should_execute(&p, &thin));

        // Buying at 0.50 keeps spread 0.10.
        let fine = RebalanceOption {
            action: RebalanceAction::BuyNo,
            shares: dec!(20),
            price: dec!(0.50),
            profit: dec!(2.00),
        };
        assert!(pm.should_execute(&p, &fine));

        // Sells are never spread-guarded.
        let sell = RebalanceOption {
            action: RebalanceAction::SellYes,
            shares: dec!(20),
            price: dec!(0.45),
            profit: dec!(1.00),
        };
        assert!(pm.should_execute(&p, &sell));
    }

    #[test]
    fn test_should_execute_partial_sizing_toggle() {
        let mut config = RebalanceSettings::default();
        config.allow_partial_rebalance = false;
        let pm = PositionManager::new(config);
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();

        // 18 of 20 excess shares is a partial rebalance: blocked.
        let partial = RebalanceOption {
            action: RebalanceAction::BuyNo,
            shares: dec!(18),
            price: dec!(0.50),
            profit: dec!(2.00),
        };
        assert!(!pm.should_execute(&p, &partial));

        // The full imbalance still passes.
        let full = RebalanceOption {
            action: RebalanceAction::BuyNo,
            shares: dec!(20),
            price: dec!(0.50),
            profit: dec!(2.00),
        };
        assert!(pm.should_execute(&p, &full));
    }

    #[test]
    fn test_may_rebalance_rules() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(0), false), market(), dec!(25));
        let p = pm.get("m1").unwrap();

        let early = p.market.window_end - chrono::Duration::seconds(300);
        let late = p.market.window_end - chrono::Duration::seconds(59);
        assert!(pm.may_rebalance(&p, early));
        assert!(!pm.may_rebalance(&p, late));

        // Attempt cap.
        for _ in 0..5 {
            pm.record_attempt("m1");
        }
        let p = pm.get("m1").unwrap();
        assert!(!pm.may_rebalance(&p, early));
    }

    #[test]
    fn test_apply_sell_fill_realizes_profit() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(15), false), market(), dec!(25));

        let applied = pm
            .apply_fill("m1", RebalanceAction::SellYes, dec!(5), dec!(0.45))
            .unwrap();
        assert_eq!(applied.realized_profit, dec!(0.25));
        assert!(applied.balanced);
        let p = pm.get("m1").unwrap();
        assert_eq!(p.yes_shares, dec!(15));
        assert_eq!(p.hedge_ratio(), dec!(1));
    }

    #[test]
    fn test_apply_buy_fill_blends_cost() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(10), false), market(), dec!(25));

        let applied = pm
            .apply_fill("m1", RebalanceAction::BuyNo, dec!(10), dec!(0.60))
            .unwrap();
        assert_eq!(applied.realized_profit, dec!(0));
        let p = pm.get("m1").unwrap();
        assert_eq!(p.no_shares, dec!(20));
        // (10 * 0.58 + 10 * 0.60) / 20 = 0.59
        assert_eq!(p.no_avg_cost, dec!(0.59));
    }

    #[test]
    fn test_settlement_resolution_closes_position() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(20), false), market(), dec!(25));
        assert!(pm.has_position("m1"));

        pm.settlement_resolved("m1", "m1-yes");
        assert!(pm.has_position("m1"));
        pm.settlement_resolved("m1", "m1-no");
        assert!(!pm.has_position("m1"));
    }

    #[test]
    fn test_dry_run_position_pruned_after_expiry() {
        let pm = manager();
        pm.open_from_trade(&trade(dec!(20), dec!(20), true), market(), dec!(25));
        let p = pm.get("m1").unwrap();
        assert!(p.dry_run);
        assert!(!pm.may_rebalance(&p, Utc::now()));

        let after = p.market.window_end + chrono::Duration::seconds(1);
        assert_eq!(pm.prune_resolved(after), vec!["m1".to_string()]);
        assert!(!pm.has_position("m1"));
    }
}
