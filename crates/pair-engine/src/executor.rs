//! Atomic dual-leg execution.
//!
//! Both legs are dispatched in parallel as fill-or-kill orders at exactly
//! the opportunity's prices and awaited jointly under a bounded timeout.
//! Every adapter error is captured as a per-leg outcome value; the joint
//! await always resolves. The trade record (and its settlement rows) is
//! durably written before the result is published.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use pair_common::{Exchange, Order, OrderOutcome, OrderType, Outcome};
use pair_market::MarketState;

use crate::clock::Clock;
use crate::detector::Opportunity;
use crate::events::{EngineEvent, EventSink};
use crate::risk::CircuitBreaker;
use crate::sizing::OrderPair;
use crate::store::{ExecutionStatus, SettlementEntry, Store, StoreError, TradeRecord};

/// Markets with an execution currently in flight.
///
/// The gate consults this for dedup; the executor holds the per-market
/// lock for the duration of a dual-leg placement.
#[derive(Debug, Default)]
pub struct InFlight {
    markets: DashMap<String, ()>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim a market. Returns false if already claimed.
    pub fn try_acquire(&self, condition_id: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.markets.entry(condition_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(());
                true
            }
        }
    }

    pub fn release(&self, condition_id: &str) {
        self.markets.remove(condition_id);
    }

    pub fn contains(&self, condition_id: &str) -> bool {
        self.markets.contains_key(condition_id)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

/// RAII claim on a market's execution slot.
struct InFlightGuard {
    registry: Arc<InFlight>,
    condition_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.condition_id);
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Joint timeout for dual-leg placement.
    pub parallel_fill_timeout: std::time::Duration,
    /// Simulate fills instead of calling the exchange.
    pub dry_run: bool,
}

/// Execution failures that are not leg outcomes.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("market already has an execution in flight")]
    Busy,

    /// The store write failed after placement. The fills are preserved in
    /// the attached record and must not be treated as recorded.
    #[error("store write failed after placement: {source}")]
    Store {
        source: StoreError,
        trade: Box<TradeRecord>,
    },
}

/// Outcome of one dual-leg execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub trade: TradeRecord,
    pub yes_outcome: OrderOutcome,
    pub no_outcome: OrderOutcome,
}

impl ExecutionReport {
    /// Whether any leg filled.
    pub fn any_fill(&self) -> bool {
        self.trade.yes_shares > Decimal::ZERO || self.trade.no_shares > Decimal::ZERO
    }
}

/// Places dual-leg FOK entries and single-leg closing orders.
pub struct Executor {
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
    events: EventSink,
    clock: Arc<dyn Clock>,
    in_flight: Arc<InFlight>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn Store>,
        breaker: Arc<CircuitBreaker>,
        events: EventSink,
        clock: Arc<dyn Clock>,
        in_flight: Arc<InFlight>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            breaker,
            events,
            clock,
            in_flight,
            config,
        }
    }

    /// Shared in-flight registry (consulted by the gate).
    pub fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    /// Execute one dual-leg order pair for an admitted opportunity.
    ///
    /// The limit prices in `pair` are exactly the opportunity's asks; this
    /// method never re-derives them and never adds slippage.
    pub async fn execute(
        &self,
        opp: &Opportunity,
        pair: &OrderPair,
        state: &MarketState,
    ) -> Result<ExecutionReport, ExecError> {
        let condition_id = opp.market.condition_id.clone();
        if !self.in_flight.try_acquire(&condition_id) {
            return Err(ExecError::Busy);
        }
        let _guard = InFlightGuard {
            registry: self.in_flight.clone(),
            condition_id: condition_id.clone(),
        };

        // Pre-fill depth snapshot, attached to the record for analysis.
        let yes_liquidity = state.yes_book.ask_depth_at_or_below(opp.yes_ask);
        let no_liquidity = state.no_book.ask_depth_at_or_below(opp.no_ask);
        let yes_depth_total = state.yes_book.ask_depth();
        let no_depth_total = state.no_book.ask_depth();

        let (yes_outcome, no_outcome) = if self.config.dry_run {
            info!(
                condition_id = %condition_id,
                pairs = %pair.num_pairs,
                "DRY RUN: simulating dual-leg placement"
            );
            (
                OrderOutcome::Matched {
                    filled_size: pair.yes.size,
                    filled_cost: pair.yes.notional(),
                },
                OrderOutcome::Matched {
                    filled_size: pair.no.size,
                    filled_cost: pair.no.notional(),
                },
            )
        } else {
            tokio::join!(
                self.place_leg(&condition_id, &pair.yes),
                self.place_leg(&condition_id, &pair.no)
            )
        };

        let status = match (yes_outcome.is_matched(), no_outcome.is_matched()) {
            _ if self.config.dry_run => ExecutionStatus::Simulated,
            (true, true) => ExecutionStatus::FullFill,
            (true, false) | (false, true) => ExecutionStatus::OneLegOnly,
            (false, false) => ExecutionStatus::Failed,
        };

        let now = self.clock.now();
        let yes_shares = yes_outcome.filled_size();
        let no_shares = no_outcome.filled_size();
        let trade = TradeRecord {
            trade_id: Uuid::new_v4().to_string(),
            created_at: now,
            condition_id: condition_id.clone(),
            asset: opp.market.asset,
            market_slug: opp.market.slug.clone(),
            market_end_time: opp.market.window_end,
            yes_token_id: opp.market.yes_token_id.clone(),
            no_token_id: opp.market.no_token_id.clone(),
            yes_price: opp.yes_ask,
            no_price: opp.no_ask,
            intended_shares: pair.num_pairs,
            yes_shares,
            no_shares,
            intended_cost: pair.total_cost(),
            yes_cost: yes_outcome.filled_cost(),
            no_cost: no_outcome.filled_cost(),
            spread_cents: opp.spread_cents,
            execution_status: status,
            yes_order_status: if self.config.dry_run {
                "SIMULATED".to_string()
            } else {
                yes_outcome.status_str().to_string()
            },
            no_order_status: if self.config.dry_run {
                "SIMULATED".to_string()
            } else {
                no_outcome.status_str().to_string()
            },
            hedge_ratio: TradeRecord::hedge_ratio_of(yes_shares, no_shares),
            yes_liquidity_at_price: yes_liquidity,
            no_liquidity_at_price: no_liquidity,
            yes_book_depth_total: yes_depth_total,
            no_book_depth_total: no_depth_total,
            dry_run: self.config.dry_run,
        };

        // Settlement rows for real filled legs, appended in the same store
        // transaction as the trade.
        let mut settlements = Vec::new();
        if !self.config.dry_run {
            if yes_shares > Decimal::ZERO {
                settlements.push(self.settlement_entry(&trade, Outcome::Yes));
            }
            if no_shares > Decimal::ZERO {
                settlements.push(self.settlement_entry(&trade, Outcome::No));
            }
        }

        if let Err(source) = self.store.save_trade(&trade, &settlements).await {
            error!(
                trade_id = %trade.trade_id,
                yes_shares = %trade.yes_shares,
                no_shares = %trade.no_shares,
                error = %source,
                "Store write failed after placement; fills NOT recorded"
            );
            self.events.publish(EngineEvent::StoreDegraded {
                context: format!("save_trade {}", trade.trade_id),
                error: source.to_string(),
            });
            self.record_breaker_failure(now);
            return Err(ExecError::Store {
                source,
                trade: Box::new(trade),
            });
        }

        self.events.publish(EngineEvent::TradeRecorded {
            trade_id: trade.trade_id.clone(),
            condition_id: condition_id.clone(),
            status,
            hedge_ratio: trade.hedge_ratio,
            dry_run: trade.dry_run,
        });

        match status {
            ExecutionStatus::FullFill => self.breaker.record_success(now),
            ExecutionStatus::OneLegOnly | ExecutionStatus::Failed => {
                self.record_breaker_failure(now);
            }
            ExecutionStatus::Simulated => {}
        }

        info!(
            trade_id = %trade.trade_id,
            condition_id = %condition_id,
            status = %status,
            yes = %trade.yes_order_status,
            no = %trade.no_order_status,
            hedge_ratio = %trade.hedge_ratio,
            "Execution complete"
        );

        Ok(ExecutionReport {
            trade,
            yes_outcome,
            no_outcome,
        })
    }

    /// Place a single closing-flow order (rebalance or claim) with the same
    /// exception isolation and timeout as entry legs.
    ///
    /// A FOK order observed LIVE is cancelled and kept as its raw outcome;
    /// GTC LIVE outcomes are returned for the caller to handle.
    pub async fn place_single(&self, order: &Order) -> OrderOutcome {
        if self.config.dry_run {
            return OrderOutcome::Matched {
                filled_size: order.size,
                filled_cost: order.notional(),
            };
        }
        self.place_checked(order).await
    }

    /// Cancel a resting order, logging failures.
    pub async fn cancel(&self, order_id: &str) {
        if let Err(e) = self.exchange.cancel_order(order_id).await {
            warn!(order_id = %order_id, error = %e, "Cancel failed");
        }
    }

    async fn place_leg(&self, condition_id: &str, order: &Order) -> OrderOutcome {
        self.events.publish(EngineEvent::OrderPlaced {
            condition_id: condition_id.to_string(),
            token_id: order.token_id.clone(),
            side: order.side.to_string(),
            limit_price: order.limit_price,
            size: order.size,
        });

        let outcome = self.place_checked(order).await;

        if let OrderOutcome::Matched {
            filled_size,
            filled_cost,
        } = &outcome
        {
            self.events.publish(EngineEvent::OrderMatched {
                condition_id: condition_id.to_string(),
                token_id: order.token_id.clone(),
                filled_size: *filled_size,
                filled_cost: *filled_cost,
            });
        }
        outcome
    }

    /// Place an order, converting every failure mode into an outcome value
    /// and cancelling anomalous LIVE results under FOK.
    async fn place_checked(&self, order: &Order) -> OrderOutcome {
        let result = timeout(
            self.config.parallel_fill_timeout,
            self.exchange.place_order(order),
        )
        .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(token_id = %order.token_id, error = %e, "Order placement error");
                OrderOutcome::Exception {
                    error: e.to_string(),
                }
            }
            Err(_) => OrderOutcome::Exception {
                error: format!(
                    "placement timed out after {:?}",
                    self.config.parallel_fill_timeout
                ),
            },
        };

        if let OrderOutcome::Live { order_id } = &outcome {
            if order.order_type == OrderType::Fok {
                warn!(
                    token_id = %order.token_id,
                    order_id = %order_id,
                    "FOK order came back LIVE; cancelling"
                );
                self.events.publish(EngineEvent::FokAnomaly {
                    token_id: order.token_id.clone(),
                    order_id: order_id.clone(),
                });
                self.cancel(order_id).await;
            }
        }
        outcome
    }

    fn settlement_entry(&self, trade: &TradeRecord, side: Outcome) -> SettlementEntry {
        let (token_id, shares, price, cost) = match side {
            Outcome::Yes => (
                trade.yes_token_id.clone(),
                trade.yes_shares,
                trade.yes_price,
                trade.yes_cost,
            ),
            Outcome::No => (
                trade.no_token_id.clone(),
                trade.no_shares,
                trade.no_price,
                trade.no_cost,
            ),
        };
        SettlementEntry::new(
            trade.trade_id.clone(),
            trade.condition_id.clone(),
            token_id,
            side,
            trade.asset,
            shares,
            price,
            cost,
            trade.market_end_time,
            trade.created_at,
        )
    }

    fn record_breaker_failure(&self, now: chrono::DateTime<chrono::Utc>) {
        if let Some(level) = self.breaker.record_failure(now) {
            self.events.publish(EngineEvent::CircuitBreakerChanged {
                level,
                consecutive_failures: self.breaker.consecutive_failures(),
                daily_pnl: self.breaker.daily_pnl(),
                reason: "consecutive execution failures".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pair_common::{CryptoAsset, OrderBookLevel, SlotMarket};
    use rust_decimal_macros::dec;

    use crate::clock::SystemClock;
    use crate::config::BreakerSettings;
    use crate::exchange_sim::SimExchange;
    use crate::risk::{BreakerLevel, BreakerThresholds};
    use crate::store::MemoryStore;

    fn opportunity() -> Opportunity {
        let (start, end) = SlotMarket::window_for_end(1_800_000_000);
        Opportunity {
            market: SlotMarket {
                condition_id: "m1".to_string(),
                slug: SlotMarket::slug_for(CryptoAsset::Btc, 1_800_000_000),
                asset: CryptoAsset::Btc,
                yes_token_id: "m1-yes".to_string(),
                no_token_id: "m1-no".to_string(),
                window_start: start,
                window_end: end,
            },
            yes_ask: dec!(0.48),
            no_ask: dec!(0.49),
            detected_at: Utc::now(),
            spread_cents: dec!(3),
        }
    }

    fn pair() -> OrderPair {
        let opp = opportunity();
        OrderPair {
            num_pairs: dec!(20),
            yes: Order::fok_buy(&opp.market.yes_token_id, dec!(0.48), dec!(20)),
            no: Order::fok_buy(&opp.market.no_token_id, dec!(0.49), dec!(20)),
        }
    }

    fn state() -> MarketState {
        let mut state = MarketState::new(opportunity().market);
        state
            .yes_book
            .apply_snapshot(vec![], vec![OrderBookLevel::new(dec!(0.48), dec!(100))]);
        state
            .no_book
            .apply_snapshot(vec![], vec![OrderBookLevel::new(dec!(0.49), dec!(100))]);
        state.last_update = Some(Utc::now());
        state.revision = 1;
        state
    }

    struct Fixture {
        executor: Executor,
        exchange: Arc<SimExchange>,
        store: Arc<MemoryStore>,
        breaker: Arc<CircuitBreaker>,
    }

    fn fixture(dry_run: bool) -> Fixture {
        let exchange = Arc::new(SimExchange::new());
        let store = Arc::new(MemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerThresholds::from(&BreakerSettings::default()),
            Utc::now(),
        ));
        let executor = Executor::new(
            exchange.clone(),
            store.clone(),
            breaker.clone(),
            EventSink::new(64),
            Arc::new(SystemClock),
            Arc::new(InFlight::new()),
            ExecutorConfig {
                parallel_fill_timeout: std::time::Duration::from_secs(10),
                dry_run,
            },
        );
        Fixture {
            executor,
            exchange,
            store,
            breaker,
        }
    }

    #[tokio::test]
    async fn test_full_fill() {
        let f = fixture(false);
        let report = f
            .executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();

        assert_eq!(report.trade.execution_status, ExecutionStatus::FullFill);
        assert_eq!(report.trade.yes_shares, dec!(20));
        assert_eq!(report.trade.no_shares, dec!(20));
        assert_eq!(report.trade.hedge_ratio, dec!(1));
        assert_eq!(report.trade.yes_order_status, "MATCHED");

        // Limit prices are exactly the opportunity's asks.
        let orders = f.exchange.placed_orders();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().any(|o| o.limit_price == dec!(0.48)));
        assert!(orders.iter().any(|o| o.limit_price == dec!(0.49)));
        assert!(orders.iter().all(|o| o.order_type == OrderType::Fok));

        // Trade + both settlement rows persisted.
        assert!(f.store.get_trade(&report.trade.trade_id).await.unwrap().is_some());
        assert_eq!(f.store.get_unclaimed_settlements().await.unwrap().len(), 2);

        // Full fill clears the failure streak.
        assert_eq!(f.breaker.consecutive_failures(), 0);
        assert_eq!(f.breaker.level(), BreakerLevel::Normal);
    }

    #[tokio::test]
    async fn test_one_leg_only() {
        let f = fixture(false);
        f.exchange.script_outcome(
            "m1-no",
            OrderOutcome::Failed {
                reason: "killed".to_string(),
            },
        );

        let report = f
            .executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();

        assert_eq!(report.trade.execution_status, ExecutionStatus::OneLegOnly);
        assert_eq!(report.trade.yes_shares, dec!(20));
        assert_eq!(report.trade.no_shares, dec!(0));
        assert_eq!(report.trade.hedge_ratio, dec!(0));
        assert_eq!(report.trade.no_order_status, "FAILED");

        // Only the filled side is queued for settlement.
        let rows = f.store.get_unclaimed_settlements().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token_id, "m1-yes");

        // A partial is a failure for the breaker.
        assert_eq!(f.breaker.consecutive_failures(), 1);

        // No SELL was ever sent: matched legs are never unwound.
        assert!(f
            .exchange
            .placed_orders()
            .iter()
            .all(|o| o.side == pair_common::Side::Buy));
    }

    #[tokio::test]
    async fn test_both_legs_failed() {
        let f = fixture(false);
        f.exchange.script_transport_error("m1-yes", "502 bad gateway");
        f.exchange.script_outcome(
            "m1-no",
            OrderOutcome::Failed {
                reason: "killed".to_string(),
            },
        );

        let report = f
            .executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();

        assert_eq!(report.trade.execution_status, ExecutionStatus::Failed);
        assert_eq!(report.trade.yes_order_status, "EXCEPTION");
        assert!(!report.any_fill());
        assert!(f.store.get_unclaimed_settlements().await.unwrap().is_empty());
        assert_eq!(f.breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_live_under_fok_is_cancelled() {
        let f = fixture(false);
        f.exchange.script_outcome(
            "m1-no",
            OrderOutcome::Live {
                order_id: "o-77".to_string(),
            },
        );

        let report = f
            .executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();

        // LIVE counts as not matched and the order was cancelled.
        assert_eq!(report.trade.execution_status, ExecutionStatus::OneLegOnly);
        assert_eq!(report.trade.no_order_status, "LIVE");
        assert_eq!(f.exchange.cancelled_orders(), vec!["o-77".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_no_exchange_calls() {
        let f = fixture(true);
        let report = f
            .executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();

        assert_eq!(report.trade.execution_status, ExecutionStatus::Simulated);
        assert!(report.trade.dry_run);
        assert_eq!(report.trade.yes_order_status, "SIMULATED");
        assert_eq!(report.trade.no_order_status, "SIMULATED");
        // No exchange calls, no settlement rows.
        assert!(f.exchange.placed_orders().is_empty());
        assert!(f.store.get_unclaimed_settlements().await.unwrap().is_empty());
        // The simulated trade itself is recorded.
        assert_eq!(f.store.get_trades(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_preserves_fill_in_error() {
        let f = fixture(false);
        f.store.set_fail_writes(true);

        let result = f.executor.execute(&opportunity(), &pair(), &state()).await;
        match result {
            Err(ExecError::Store { trade, .. }) => {
                // The known fill rides inside the error.
                assert_eq!(trade.yes_shares, dec!(20));
                assert_eq!(trade.no_shares, dec!(20));
            }
            other => panic!("expected store error, got {other:?}"),
        }
        // Raised to the breaker.
        assert_eq!(f.breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_lock_released_after_execution() {
        let f = fixture(false);
        let in_flight = f.executor.in_flight();

        f.executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();
        assert!(!in_flight.contains("m1"));

        // A held lock rejects concurrent execution.
        assert!(in_flight.try_acquire("m1"));
        let result = f.executor.execute(&opportunity(), &pair(), &state()).await;
        assert!(matches!(result, Err(ExecError::Busy)));
        in_flight.release("m1");
    }

    #[tokio::test]
    async fn test_depth_snapshot_attached() {
        let f = fixture(false);
        let report = f
            .executor
            .execute(&opportunity(), &pair(), &state())
            .await
            .unwrap();
        assert_eq!(report.trade.yes_liquidity_at_price, dec!(100));
        assert_eq!(report.trade.no_liquidity_at_price, dec!(100));
        assert_eq!(report.trade.yes_book_depth_total, dec!(100));
        assert_eq!(report.trade.no_book_depth_total, dec!(100));
    }

    #[tokio::test]
    async fn test_single_leg_gtc_live_returned_uncancelled() {
        let f = fixture(false);
        f.exchange.script_outcome(
            "m1-yes",
            OrderOutcome::Live {
                order_id: "o-9".to_string(),
            },
        );

        let order = Order::gtc_sell("m1-yes", dec!(0.99), dec!(20));
        let outcome = f.executor.place_single(&order).await;
        assert!(matches!(outcome, OrderOutcome::Live { .. }));
        // GTC LIVE is the caller's to handle; no auto-cancel.
        assert!(f.exchange.cancelled_orders().is_empty());
    }
}
