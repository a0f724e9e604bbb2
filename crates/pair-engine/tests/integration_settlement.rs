//! Settlement durability across restarts: trades written before a crash
//! are claimable after recovery, and claim state survives reloads.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use pair_common::{CryptoAsset, OrderBookLevel, OrderType, Side, SlotMarket};
use pair_engine::{
    recover, BreakerThresholds, CircuitBreaker, Clock, EngineConfig, Executor, ExecutorConfig,
    InFlight, ManualClock, MemoryStore, Opportunity, OrderPair, PositionManager,
    SettlementConfig, SettlementManager, SimExchange, Store,
};

fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 18, 0, 0).unwrap()
}

fn test_market(now: DateTime<Utc>) -> SlotMarket {
    let end_ts = now.timestamp() + 600;
    let (start, end) = SlotMarket::window_for_end(end_ts);
    SlotMarket {
        condition_id: "m1".to_string(),
        slug: SlotMarket::slug_for(CryptoAsset::Eth, end_ts),
        asset: CryptoAsset::Eth,
        yes_token_id: "m1-yes".to_string(),
        no_token_id: "m1-no".to_string(),
        window_start: start,
        window_end: end,
    }
}

fn components(
    store: Arc<MemoryStore>,
    exchange: Arc<SimExchange>,
    clock: Arc<ManualClock>,
) -> (Arc<Executor>, Arc<PositionManager>, Arc<CircuitBreaker>, SettlementManager) {
    let config = EngineConfig::default();
    let breaker = Arc::new(CircuitBreaker::new(
        BreakerThresholds::from(&config.breaker),
        clock.now(),
    ));
    let positions = Arc::new(PositionManager::new(config.rebalance.clone()));
    let events = pair_engine::EventSink::new(128);
    let executor = Arc::new(Executor::new(
        exchange.clone(),
        store.clone(),
        breaker.clone(),
        events.clone(),
        clock.clone(),
        Arc::new(InFlight::new()),
        ExecutorConfig {
            parallel_fill_timeout: Duration::from_secs(10),
            dry_run: false,
        },
    ));
    let settlement = SettlementManager::new(
        store.clone(),
        executor.clone(),
        breaker.clone(),
        positions.clone(),
        events,
        clock.clone(),
        SettlementConfig::from(&config.settlement),
    );
    (executor, positions, breaker, settlement)
}

/// Execute a 20-share YES-only fill (NO leg killed) at 0.48/0.49.
async fn seed_one_leg_trade(
    executor: &Executor,
    exchange: &SimExchange,
    clock: &ManualClock,
    market: &SlotMarket,
) {
    exchange.script_outcome(
        "m1-no",
        pair_common::OrderOutcome::Failed {
            reason: "killed".to_string(),
        },
    );
    let opp = Opportunity {
        market: market.clone(),
        yes_ask: dec!(0.48),
        no_ask: dec!(0.49),
        detected_at: clock.now(),
        spread_cents: dec!(3),
    };
    let pair = OrderPair {
        num_pairs: dec!(20),
        yes: pair_common::Order::fok_buy("m1-yes", dec!(0.48), dec!(20)),
        no: pair_common::Order::fok_buy("m1-no", dec!(0.49), dec!(20)),
    };
    let mut state = pair_market::MarketState::new(market.clone());
    state.yes_book.apply_snapshot(
        vec![OrderBookLevel::new(dec!(0.46), dec!(50))],
        vec![OrderBookLevel::new(dec!(0.48), dec!(100))],
    );
    state.no_book.apply_snapshot(
        vec![OrderBookLevel::new(dec!(0.47), dec!(50))],
        vec![OrderBookLevel::new(dec!(0.49), dec!(100))],
    );
    state.last_update = Some(clock.now());
    state.revision = 1;

    let report = executor.execute(&opp, &pair, &state).await.unwrap();
    assert!(report.any_fill());
}

#[tokio::test]
async fn claim_succeeds_after_restart() {
    let now = test_now();
    let market = test_market(now);
    let store = Arc::new(MemoryStore::new());

    // --- First process lifetime: execute and "crash".
    {
        let clock = ManualClock::new(now);
        let exchange = Arc::new(SimExchange::new());
        let (executor, _positions, _breaker, _settlement) =
            components(store.clone(), exchange.clone(), clock.clone());
        seed_one_leg_trade(&executor, &exchange, &clock, &market).await;
    }

    // The queue written before the restart is fully present afterwards.
    let rows = store.get_unclaimed_settlements().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].token_id, "m1-yes");
    assert_eq!(rows[0].shares, dec!(20));
    assert_eq!(rows[0].entry_cost, dec!(9.60));

    // --- Second process lifetime: recover and claim.
    let clock = ManualClock::new(now);
    let exchange = Arc::new(SimExchange::new());
    let (_executor, positions, breaker, settlement) =
        components(store.clone(), exchange.clone(), clock.clone());

    let recovered = recover(store.as_ref(), &positions, &breaker, clock.now())
        .await
        .unwrap();
    assert_eq!(recovered.open_positions, 1);
    assert_eq!(recovered.unclaimed_rows, 1);
    assert!(positions.has_position("m1"));

    // Before market end + resolution wait: nothing claimable.
    assert_eq!(settlement.sweep().await, 0);
    assert!(exchange.placed_orders().is_empty());

    // 10 min past market end: the claim sell goes out at $0.99 GTC.
    clock.set(market.window_end + chrono::Duration::seconds(601));
    assert_eq!(settlement.sweep().await, 1);

    let orders = exchange.placed_orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, Side::Sell);
    assert_eq!(orders[0].order_type, OrderType::Gtc);
    assert_eq!(orders[0].limit_price, dec!(0.99));
    assert_eq!(orders[0].size, dec!(20));

    // Proceeds 19.80, profit 10.20; claim state survives a reload.
    let rows = store.get_unclaimed_settlements().await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(breaker.daily_pnl(), dec!(10.20));
    assert!(!positions.has_position("m1"));

    // Subsequent cycles do not re-attempt.
    clock.advance(chrono::Duration::minutes(5));
    assert_eq!(settlement.sweep().await, 0);
    assert_eq!(exchange.placed_orders().len(), 1);
}

#[tokio::test]
async fn breaker_level_survives_restart_within_day() {
    let now = test_now();
    let store = Arc::new(MemoryStore::new());

    {
        let clock = ManualClock::new(now);
        let exchange = Arc::new(SimExchange::new());
        let (_executor, _positions, breaker, _settlement) =
            components(store.clone(), exchange, clock.clone());
        breaker.record_pnl(dec!(-60), clock.now());
        store
            .save_circuit_breaker(&breaker.snapshot(clock.now()))
            .await
            .unwrap();
    }

    let clock = ManualClock::new(now + chrono::Duration::hours(1));
    let exchange = Arc::new(SimExchange::new());
    let (_executor, positions, breaker, _settlement) =
        components(store.clone(), exchange, clock.clone());
    let recovered = recover(store.as_ref(), &positions, &breaker, clock.now())
        .await
        .unwrap();

    assert!(recovered.breaker_restored);
    assert_eq!(breaker.level(), pair_engine::BreakerLevel::Warning);
    assert_eq!(breaker.daily_pnl(), dec!(-60));
}

#[tokio::test]
async fn trade_record_round_trips_through_store() {
    let now = test_now();
    let market = test_market(now);
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(now);
    let exchange = Arc::new(SimExchange::new());
    let (executor, _positions, _breaker, _settlement) =
        components(store.clone(), exchange.clone(), clock.clone());
    seed_one_leg_trade(&executor, &exchange, &clock, &market).await;

    let trades = store.get_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    let reloaded = store
        .get_trade(&trades[0].trade_id)
        .await
        .unwrap()
        .unwrap();
    // Equality covers every field, including hedge_ratio and the depth
    // snapshot columns.
    assert_eq!(reloaded, trades[0]);
    assert_eq!(reloaded.yes_liquidity_at_price, dec!(100));
    assert_eq!(reloaded.hedge_ratio, Decimal::ZERO);
}
