//! Engine assembly: wires the components together, runs the long-lived
//! loops, and coordinates ordered shutdown.
//!
//! Data flow: finder -> tracker -> detector -> gate -> sizer -> executor
//! -> positions -> settlement. Events move forward through bounded
//! channels; the opportunity queue drops on full rather than blocking the
//! book stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pair_common::{Exchange, Order, Outcome, Side};
use pair_market::{BookEvent, BookTracker, FinderConfig, FinderEvent, MarketFinder, TrackerConfig};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::detector::{Opportunity, OpportunityDetector};
use crate::events::{EngineEvent, EventSink};
use crate::executor::{ExecError, Executor, ExecutorConfig, InFlight};
use crate::position::{ActivePosition, PositionManager, RebalanceOption};
use crate::recovery;
use crate::risk::{
    BlackoutWindow, BreakerThresholds, CircuitBreaker, GateConfig, RiskGate, WindowLedger,
};
use crate::settlement::{SettlementConfig, SettlementManager};
use crate::sizing::{Sizer, SizerConfig};
use crate::store::{RebalanceRecord, SettlementEntry, Store};

/// Cached balance with a short TTL so the gate doesn't hit the exchange on
/// every opportunity.
const BALANCE_TTL: Duration = Duration::from_secs(30);

/// Handle for requesting shutdown from outside the engine.
#[derive(Clone)]
pub struct EngineHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl EngineHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// The assembled trading engine.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn Store>,
    events: EventSink,

    breaker: Arc<CircuitBreaker>,
    ledger: Arc<WindowLedger>,
    positions: Arc<PositionManager>,
    in_flight: Arc<InFlight>,
    executor: Arc<Executor>,
    settlement: Arc<SettlementManager>,
    gate: Arc<RiskGate>,
    sizer: Sizer,
    detector: Arc<OpportunityDetector>,
    finder: Arc<MarketFinder>,
    tracker: Arc<BookTracker>,

    trading_enabled: Arc<AtomicBool>,
    /// External shutdown requests.
    shutdown_tx: broadcast::Sender<()>,
    /// Internal stop signal for background loops, fired by the coordinator
    /// after in-flight work has drained.
    stop_tx: broadcast::Sender<()>,
    balance_cache: Mutex<Option<(Decimal, std::time::Instant)>>,

    book_rx: Mutex<Option<mpsc::Receiver<BookEvent>>>,
    finder_rx: Mutex<Option<mpsc::Receiver<FinderEvent>>>,
}

impl Engine {
    /// Assemble the engine. Fails only on configuration errors.
    pub fn new(
        config: EngineConfig,
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let assets = config.parsed_assets()?;
        let now = clock.now();

        let events = EventSink::new(1024);
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerThresholds::from(&config.breaker),
            now,
        ));
        let ledger = Arc::new(WindowLedger::new());
        let positions = Arc::new(PositionManager::new(config.rebalance.clone()));
        let in_flight = Arc::new(InFlight::new());

        let executor = Arc::new(Executor::new(
            exchange.clone(),
            store.clone(),
            breaker.clone(),
            events.clone(),
            clock.clone(),
            in_flight.clone(),
            ExecutorConfig {
                parallel_fill_timeout: config.parallel_fill_timeout(),
                dry_run: config.dry_run,
            },
        ));

        let settlement = Arc::new(SettlementManager::new(
            store.clone(),
            executor.clone(),
            breaker.clone(),
            positions.clone(),
            events.clone(),
            clock.clone(),
            SettlementConfig::from(&config.settlement),
        ));

        let blackout = BlackoutWindow::new(&config.blackout)
            .map_err(|e| anyhow::anyhow!("blackout window: {e}"))?;
        let gate = Arc::new(RiskGate::new(
            GateConfig::from(&config.trading),
            blackout,
            breaker.clone(),
            ledger.clone(),
            positions.clone(),
            in_flight.clone(),
        ));

        let sizer = Sizer::new(SizerConfig::from(&config.trading));
        let detector = Arc::new(OpportunityDetector::new(
            config.trading.min_spread_usd,
            config.stale_threshold(),
        ));

        let (finder_tx, finder_rx) = mpsc::channel(256);
        let finder = Arc::new(MarketFinder::new(
            exchange.clone(),
            FinderConfig {
                assets,
                refresh_interval: Duration::from_secs(config.market_refresh_secs),
            },
            finder_tx,
        ));

        let (book_tx, book_rx) = mpsc::channel(1024);
        let tracker = Arc::new(BookTracker::new(
            exchange.clone(),
            TrackerConfig {
                stale_threshold: config.stale_threshold(),
                ..TrackerConfig::default()
            },
            book_tx,
        ));

        let (shutdown_tx, _) = broadcast::channel(16);
        let (stop_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            clock,
            exchange,
            store,
            events,
            breaker,
            ledger,
            positions,
            in_flight,
            executor,
            settlement,
            gate,
            sizer,
            detector,
            finder,
            tracker,
            trading_enabled: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            stop_tx,
            balance_cache: Mutex::new(None),
            book_rx: Mutex::new(Some(book_rx)),
            finder_rx: Mutex::new(Some(finder_rx)),
        })
    }

    /// Event stream for observers (metrics, logs, UIs).
    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    /// Shutdown handle.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Book tracker (read access for diagnostics/tests).
    pub fn tracker(&self) -> Arc<BookTracker> {
        self.tracker.clone()
    }

    /// Position manager (read access for diagnostics/tests).
    pub fn positions(&self) -> Arc<PositionManager> {
        self.positions.clone()
    }

    /// Toggle opportunity intake. `run` enables this after recovery; the
    /// shutdown coordinator disables it first.
    pub fn set_trading_enabled(&self, enabled: bool) {
        self.trading_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Run the engine until shutdown is requested.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            assets = ?self.config.assets,
            dry_run = self.config.dry_run,
            "Starting engine"
        );

        // Recovery before any background loop starts.
        let now = self.clock.now();
        let recovered =
            recovery::recover(self.store.as_ref(), &self.positions, &self.breaker, now)
                .await
                .context("recovery from store failed")?;
        for market in recovered.markets {
            if !market.is_expired(now) {
                self.tracker.track(market);
            }
        }

        // Prime the market set so the first book subscription has tokens.
        for market in self.finder.refresh(now).await {
            self.tracker.track(market);
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Book feed ingest + staleness.
        {
            let tracker = self.tracker.clone();
            let shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                tracker.run(shutdown).await;
            }));
        }

        // Market refresh loop.
        {
            let engine = self.clone();
            let mut shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(engine.finder.refresh_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => engine.refresh_markets().await,
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Finder event forwarding.
        {
            let events = self.events.clone();
            let mut finder_rx = self.finder_rx.lock().take().expect("finder_rx taken once");
            let mut shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = finder_rx.recv() => match event {
                            Some(FinderEvent::Degraded { asset, error }) => {
                                events.publish(EngineEvent::FinderDegraded { asset, error });
                            }
                            Some(_) => {}
                            None => break,
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Opportunity queue.
        let (opp_tx, mut opp_rx) =
            mpsc::channel::<Opportunity>(self.config.opportunity_queue_capacity);

        // Book event loop: detection + staleness fan-out.
        {
            let engine = self.clone();
            let mut book_rx = self.book_rx.lock().take().expect("book_rx taken once");
            let mut shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = book_rx.recv() => match event {
                            Some(event) => engine.on_book_event(event, &opp_tx),
                            None => break,
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Opportunity processing loop.
        {
            let engine = self.clone();
            let mut shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        opp = opp_rx.recv() => match opp {
                            Some(opp) => engine.process_opportunity(opp).await,
                            None => break,
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Rebalance sweep.
        {
            let engine = self.clone();
            let mut shutdown = self.stop_tx.subscribe();
            let interval = Duration::from_secs(engine.config.rebalance.sweep_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => engine.rebalance_sweep().await,
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        // Settlement sweep.
        {
            let settlement = self.settlement.clone();
            let shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                settlement.run(shutdown).await;
            }));
        }

        // Housekeeping: daily reset, breaker persistence, ledger pruning.
        {
            let engine = self.clone();
            let mut shutdown = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => engine.housekeeping().await,
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        self.trading_enabled.store(true, Ordering::SeqCst);
        info!("Trading enabled");

        // Wait for a shutdown request.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;

        self.shutdown(tasks).await;
        Ok(())
    }

    /// Ordered shutdown: stop intake, drain in-flight, stop loops, flush.
    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        info!("Beginning graceful shutdown");
        self.events.publish(EngineEvent::ShuttingDown {
            at: self.clock.now(),
        });

        // 1. Stop admitting new opportunities.
        self.trading_enabled.store(false, Ordering::SeqCst);

        // 2. Wait for in-flight executions to finish (bounded).
        let deadline =
            std::time::Instant::now() + self.config.parallel_fill_timeout() + Duration::from_secs(2);
        while !self.in_flight.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.in_flight.is_empty() {
            warn!(count = self.in_flight.len(), "In-flight executions timed out");
        }

        // 3-4. Stop loops and close subscriptions.
        let _ = self.stop_tx.send(());
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Task did not stop within the shutdown timeout");
            }
        }

        // 5. Flush durable state.
        let snapshot = self.breaker.snapshot(self.clock.now());
        if let Err(e) = self.store.save_circuit_breaker(&snapshot).await {
            warn!(error = %e, "Failed to persist circuit breaker on shutdown");
        }

        info!(
            open_positions = self.positions.len(),
            breaker = %self.breaker.level(),
            daily_pnl = %self.breaker.daily_pnl(),
            "Shutdown complete"
        );
    }

    /// Refresh the market set and prune expired windows.
    async fn refresh_markets(&self) {
        let now = self.clock.now();
        for market in self.finder.refresh(now).await {
            self.tracker.track(market);
        }
        for condition_id in self.finder.prune_expired(now) {
            self.tracker.untrack(&condition_id);
            self.detector.forget(&condition_id);
        }
    }

    /// Handle one tracker event.
    fn on_book_event(&self, event: BookEvent, opp_tx: &mpsc::Sender<Opportunity>) {
        match event {
            BookEvent::Updated(state) => {
                if !self.trading_enabled.load(Ordering::SeqCst) {
                    return;
                }
                let now = self.clock.now();
                if let Ok(opp) = self.detector.evaluate(&state, now) {
                    self.events.publish(EngineEvent::OpportunityDetected {
                        condition_id: opp.market.condition_id.clone(),
                        asset: opp.market.asset,
                        yes_ask: opp.yes_ask,
                        no_ask: opp.no_ask,
                        spread_cents: opp.spread_cents,
                    });
                    if opp_tx.try_send(opp.clone()).is_err() {
                        self.events.publish(EngineEvent::OpportunityDropped {
                            condition_id: opp.market.condition_id,
                        });
                    }
                }
            }
            BookEvent::Stale {
                condition_id,
                asset,
            } => {
                self.events
                    .publish(EngineEvent::MarketStale { condition_id, asset });
            }
            BookEvent::Reconnected { tokens } => {
                self.events
                    .publish(EngineEvent::WebsocketReconnected { tokens });
            }
        }
    }

    /// Current balance, cached briefly.
    async fn balance(&self) -> Decimal {
        if let Some((balance, at)) = *self.balance_cache.lock() {
            if at.elapsed() < BALANCE_TTL {
                return balance;
            }
        }
        match self.exchange.get_balance().await {
            Ok(b) => {
                *self.balance_cache.lock() = Some((b.balance, std::time::Instant::now()));
                b.balance
            }
            Err(e) => {
                warn!(error = %e, "Balance fetch failed");
                let cached = *self.balance_cache.lock();
                cached.map(|(b, _)| b).unwrap_or(Decimal::ZERO)
            }
        }
    }

    /// Admission -> sizing -> execution for one queued opportunity.
    pub async fn process_opportunity(&self, opp: Opportunity) {
        if !self.trading_enabled.load(Ordering::SeqCst) {
            return;
        }

        let condition_id = opp.market.condition_id.clone();
        let Some(state) = self.tracker.snapshot(&condition_id) else {
            return;
        };

        // Re-read the book at admission time: the queue may be behind the
        // market. The refreshed asks become the limit prices.
        let (Some(yes_ask), Some(no_ask)) = (state.yes_ask(), state.no_ask()) else {
            return;
        };
        let current = Opportunity {
            market: opp.market.clone(),
            yes_ask,
            no_ask,
            detected_at: opp.detected_at,
            spread_cents: (Decimal::ONE - yes_ask - no_ask) * Decimal::ONE_HUNDRED,
        };

        let now = self.clock.now();
        let balance = self.balance().await;
        let admission = match self.gate.admit(&current, balance, now) {
            Ok(admission) => admission,
            Err(reason) => {
                debug!(condition_id = %condition_id, reason = %reason, "Opportunity rejected");
                self.events.publish(EngineEvent::OpportunityRejected {
                    condition_id,
                    reason: reason.to_string(),
                });
                return;
            }
        };

        let plan = match self.sizer.size(&current, admission.budget, &state) {
            Ok(plan) => plan,
            Err(skip) => {
                self.events.publish(EngineEvent::OpportunityRejected {
                    condition_id,
                    reason: skip.to_string(),
                });
                return;
            }
        };

        for (index, tranche) in plan.tranches.iter().enumerate() {
            let state = if index == 0 {
                state.clone()
            } else {
                tokio::time::sleep(plan.tranche_delay).await;
                // Re-validate each later tranche against fresh book state.
                let Some(fresh) = self.tracker.snapshot(&condition_id) else {
                    break;
                };
                match (fresh.yes_ask(), fresh.no_ask()) {
                    (Some(y), Some(n)) if y + n < Decimal::ONE => fresh,
                    _ => {
                        self.events.publish(EngineEvent::OpportunityRejected {
                            condition_id: condition_id.clone(),
                            reason: "INVALID_SPREAD".to_string(),
                        });
                        break;
                    }
                }
            };

            match self.executor.execute(&current, tranche, &state).await {
                Ok(report) => {
                    if report.any_fill() {
                        let spent = report.trade.yes_cost + report.trade.no_cost;
                        self.ledger
                            .add(&condition_id, spent, current.market.window_end);
                        self.positions.open_from_trade(
                            &report.trade,
                            current.market.clone(),
                            admission.budget,
                        );
                    }
                    if report.trade.execution_status == crate::store::ExecutionStatus::Failed {
                        break;
                    }
                }
                Err(ExecError::Busy) => break,
                Err(ExecError::Store { .. }) => break,
            }
        }
    }

    /// One rebalancing pass over imbalanced positions.
    pub async fn rebalance_sweep(&self) {
        if !self.breaker.level().closing_allowed() {
            return;
        }
        let now = self.clock.now();

        for (condition_id, position) in self.positions.imbalanced() {
            if !self.positions.may_rebalance(&position, now) {
                continue;
            }
            let Some(state) = self.tracker.snapshot(&condition_id) else {
                continue;
            };
            if state.is_stale(now, self.config.stale_threshold()) {
                continue;
            }

            let options = self.positions.options_for(&position, &state);
            let Some(option) = self.positions.select_option(options) else {
                continue;
            };
            if !self.positions.should_execute(&position, &option) {
                continue;
            }

            self.positions.record_attempt(&condition_id);
            self.execute_rebalance(&condition_id, &position, option, now)
                .await;
        }
    }

    async fn execute_rebalance(
        &self,
        condition_id: &str,
        position: &ActivePosition,
        option: RebalanceOption,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let token_id = position.market.token_id(option.action.outcome()).to_string();
        let order = match option.action.side() {
            Side::Buy => Order::fok_buy(&token_id, option.price, option.shares),
            Side::Sell => Order::fok_sell(&token_id, option.price, option.shares),
        };

        let outcome = self.executor.place_single(&order).await;
        let filled = outcome.filled_size();
        let matched = outcome.is_matched();

        let mut record = RebalanceRecord {
            trade_id: position.trade_id.clone(),
            condition_id: condition_id.to_string(),
            attempted_at: now,
            action: option.action.as_str().to_string(),
            shares: option.shares,
            price: option.price,
            status: if matched { "SUCCESS" } else { "FAILED" }.to_string(),
            filled_shares: filled,
            profit: Decimal::ZERO,
            error: match &outcome {
                pair_common::OrderOutcome::Failed { reason } => Some(reason.clone()),
                pair_common::OrderOutcome::Exception { error } => Some(error.clone()),
                _ => None,
            },
        };

        if matched {
            let pre_fill_avg = match option.action.outcome() {
                Outcome::Yes => position.yes_avg_cost,
                Outcome::No => position.no_avg_cost,
            };
            if let Some(applied) =
                self.positions
                    .apply_fill(condition_id, option.action, filled, option.price)
            {
                record.profit = applied.realized_profit;

                // Keep the durable claim queue in line with held shares.
                let (delta_shares, delta_cost) = match option.action.side() {
                    Side::Sell => (-filled, -(filled * pre_fill_avg)),
                    Side::Buy => (filled, filled * option.price),
                };
                if let Err(e) = self
                    .store
                    .adjust_settlement_shares(&position.trade_id, &token_id, delta_shares, delta_cost)
                    .await
                {
                    // A buy can open a side the entry never filled.
                    if option.action.side() == Side::Buy {
                        let entry = SettlementEntry::new(
                            position.trade_id.clone(),
                            condition_id.to_string(),
                            token_id.clone(),
                            option.action.outcome(),
                            position.market.asset,
                            filled,
                            option.price,
                            filled * option.price,
                            position.market.window_end,
                            now,
                        );
                        if let Err(e) = self.store.enqueue_settlement(&entry).await {
                            warn!(error = %e, "Failed to enqueue settlement for rebalance buy");
                        }
                    } else {
                        warn!(error = %e, "Failed to adjust settlement shares");
                    }
                }

                if applied.realized_profit != Decimal::ZERO {
                    if let Some(level) = self.breaker.record_pnl(applied.realized_profit, now) {
                        self.events.publish(EngineEvent::CircuitBreakerChanged {
                            level,
                            consecutive_failures: self.breaker.consecutive_failures(),
                            daily_pnl: self.breaker.daily_pnl(),
                            reason: "realized rebalance loss".to_string(),
                        });
                    }
                }

                self.events.publish(EngineEvent::Rebalanced {
                    trade_id: position.trade_id.clone(),
                    condition_id: condition_id.to_string(),
                    action: option.action.as_str().to_string(),
                    shares: filled,
                    price: option.price,
                    profit: applied.realized_profit,
                    hedge_ratio: applied.hedge_ratio,
                });
            }
        }

        if let Err(e) = self.store.save_rebalance(&record).await {
            warn!(error = %e, "Failed to persist rebalance record");
            self.events.publish(EngineEvent::StoreDegraded {
                context: format!("save_rebalance {}", position.trade_id),
                error: e.to_string(),
            });
        }
    }

    /// Daily reset, breaker persistence and ledger pruning.
    async fn housekeeping(&self) {
        let now = self.clock.now();
        if self.breaker.maybe_daily_reset(now) {
            self.events.publish(EngineEvent::CircuitBreakerChanged {
                level: self.breaker.level(),
                consecutive_failures: 0,
                daily_pnl: Decimal::ZERO,
                reason: "daily reset".to_string(),
            });
        }
        let snapshot = self.breaker.snapshot(now);
        if let Err(e) = self.store.save_circuit_breaker(&snapshot).await {
            warn!(error = %e, "Failed to persist circuit breaker");
        }
        self.ledger.prune(now);
        for condition_id in self.positions.prune_resolved(now) {
            debug!(condition_id = %condition_id, "Resolved position pruned");
        }
    }
}
