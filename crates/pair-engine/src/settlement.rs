//! Settlement of resolved positions.
//!
//! The assumed exchange has no native redemption primitive, so claiming a
//! resolved position sells the held shares back near par ($0.99 GTC): the
//! winning side trades at ~$1.00 after resolution, so the sell matches
//! immediately once the market has converged. Failed claims retry with
//! exponential backoff and jitter; rows that exhaust the attempt cap are
//! abandoned permanently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use pair_common::{Order, OrderOutcome};

use crate::clock::Clock;
use crate::config::SettlementSettings;
use crate::events::{EngineEvent, EventSink};
use crate::executor::Executor;
use crate::position::PositionManager;
use crate::risk::CircuitBreaker;
use crate::store::{SettlementEntry, Store};

/// Settlement parameters.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub resolution_wait: Duration,
    pub claim_sell_price: Decimal,
    pub base_retry: Duration,
    pub max_retry: Duration,
    pub max_claim_attempts: u32,
    pub alert_after_failures: u32,
    pub check_interval: Duration,
}

impl From<&SettlementSettings> for SettlementConfig {
    fn from(s: &SettlementSettings) -> Self {
        Self {
            resolution_wait: Duration::from_secs(s.resolution_wait_secs),
            claim_sell_price: s.claim_sell_price,
            base_retry: Duration::from_secs(s.base_retry_secs),
            max_retry: Duration::from_secs(s.max_retry_secs),
            max_claim_attempts: s.max_claim_attempts,
            alert_after_failures: s.alert_after_failures,
            check_interval: Duration::from_secs(s.check_interval_secs),
        }
    }
}

/// Claims resolved positions from the durable settlement queue.
pub struct SettlementManager {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    breaker: Arc<CircuitBreaker>,
    positions: Arc<PositionManager>,
    events: EventSink,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl SettlementManager {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<Executor>,
        breaker: Arc<CircuitBreaker>,
        positions: Arc<PositionManager>,
        events: EventSink,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            executor,
            breaker,
            positions,
            events,
            clock,
            config,
        }
    }

    /// One claim sweep. Returns the number of rows claimed.
    pub async fn sweep(&self) -> usize {
        // HALT blocks all mutating flows except cancels.
        if !self.breaker.level().closing_allowed() {
            return 0;
        }

        let now = self.clock.now();
        let rows = match self
            .store
            .get_claimable(now, self.config.resolution_wait, self.config.max_claim_attempts)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Failed to read claimable rows");
                return 0;
            }
        };

        if rows.is_empty() {
            return 0;
        }
        info!(pending = rows.len(), "Settlement sweep");

        let mut claimed = 0;
        for entry in rows {
            if self.claim(&entry).await {
                claimed += 1;
            }
        }
        claimed
    }

    /// Attempt to claim one row.
    async fn claim(&self, entry: &SettlementEntry) -> bool {
        let now = self.clock.now();

        // Shares can reach zero after a full sell-excess rebalance.
        if entry.shares <= Decimal::ZERO {
            let _ = self
                .store
                .mark_claimed(&entry.trade_id, &entry.token_id, Decimal::ZERO, Decimal::ZERO, now)
                .await;
            self.positions
                .settlement_resolved(&entry.condition_id, &entry.token_id);
            return true;
        }

        let order = Order::gtc_sell(&entry.token_id, self.config.claim_sell_price, entry.shares);
        let outcome = self.executor.place_single(&order).await;

        match outcome {
            OrderOutcome::Matched { filled_cost, .. } => {
                let proceeds = filled_cost;
                let profit = proceeds - entry.entry_cost;
                if let Err(e) = self
                    .store
                    .mark_claimed(&entry.trade_id, &entry.token_id, proceeds, profit, now)
                    .await
                {
                    warn!(
                        trade_id = %entry.trade_id,
                        token_id = %entry.token_id,
                        error = %e,
                        "Claim filled but store update failed; row will retry"
                    );
                    self.events.publish(EngineEvent::StoreDegraded {
                        context: format!("mark_claimed {}/{}", entry.trade_id, entry.token_id),
                        error: e.to_string(),
                    });
                    return false;
                }

                info!(
                    trade_id = %entry.trade_id,
                    token_id = %entry.token_id,
                    proceeds = %proceeds,
                    profit = %profit,
                    "Settlement claimed"
                );
                self.events.publish(EngineEvent::SettlementClaimed {
                    trade_id: entry.trade_id.clone(),
                    token_id: entry.token_id.clone(),
                    proceeds,
                    profit,
                });
                self.positions
                    .settlement_resolved(&entry.condition_id, &entry.token_id);
                if let Some(level) = self.breaker.record_pnl(profit, now) {
                    self.events.publish(EngineEvent::CircuitBreakerChanged {
                        level,
                        consecutive_failures: self.breaker.consecutive_failures(),
                        daily_pnl: self.breaker.daily_pnl(),
                        reason: "realized settlement loss".to_string(),
                    });
                }
                true
            }
            OrderOutcome::Live { order_id } => {
                // The market has not converged to par yet; don't leave the
                // sell resting across the retry window.
                self.executor.cancel(&order_id).await;
                self.record_failure(entry, "claim sell rested unmatched", now)
                    .await;
                false
            }
            OrderOutcome::Failed { reason } => {
                self.record_failure(entry, &reason, now).await;
                false
            }
            OrderOutcome::Exception { error } => {
                self.record_failure(entry, &error, now).await;
                false
            }
        }
    }

    async fn record_failure(&self, entry: &SettlementEntry, error: &str, now: DateTime<Utc>) {
        let upcoming_attempt = entry.claim_attempts + 1;
        let next_attempt_at = now + self.backoff(upcoming_attempt);

        let attempts = match self
            .store
            .record_claim_attempt(&entry.trade_id, &entry.token_id, error, next_attempt_at)
            .await
        {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(
                    trade_id = %entry.trade_id,
                    token_id = %entry.token_id,
                    error = %e,
                    "Failed to record claim attempt"
                );
                return;
            }
        };

        warn!(
            trade_id = %entry.trade_id,
            token_id = %entry.token_id,
            attempts,
            error = %error,
            next_attempt = %next_attempt_at,
            "Claim attempt failed"
        );

        if attempts >= self.config.max_claim_attempts {
            // Permanent failure: the row stays in the store for audit but
            // is never retried.
            self.events.publish(EngineEvent::SettlementAbandoned {
                trade_id: entry.trade_id.clone(),
                token_id: entry.token_id.clone(),
                attempts,
            });
            self.positions
                .settlement_resolved(&entry.condition_id, &entry.token_id);
        } else if attempts >= self.config.alert_after_failures {
            self.events.publish(EngineEvent::SettlementDegraded {
                trade_id: entry.trade_id.clone(),
                token_id: entry.token_id.clone(),
                attempts,
                error: error.to_string(),
            });
        }
    }

    /// Exponential backoff with ±25% jitter.
    fn backoff(&self, attempt: u32) -> chrono::Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.config.base_retry.as_secs().saturating_mul(1u64 << exp);
        let capped = base.min(self.config.max_retry.as_secs());
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        chrono::Duration::seconds((capped as f64 * jitter).round() as i64)
    }

    /// Periodic claim loop.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(self.config.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Settlement manager stopped");
    }
}
