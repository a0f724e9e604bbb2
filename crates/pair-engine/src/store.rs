//! Durable state seam.
//!
//! The core writes trades, settlement rows, rebalance fills and the circuit
//! breaker snapshot through the [`Store`] trait and never sees the storage
//! engine behind it. `MemoryStore` is the in-repo implementation used by
//! tests and dry runs; everything in memory must be reconstructable from a
//! `Store` on startup (see `recovery`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pair_common::{CryptoAsset, Outcome};

use crate::risk::BreakerLevel;

/// Store failures. The executor treats these as transient and raises them
/// to the circuit breaker; it never silently discards a known fill.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    Write(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("row not found: {0}")]
    NotFound(String),
}

/// How a dual-leg execution resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Both legs matched.
    FullFill,
    /// Exactly one leg matched.
    OneLegOnly,
    /// Neither leg matched.
    Failed,
    /// Dry-run placement.
    Simulated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::FullFill => "full_fill",
            ExecutionStatus::OneLegOnly => "one_leg_only",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Simulated => "simulated",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of one dual-leg execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique trade id.
    pub trade_id: String,
    pub created_at: DateTime<Utc>,
    pub condition_id: String,
    pub asset: CryptoAsset,
    pub market_slug: String,
    pub market_end_time: DateTime<Utc>,
    /// Token ids, kept so positions can be reconstructed after a restart.
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Limit prices used for the legs (exactly the opportunity prices).
    pub yes_price: Decimal,
    pub no_price: Decimal,
    /// Intended share count per leg (equal by construction).
    pub intended_shares: Decimal,
    /// Actual filled shares per leg.
    pub yes_shares: Decimal,
    pub no_shares: Decimal,
    /// Intended total cost and actual per-leg costs.
    pub intended_cost: Decimal,
    pub yes_cost: Decimal,
    pub no_cost: Decimal,
    pub spread_cents: Decimal,
    pub execution_status: ExecutionStatus,
    /// Raw per-leg order statuses (MATCHED / FAILED / EXCEPTION / LIVE / SIMULATED).
    pub yes_order_status: String,
    pub no_order_status: String,
    /// `min(yes, no) / max(yes, no)`, 0 when one side is empty.
    pub hedge_ratio: Decimal,
    /// Pre-fill depth at the limit price and total ask depth, per side.
    pub yes_liquidity_at_price: Decimal,
    pub no_liquidity_at_price: Decimal,
    pub yes_book_depth_total: Decimal,
    pub no_book_depth_total: Decimal,
    pub dry_run: bool,
}

impl TradeRecord {
    /// Hedge ratio for a pair of share counts.
    pub fn hedge_ratio_of(yes: Decimal, no: Decimal) -> Decimal {
        let max = yes.max(no);
        if max.is_zero() {
            return Decimal::ZERO;
        }
        yes.min(no) / max
    }
}

/// A position side awaiting claim after market resolution.
///
/// Keyed by `(trade_id, token_id)`; appended when a leg fills, mutated only
/// by the settlement manager (claim state) and by share adjustments from
/// rebalance fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEntry {
    pub trade_id: String,
    pub condition_id: String,
    pub token_id: String,
    pub side: Outcome,
    pub asset: CryptoAsset,
    pub shares: Decimal,
    pub entry_price: Decimal,
    pub entry_cost: Decimal,
    pub market_end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claim_proceeds: Option<Decimal>,
    pub claim_profit: Option<Decimal>,
    pub claim_attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time of the next claim attempt (exponential backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SettlementEntry {
    pub fn new(
        trade_id: impl Into<String>,
        condition_id: impl Into<String>,
        token_id: impl Into<String>,
        side: Outcome,
        asset: CryptoAsset,
        shares: Decimal,
        entry_price: Decimal,
        entry_cost: Decimal,
        market_end_time: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            condition_id: condition_id.into(),
            token_id: token_id.into(),
            side,
            asset,
            shares,
            entry_price,
            entry_cost,
            market_end_time,
            created_at,
            claimed: false,
            claimed_at: None,
            claim_proceeds: None,
            claim_profit: None,
            claim_attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// A single rebalancing fill attempt, persisted for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub trade_id: String,
    pub condition_id: String,
    pub attempted_at: DateTime<Utc>,
    /// SELL_YES / BUY_NO / SELL_NO / BUY_YES.
    pub action: String,
    pub shares: Decimal,
    pub price: Decimal,
    /// SUCCESS / FAILED.
    pub status: String,
    pub filled_shares: Decimal,
    pub profit: Decimal,
    pub error: Option<String>,
}

/// Persisted circuit breaker counters; restores the level within a day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub day: NaiveDate,
    pub level: BreakerLevel,
    pub consecutive_failures: u32,
    pub daily_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage consumed by the core.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a trade and its settlement rows in one transaction.
    /// Idempotent on `trade_id`; settlement rows are unique per
    /// `(trade_id, token_id)`.
    async fn save_trade(
        &self,
        trade: &TradeRecord,
        settlements: &[SettlementEntry],
    ) -> Result<(), StoreError>;

    /// Fetch a trade by id.
    async fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRecord>, StoreError>;

    /// Recent trades for diagnostics (not on the hot path).
    async fn get_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;

    /// Persist one rebalance attempt.
    async fn save_rebalance(&self, record: &RebalanceRecord) -> Result<(), StoreError>;

    /// Append a settlement row outside the trade transaction (used when a
    /// rebalance buy opens a side the entry never filled). Unique on
    /// `(trade_id, token_id)`; duplicates are ignored.
    async fn enqueue_settlement(&self, entry: &SettlementEntry) -> Result<(), StoreError>;

    /// Adjust a settlement row's shares/cost after a rebalance fill so the
    /// claim queue matches held inventory.
    async fn adjust_settlement_shares(
        &self,
        trade_id: &str,
        token_id: &str,
        delta_shares: Decimal,
        delta_cost: Decimal,
    ) -> Result<(), StoreError>;

    /// All rows not yet claimed (startup recovery).
    async fn get_unclaimed_settlements(&self) -> Result<Vec<SettlementEntry>, StoreError>;

    /// Rows eligible to claim now: market ended at least `wait` ago, not
    /// claimed, under the attempt cap, and past any scheduled backoff.
    async fn get_claimable(
        &self,
        now: DateTime<Utc>,
        wait: Duration,
        max_attempts: u32,
    ) -> Result<Vec<SettlementEntry>, StoreError>;

    /// Mark a row claimed. `claimed` flips true exactly once.
    async fn mark_claimed(
        &self,
        trade_id: &str,
        token_id: &str,
        proceeds: Decimal,
        profit: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a failed claim attempt and schedule the next one.
    async fn record_claim_attempt(
        &self,
        trade_id: &str,
        token_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Persist / load the circuit breaker snapshot.
    async fn save_circuit_breaker(&self, snap: &CircuitBreakerSnapshot) -> Result<(), StoreError>;
    async fn load_circuit_breaker(&self) -> Result<Option<CircuitBreakerSnapshot>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    trades: HashMap<String, TradeRecord>,
    trade_order: Vec<String>,
    settlements: HashMap<(String, String), SettlementEntry>,
    rebalances: Vec<RebalanceRecord>,
    breaker: Option<CircuitBreakerSnapshot>,
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    /// When set, every write fails (failure-path testing).
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// All rebalance records (test inspection).
    pub fn rebalances(&self) -> Vec<RebalanceRecord> {
        self.inner.lock().rebalances.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if *self.fail_writes.lock() {
            return Err(StoreError::Write("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_trade(
        &self,
        trade: &TradeRecord,
        settlements: &[SettlementEntry],
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if inner.trades.contains_key(&trade.trade_id) {
            // Idempotent on trade_id.
            return Ok(());
        }
        inner.trades.insert(trade.trade_id.clone(), trade.clone());
        inner.trade_order.push(trade.trade_id.clone());
        for entry in settlements {
            let key = (entry.trade_id.clone(), entry.token_id.clone());
            inner.settlements.entry(key).or_insert_with(|| entry.clone());
        }
        Ok(())
    }

    async fn get_trade(&self, trade_id: &str) -> Result<Option<TradeRecord>, StoreError> {
        Ok(self.inner.lock().trades.get(trade_id).cloned())
    }

    async fn get_trades(&self, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .trade_order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| inner.trades.get(id).cloned())
            .collect())
    }

    async fn save_rebalance(&self, record: &RebalanceRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().rebalances.push(record.clone());
        Ok(())
    }

    async fn enqueue_settlement(&self, entry: &SettlementEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let key = (entry.trade_id.clone(), entry.token_id.clone());
        inner.settlements.entry(key).or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn adjust_settlement_shares(
        &self,
        trade_id: &str,
        token_id: &str,
        delta_shares: Decimal,
        delta_cost: Decimal,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let key = (trade_id.to_string(), token_id.to_string());
        let entry = inner
            .settlements
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{trade_id}/{token_id}")))?;
        entry.shares = (entry.shares + delta_shares).max(Decimal::ZERO);
        entry.entry_cost = (entry.entry_cost + delta_cost).max(Decimal::ZERO);
        if entry.shares > Decimal::ZERO {
            entry.entry_price = entry.entry_cost / entry.shares;
        }
        Ok(())
    }

    async fn get_unclaimed_settlements(&self) -> Result<Vec<SettlementEntry>, StoreError> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .settlements
            .values()
            .filter(|e| !e.claimed)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn get_claimable(
        &self,
        now: DateTime<Utc>,
        wait: Duration,
        max_attempts: u32,
    ) -> Result<Vec<SettlementEntry>, StoreError> {
        let wait = chrono::Duration::from_std(wait).unwrap_or_default();
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .settlements
            .values()
            .filter(|e| {
                !e.claimed
                    && e.claim_attempts < max_attempts
                    && now >= e.market_end_time + wait
                    && e.next_attempt_at.map_or(true, |t| now >= t)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.market_end_time.cmp(&b.market_end_time));
        Ok(rows)
    }

    async fn mark_claimed(
        &self,
        trade_id: &str,
        token_id: &str,
        proceeds: Decimal,
        profit: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let key = (trade_id.to_string(), token_id.to_string());
        let entry = inner
            .settlements
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{trade_id}/{token_id}")))?;
        if entry.claimed {
            return Ok(());
        }
        entry.claimed = true;
        entry.claimed_at = Some(at);
        entry.claim_proceeds = Some(proceeds);
        entry.claim_profit = Some(profit);
        Ok(())
    }

    async fn record_claim_attempt(
        &self,
        trade_id: &str,
        token_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let key = (trade_id.to_string(), token_id.to_string());
        let entry = inner
            .settlements
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{trade_id}/{token_id}")))?;
        entry.claim_attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = Some(next_attempt_at);
        Ok(entry.claim_attempts)
    }

    async fn save_circuit_breaker(&self, snap: &CircuitBreakerSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().breaker = Some(snap.clone());
        Ok(())
    }

    async fn load_circuit_breaker(&self) -> Result<Option<CircuitBreakerSnapshot>, StoreError> {
        Ok(self.inner.lock().breaker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(trade_id: &str) -> TradeRecord {
        TradeRecord {
            trade_id: trade_id.to_string(),
            created_at: Utc::now(),
            condition_id: "m1".to_string(),
            asset: CryptoAsset::Btc,
            market_slug: "btc-updown-15m-1700000100".to_string(),
            market_end_time: Utc::now() + chrono::Duration::minutes(10),
            yes_token_id: "tok-yes".to_string(),
            no_token_id: "tok-no".to_string(),
            yes_price: dec!(0.48),
            no_price: dec!(0.49),
            intended_shares: dec!(20.61),
            yes_shares: dec!(20.61),
            no_shares: dec!(20.61),
            intended_cost: dec!(19.99),
            yes_cost: dec!(9.89),
            no_cost: dec!(10.10),
            spread_cents: dec!(3),
            execution_status: ExecutionStatus::FullFill,
            yes_order_status: "MATCHED".to_string(),
            no_order_status: "MATCHED".to_string(),
            hedge_ratio: Decimal::ONE,
            yes_liquidity_at_price: dec!(100),
            no_liquidity_at_price: dec!(100),
            yes_book_depth_total: dec!(500),
            no_book_depth_total: dec!(500),
            dry_run: false,
        }
    }

    fn entry(trade_id: &str, token_id: &str, side: Outcome, end: DateTime<Utc>) -> SettlementEntry {
        SettlementEntry::new(
            trade_id,
            "m1",
            token_id,
            side,
            CryptoAsset::Btc,
            dec!(20),
            dec!(0.48),
            dec!(9.60),
            end,
            Utc::now(),
        )
    }

    #[test]
    fn test_hedge_ratio() {
        assert_eq!(TradeRecord::hedge_ratio_of(dec!(20), dec!(20)), dec!(1));
        assert_eq!(TradeRecord::hedge_ratio_of(dec!(20), dec!(0)), dec!(0));
        assert_eq!(TradeRecord::hedge_ratio_of(dec!(0), dec!(0)), dec!(0));
        assert_eq!(TradeRecord::hedge_ratio_of(dec!(10), dec!(20)), dec!(0.5));
    }

    #[tokio::test]
    async fn test_trade_round_trip() {
        let store = MemoryStore::new();
        let t = trade("t-1");
        store.save_trade(&t, &[]).await.unwrap();
        let loaded = store.get_trade("t-1").await.unwrap().unwrap();
        assert_eq!(loaded, t);
    }

    #[tokio::test]
    async fn test_save_trade_idempotent() {
        let store = MemoryStore::new();
        let t = trade("t-1");
        store.save_trade(&t, &[]).await.unwrap();
        let mut t2 = trade("t-1");
        t2.yes_shares = dec!(999);
        store.save_trade(&t2, &[]).await.unwrap();
        // First write wins.
        let loaded = store.get_trade("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.yes_shares, dec!(20.61));
        assert_eq!(store.get_trades(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_lifecycle() {
        let store = MemoryStore::new();
        let end = Utc::now();
        let t = trade("t-1");
        let rows = vec![
            entry("t-1", "tok-yes", Outcome::Yes, end),
            entry("t-1", "tok-no", Outcome::No, end),
        ];
        store.save_trade(&t, &rows).await.unwrap();

        assert_eq!(store.get_unclaimed_settlements().await.unwrap().len(), 2);

        // Not claimable before the resolution wait has passed.
        let wait = Duration::from_secs(600);
        let too_soon = end + chrono::Duration::seconds(60);
        assert!(store.get_claimable(too_soon, wait, 5).await.unwrap().is_empty());

        let ready = end + chrono::Duration::seconds(601);
        assert_eq!(store.get_claimable(ready, wait, 5).await.unwrap().len(), 2);

        store
            .mark_claimed("t-1", "tok-yes", dec!(19.80), dec!(10.20), ready)
            .await
            .unwrap();
        let unclaimed = store.get_unclaimed_settlements().await.unwrap();
        assert_eq!(unclaimed.len(), 1);
        assert_eq!(unclaimed[0].token_id, "tok-no");

        // Claim-then-reload preserves claim fields.
        let all_claimable = store.get_claimable(ready, wait, 5).await.unwrap();
        assert_eq!(all_claimable.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_attempt_backoff_filter() {
        let store = MemoryStore::new();
        let end = Utc::now();
        store
            .save_trade(&trade("t-1"), &[entry("t-1", "tok-yes", Outcome::Yes, end)])
            .await
            .unwrap();

        let ready = end + chrono::Duration::seconds(601);
        let next = ready + chrono::Duration::seconds(120);
        let attempts = store
            .record_claim_attempt("t-1", "tok-yes", "not filled", next)
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        // Still backing off.
        let wait = Duration::from_secs(600);
        assert!(store.get_claimable(ready, wait, 5).await.unwrap().is_empty());
        // Past the scheduled retry.
        assert_eq!(store.get_claimable(next, wait, 5).await.unwrap().len(), 1);

        // Attempt cap excludes the row.
        for _ in 0..4 {
            store
                .record_claim_attempt("t-1", "tok-yes", "still not filled", next)
                .await
                .unwrap();
        }
        assert!(store.get_claimable(next, wait, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adjust_settlement_shares() {
        let store = MemoryStore::new();
        let end = Utc::now();
        store
            .save_trade(&trade("t-1"), &[entry("t-1", "tok-yes", Outcome::Yes, end)])
            .await
            .unwrap();

        // Sell 5 of 20 shares that cost $0.48 each.
        store
            .adjust_settlement_shares("t-1", "tok-yes", dec!(-5), dec!(-2.40))
            .await
            .unwrap();
        let rows = store.get_unclaimed_settlements().await.unwrap();
        assert_eq!(rows[0].shares, dec!(15));
        assert_eq!(rows[0].entry_cost, dec!(7.20));
        assert_eq!(rows[0].entry_price, dec!(0.48));
    }

    #[tokio::test]
    async fn test_circuit_breaker_snapshot_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_circuit_breaker().await.unwrap().is_none());

        let snap = CircuitBreakerSnapshot {
            day: Utc::now().date_naive(),
            level: BreakerLevel::Warning,
            consecutive_failures: 3,
            daily_pnl: dec!(-12.50),
            updated_at: Utc::now(),
        };
        store.save_circuit_breaker(&snap).await.unwrap();
        assert_eq!(store.load_circuit_breaker().await.unwrap().unwrap(), snap);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.save_trade(&trade("t-1"), &[]).await.is_err());
        store.set_fail_writes(false);
        assert!(store.save_trade(&trade("t-1"), &[]).await.is_ok());
    }
}
