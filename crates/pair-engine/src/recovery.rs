//! Startup recovery.
//!
//! In-memory state must be reconstructable from the store plus a fresh
//! book snapshot: unclaimed settlement rows rebuild the claim queue and
//! the open positions, and the circuit breaker resumes its day-bucket
//! counters so a restart within a day preserves the level.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use pair_common::{Outcome, SlotMarket};

use crate::position::{ActivePosition, PositionManager};
use crate::risk::CircuitBreaker;
use crate::store::{SettlementEntry, Store, StoreError};

/// What recovery reconstituted.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    /// Open positions restored into the position manager.
    pub open_positions: usize,
    /// Unclaimed settlement rows found.
    pub unclaimed_rows: usize,
    /// Whether the circuit breaker snapshot applied (same day bucket).
    pub breaker_restored: bool,
    /// Markets referenced by open positions (for book subscription).
    pub markets: Vec<SlotMarket>,
}

/// Restore positions, settlement queue and circuit breaker from the store.
pub async fn recover(
    store: &dyn Store,
    positions: &PositionManager,
    breaker: &CircuitBreaker,
    now: DateTime<Utc>,
) -> Result<RecoveredState, StoreError> {
    let breaker_restored = match store.load_circuit_breaker().await? {
        Some(snapshot) => breaker.restore(&snapshot, now),
        None => false,
    };

    let rows = store.get_unclaimed_settlements().await?;
    let unclaimed_rows = rows.len();

    let mut by_trade: HashMap<String, Vec<SettlementEntry>> = HashMap::new();
    for row in rows {
        by_trade.entry(row.trade_id.clone()).or_default().push(row);
    }

    let mut open_positions = 0;
    let mut markets = Vec::new();

    for (trade_id, rows) in by_trade {
        let Some(trade) = store.get_trade(&trade_id).await? else {
            warn!(trade_id = %trade_id, "Settlement rows without a trade record; skipping");
            continue;
        };

        let (window_start, _) =
            SlotMarket::window_for_end(trade.market_end_time.timestamp());
        let market = SlotMarket {
            condition_id: trade.condition_id.clone(),
            slug: trade.market_slug.clone(),
            asset: trade.asset,
            yes_token_id: trade.yes_token_id.clone(),
            no_token_id: trade.no_token_id.clone(),
            window_start,
            window_end: trade.market_end_time,
        };

        // Share counts come from the settlement rows (rebalance fills keep
        // them current), not from the original trade record.
        let mut yes_shares = Decimal::ZERO;
        let mut yes_avg = trade.yes_price;
        let mut no_shares = Decimal::ZERO;
        let mut no_avg = trade.no_price;
        let mut pending: HashSet<String> = HashSet::new();
        for row in &rows {
            match row.side {
                Outcome::Yes => {
                    yes_shares = row.shares;
                    yes_avg = row.entry_price;
                }
                Outcome::No => {
                    no_shares = row.shares;
                    no_avg = row.entry_price;
                }
            }
            pending.insert(row.token_id.clone());
        }

        // The admitted budget is not persisted; the entry's intended cost
        // is the closest durable stand-in for rebalance capacity.
        positions.restore(ActivePosition::restored(
            trade_id,
            market.clone(),
            yes_shares,
            no_shares,
            yes_avg,
            no_avg,
            trade.intended_cost,
            trade.created_at,
            pending,
        ));
        open_positions += 1;
        markets.push(market);
    }

    info!(
        open_positions,
        unclaimed_rows, breaker_restored, "Recovery complete"
    );

    Ok(RecoveredState {
        open_positions,
        unclaimed_rows,
        breaker_restored,
        markets,
    })
}
