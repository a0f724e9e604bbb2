//! Domain event publication.
//!
//! Fire-and-forget fan-out to whoever subscribes (metrics, logs, UIs).
//! Publishing never blocks and never fails the caller; the engine's
//! correctness does not depend on any consumer being present.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use pair_common::CryptoAsset;

use crate::risk::BreakerLevel;
use crate::store::ExecutionStatus;

/// Events published by the engine components.
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    OpportunityDetected {
        condition_id: String,
        asset: CryptoAsset,
        yes_ask: Decimal,
        no_ask: Decimal,
        spread_cents: Decimal,
    },
    /// The bounded opportunity queue was full; the candidate was dropped.
    OpportunityDropped { condition_id: String },
    OpportunityRejected {
        condition_id: String,
        reason: String,
    },
    OrderPlaced {
        condition_id: String,
        token_id: String,
        side: String,
        limit_price: Decimal,
        size: Decimal,
    },
    OrderMatched {
        condition_id: String,
        token_id: String,
        filled_size: Decimal,
        filled_cost: Decimal,
    },
    TradeRecorded {
        trade_id: String,
        condition_id: String,
        status: ExecutionStatus,
        hedge_ratio: Decimal,
        dry_run: bool,
    },
    CircuitBreakerChanged {
        level: BreakerLevel,
        consecutive_failures: u32,
        daily_pnl: Decimal,
        reason: String,
    },
    SettlementClaimed {
        trade_id: String,
        token_id: String,
        proceeds: Decimal,
        profit: Decimal,
    },
    /// Repeated claim failures on one row.
    SettlementDegraded {
        trade_id: String,
        token_id: String,
        attempts: u32,
        error: String,
    },
    /// A row hit the attempt cap and will not be retried.
    SettlementAbandoned {
        trade_id: String,
        token_id: String,
        attempts: u32,
    },
    Rebalanced {
        trade_id: String,
        condition_id: String,
        action: String,
        shares: Decimal,
        price: Decimal,
        profit: Decimal,
        hedge_ratio: Decimal,
    },
    WebsocketReconnected { tokens: usize },
    MarketStale {
        condition_id: String,
        asset: CryptoAsset,
    },
    /// Market lookup failed; previous set kept.
    FinderDegraded {
        asset: CryptoAsset,
        error: String,
    },
    /// A store write failed on the trade path.
    StoreDegraded { context: String, error: String },
    /// A FOK order came back LIVE; it was cancelled.
    FokAnomaly {
        token_id: String,
        order_id: String,
    },
    /// Timestamped shutdown marker.
    ShuttingDown { at: DateTime<Utc> },
}

/// Fire-and-forget event publisher.
///
/// Thin wrapper over a broadcast channel: slow subscribers lag and lose
/// events rather than back-pressuring the publisher.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never blocks; dropped if nobody listens.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (diagnostics only).
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}
