//! The exchange seam consumed by the trading core.
//!
//! The core never speaks the venue's wire protocol. Everything it needs
//! (book snapshots, a streaming book feed, order placement/cancellation,
//! balance, slot-market lookup) goes through the [`Exchange`] trait.
//! Adapters convert untyped wire JSON into these types at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{CryptoAsset, OrderBookLevel, Side, SlotMarket};

/// Errors surfaced by an exchange adapter.
///
/// The executor converts these into per-leg `Exception` outcomes; they never
/// propagate through the hot path as panics or bubbled errors.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("request rejected by exchange: {0}")]
    Rejected(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("market not found: {0}")]
    NotFound(String),

    #[error("connection failed: {0}")]
    Connection(String),
}

impl ExchangeError {
    /// Persistent errors escalate the circuit breaker instead of being
    /// retried implicitly by later opportunities.
    pub fn is_persistent(&self) -> bool {
        matches!(self, ExchangeError::Auth(_) | ExchangeError::Rejected(_))
    }
}

/// Order time-in-force accepted by the core.
///
/// Entries are always fill-or-kill; settlement sell-backs rest as GTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fill-or-kill: complete immediate fill or nothing.
    Fok,
    /// Good-till-cancelled limit order.
    Gtc,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Fok => write!(f, "FOK"),
            OrderType::Gtc => write!(f, "GTC"),
        }
    }
}

/// An order request passed to the exchange.
///
/// `limit_price` is exactly the price the caller decided on. Adapters must
/// not re-fetch the book to substitute a price and must not add slippage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Token to trade.
    pub token_id: String,
    /// Buy or sell.
    pub side: Side,
    /// Limit price (0, 1).
    pub limit_price: Decimal,
    /// Size in shares.
    pub size: Decimal,
    /// FOK for entries, GTC for settlement sell-backs.
    pub order_type: OrderType,
}

impl Order {
    /// Fill-or-kill buy at an exact limit price.
    pub fn fok_buy(token_id: impl Into<String>, limit_price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Buy,
            limit_price,
            size,
            order_type: OrderType::Fok,
        }
    }

    /// Fill-or-kill sell at an exact limit price.
    pub fn fok_sell(token_id: impl Into<String>, limit_price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Sell,
            limit_price,
            size,
            order_type: OrderType::Fok,
        }
    }

    /// Good-till-cancelled sell (settlement claim path).
    pub fn gtc_sell(token_id: impl Into<String>, limit_price: Decimal, size: Decimal) -> Self {
        Self {
            token_id: token_id.into(),
            side: Side::Sell,
            limit_price,
            size,
            order_type: OrderType::Gtc,
        }
    }

    /// Notional value at the limit price.
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.limit_price * self.size
    }
}

/// Outcome of a single order submission.
///
/// Under the FOK policy only `Matched`, `Failed` and `Exception` are
/// expected; `Live` means the order is resting on the book and must be
/// cancelled by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderOutcome {
    /// Fully and immediately filled.
    Matched {
        filled_size: Decimal,
        filled_cost: Decimal,
    },
    /// Resting on the book (anomalous under FOK).
    Live { order_id: String },
    /// Rejected or killed by the exchange.
    Failed { reason: String },
    /// Transport/adapter error captured as a value.
    Exception { error: String },
}

impl OrderOutcome {
    /// True only for a complete immediate fill.
    pub fn is_matched(&self) -> bool {
        matches!(self, OrderOutcome::Matched { .. })
    }

    /// Shares filled (zero unless matched).
    pub fn filled_size(&self) -> Decimal {
        match self {
            OrderOutcome::Matched { filled_size, .. } => *filled_size,
            _ => Decimal::ZERO,
        }
    }

    /// Cost/proceeds of the fill (zero unless matched).
    pub fn filled_cost(&self) -> Decimal {
        match self {
            OrderOutcome::Matched { filled_cost, .. } => *filled_cost,
            _ => Decimal::ZERO,
        }
    }

    /// Short status tag for persistence and logs.
    pub fn status_str(&self) -> &'static str {
        match self {
            OrderOutcome::Matched { .. } => "MATCHED",
            OrderOutcome::Live { .. } => "LIVE",
            OrderOutcome::Failed { .. } => "FAILED",
            OrderOutcome::Exception { .. } => "EXCEPTION",
        }
    }
}

/// Snapshot of one token's order book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Book {
    /// Bid levels, best first.
    pub bids: Vec<OrderBookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<OrderBookLevel>,
}

/// One streaming book update for a single token.
///
/// Updates replace the full visible book for that token. A binary market
/// has two tokens, so updates are keyed by `token_id`; the tracker maps the
/// token back to its market and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    /// Token the update applies to.
    pub token_id: String,
    /// Bid levels, best first.
    pub bids: Vec<OrderBookLevel>,
    /// Ask levels, best first.
    pub asks: Vec<OrderBookLevel>,
    /// Exchange timestamp of the update.
    pub ts: DateTime<Utc>,
}

/// Account balance snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable USDC.
    pub balance: Decimal,
    /// Approved allowance for order placement.
    pub allowance: Decimal,
}

/// Exchange operations consumed by the core. All operations are fallible.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Snapshot of the order book for a token.
    async fn get_book(&self, token_id: &str) -> Result<Book, ExchangeError>;

    /// Subscribe to streaming book updates for a set of tokens.
    ///
    /// The receiver yields updates until the underlying connection drops;
    /// a closed channel signals the tracker to resubscribe.
    async fn subscribe_book(
        &self,
        token_ids: Vec<String>,
    ) -> Result<mpsc::Receiver<BookUpdate>, ExchangeError>;

    /// Place an order. Must encode the FOK/GTC distinction, must never
    /// re-fetch the price internally, must never add implicit slippage.
    async fn place_order(&self, order: &Order) -> Result<OrderOutcome, ExchangeError>;

    /// Cancel a resting order by ID.
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// Current balance and allowance.
    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    /// Look up the slot market for an asset whose window ends at `end_ts`.
    async fn find_market(
        &self,
        asset: CryptoAsset,
        end_ts: i64,
    ) -> Result<SlotMarket, ExchangeError>;
}
