//! Shared types for the pair trading engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod exchange;
pub mod types;

pub use exchange::{
    Balance, Book, BookUpdate, Exchange, ExchangeError, Order, OrderOutcome, OrderType,
};
pub use types::{CryptoAsset, OrderBookLevel, Outcome, Side, SlotMarket, SLOT_SECS};
