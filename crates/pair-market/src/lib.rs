//! Market discovery and order-book state tracking.
//!
//! This crate owns everything between the exchange feed and the strategy:
//! slot-aligned market enumeration, per-market book state, and staleness
//! detection.

pub mod finder;
pub mod orderbook;
pub mod tracker;

pub use finder::{FinderConfig, FinderEvent, MarketFinder};
pub use orderbook::OrderBook;
pub use tracker::{BookEvent, BookTracker, MarketState, TrackerConfig};
