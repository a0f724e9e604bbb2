//! Full-depth order book for a single token.
//!
//! Maintains sorted bid/ask levels and provides the depth queries the sizer
//! and executor need (depth at a limit price, cost to walk the book).

use pair_common::{OrderBookLevel, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order book with multiple price levels for one token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    /// Bid levels sorted by price descending (best bid first).
    pub bids: Vec<OrderBookLevel>,
    /// Ask levels sorted by price ascending (best ask first).
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Best bid price (None if no bids).
    #[inline]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price (None if no asks).
    #[inline]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Best bid size.
    #[inline]
    pub fn best_bid_size(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.size)
    }

    /// Best ask size.
    #[inline]
    pub fn best_ask_size(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.size)
    }

    /// Check if the book has both a bid and an ask.
    pub fn is_valid(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Total bid depth (sum of all bid sizes).
    pub fn bid_depth(&self) -> Decimal {
        self.bids.iter().map(|l| l.size).sum()
    }

    /// Total ask depth (sum of all ask sizes).
    pub fn ask_depth(&self) -> Decimal {
        self.asks.iter().map(|l| l.size).sum()
    }

    /// Shares available to buy at or below `limit_price`.
    ///
    /// This is the liquidity a limit buy at `limit_price` could consume.
    pub fn ask_depth_at_or_below(&self, limit_price: Decimal) -> Decimal {
        self.asks
            .iter()
            .take_while(|l| l.price <= limit_price)
            .map(|l| l.size)
            .sum()
    }

    /// Shares that can be sold at or above `limit_price`.
    pub fn bid_depth_at_or_above(&self, limit_price: Decimal) -> Decimal {
        self.bids
            .iter()
            .take_while(|l| l.price >= limit_price)
            .map(|l| l.size)
            .sum()
    }

    /// Cost to buy `target_size` shares by walking the ask book.
    ///
    /// Returns (shares_filled, total_cost).
    pub fn cost_to_buy(&self, target_size: Decimal) -> (Decimal, Decimal) {
        let mut remaining = target_size;
        let mut total_cost = Decimal::ZERO;
        let mut filled = Decimal::ZERO;

        for level in &self.asks {
            if remaining <= Decimal::ZERO {
                break;
            }
            let fill = remaining.min(level.size);
            total_cost += fill * level.price;
            filled += fill;
            remaining -= fill;
        }

        (filled, total_cost)
    }

    /// Proceeds from selling `target_size` shares by walking the bid book.
    ///
    /// Returns (shares_filled, total_proceeds).
    pub fn proceeds_to_sell(&self, target_size: Decimal) -> (Decimal, Decimal) {
        let mut remaining = target_size;
        let mut total = Decimal::ZERO;
        let mut filled = Decimal::ZERO;

        for level in &self.bids {
            if remaining <= Decimal::ZERO {
                break;
            }
            let fill = remaining.min(level.size);
            total += fill * level.price;
            filled += fill;
            remaining -= fill;
        }

        (filled, total)
    }

    /// Replace the whole book with a snapshot, re-sorting both sides.
    pub fn apply_snapshot(&mut self, bids: Vec<OrderBookLevel>, asks: Vec<OrderBookLevel>) {
        self.bids = bids;
        self.asks = asks;
        self.sort_levels();
    }

    /// Update a single level; size zero removes it.
    pub fn apply_delta(&mut self, side: Side, price: Decimal, size: Decimal) {
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        levels.retain(|l| l.price != price);
        if size > Decimal::ZERO {
            levels.push(OrderBookLevel::new(price, size));
        }

        self.sort_levels();
    }

    fn sort_levels(&mut self) {
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
    }
}
