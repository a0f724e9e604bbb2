//! Core vocabulary types shared across the workspace.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Duration of one market slot in seconds (15 minutes).
pub const SLOT_SECS: i64 = 900;

/// Supported underlying assets for 15-minute up/down markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CryptoAsset {
    Btc,
    Eth,
    Sol,
    Xrp,
}

impl CryptoAsset {
    /// Returns the display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoAsset::Btc => "BTC",
            CryptoAsset::Eth => "ETH",
            CryptoAsset::Sol => "SOL",
            CryptoAsset::Xrp => "XRP",
        }
    }

    /// Lowercase form used in market slugs.
    pub fn slug_str(&self) -> &'static str {
        match self {
            CryptoAsset::Btc => "btc",
            CryptoAsset::Eth => "eth",
            CryptoAsset::Sol => "sol",
            CryptoAsset::Xrp => "xrp",
        }
    }
}

impl std::fmt::Display for CryptoAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CryptoAsset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BTC" => Ok(CryptoAsset::Btc),
            "ETH" => Ok(CryptoAsset::Eth),
            "SOL" => Ok(CryptoAsset::Sol),
            "XRP" => Ok(CryptoAsset::Xrp),
            _ => Err(format!("Unknown asset: {}", s)),
        }
    }
}

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome type for binary markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

/// A single level in an order book (price + quantity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    /// Price in USDC (0.00 to 1.00).
    pub price: Decimal,
    /// Quantity available at this price.
    pub size: Decimal,
}

impl OrderBookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Total cost to fill this level.
    #[inline]
    pub fn cost(&self) -> Decimal {
        self.price * self.size
    }
}

/// A 15-minute up/down market aligned to a slot boundary.
///
/// Immutable once created: `window_end - window_start` is always one slot,
/// and the YES/NO token ids are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMarket {
    /// Condition ID identifying this market on the exchange.
    pub condition_id: String,
    /// Deterministic market slug.
    pub slug: String,
    /// The asset this market tracks.
    pub asset: CryptoAsset,
    /// Token ID for the YES outcome.
    pub yes_token_id: String,
    /// Token ID for the NO outcome.
    pub no_token_id: String,
    /// When the window opens.
    pub window_start: DateTime<Utc>,
    /// When the window closes (settlement).
    pub window_end: DateTime<Utc>,
}

impl SlotMarket {
    /// Epoch second of the slot containing `now` (floored to a 15-minute boundary).
    pub fn slot_ts(now: DateTime<Utc>) -> i64 {
        (now.timestamp() / SLOT_SECS) * SLOT_SECS
    }

    /// Deterministic slug for the market whose window ends at `end_ts`.
    pub fn slug_for(asset: CryptoAsset, end_ts: i64) -> String {
        format!("{}-updown-15m-{}", asset.slug_str(), end_ts)
    }

    /// Token ID for the given outcome.
    pub fn token_id(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.yes_token_id,
            Outcome::No => &self.no_token_id,
        }
    }

    /// Outcome for a token ID, if it belongs to this market.
    pub fn outcome_for(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.yes_token_id {
            Some(Outcome::Yes)
        } else if token_id == self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }

    /// Seconds remaining until window close (0 if already past).
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.window_end - now).num_seconds().max(0)
    }

    /// Returns true if the window is currently open.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_start && now < self.window_end
    }

    /// Returns true if the window has closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }

    /// Build the window bounds for the slot ending at `end_ts`.
    pub fn window_for_end(end_ts: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = Utc
            .timestamp_opt(end_ts, 0)
            .single()
            .unwrap_or_else(Utc::now);
        (end - chrono::Duration::seconds(SLOT_SECS), end)
    }
}
