//! Configuration for the trading engine.
//!
//! Loads from a TOML file with `PAIR_*` environment variable overrides.
//! Startup misconfiguration is one of the two fatal error classes (the
//! other is store initialization), so `validate` is strict.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use pair_common::CryptoAsset;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Assets to monitor (parsed into [`CryptoAsset`]).
    pub assets: Vec<String>,

    /// Simulate placements: no exchange calls, records flagged `dry_run`.
    pub dry_run: bool,

    /// Logging level (trace/debug/info/warn/error).
    pub log_level: String,

    /// Market refresh cadence (seconds).
    pub market_refresh_secs: u64,

    /// Bounded opportunity queue capacity.
    pub opportunity_queue_capacity: usize,

    /// Trading parameters.
    pub trading: TradingConfig,

    /// Rebalancing parameters.
    pub rebalance: RebalanceSettings,

    /// Settlement parameters.
    pub settlement: SettlementSettings,

    /// Circuit breaker thresholds.
    pub breaker: BreakerSettings,

    /// Scheduled blackout window.
    pub blackout: BlackoutSettings,
}

/// Detection, sizing and execution parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Minimum `1 - yes_ask - no_ask` to emit an opportunity (USD).
    pub min_spread_usd: Decimal,

    /// Per-trade budget as a fraction of balance.
    pub balance_sizing_pct: Decimal,

    /// Hard cap per trade (USD).
    pub max_trade_size_usd: Decimal,

    /// Reject if a leg's notional would be below this (USD).
    pub min_trade_size_usd: Decimal,

    /// Cumulative cap per market window (USD).
    pub max_per_window_usd: Decimal,

    /// Fraction of displayed depth a trade may consume.
    pub max_liquidity_consumption_pct: Decimal,

    /// Joint timeout for dual-leg placement (seconds).
    pub parallel_fill_timeout_secs: u64,

    /// Feed silence beyond this marks a market stale (seconds).
    pub stale_threshold_secs: u64,

    /// Tranched entry for wide spreads.
    pub gradual_entry: GradualEntryConfig,
}

/// Gradual (tranched) entry parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GradualEntryConfig {
    pub enabled: bool,
    /// Number of tranches the pair is split into.
    pub tranches: u32,
    /// Delay between tranches (seconds).
    pub delay_secs: u64,
    /// Minimum spread (cents) before tranching applies.
    pub min_spread_cents: Decimal,
}

/// Rebalancing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebalanceSettings {
    /// Hedge ratio below which rebalancing is sought.
    pub threshold: Decimal,

    /// Minimum profit per share to execute a rebalance (USD).
    pub min_profit_per_share: Decimal,

    /// Maximum rebalance attempts per position.
    pub max_attempts: u32,

    /// No rebalancing within this many seconds of market end.
    pub no_go_secs_before_end: u64,

    /// Minimum blended entry spread to maintain when buying the deficit side.
    pub min_spread_usd: Decimal,

    /// Allow rebalancing less than the full imbalance when budget or
    /// liquidity caps the size.
    pub allow_partial_rebalance: bool,

    /// Sweep cadence (seconds).
    pub sweep_interval_secs: u64,
}

/// Settlement (claim) parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementSettings {
    /// Wait after market end before claiming (seconds).
    pub resolution_wait_secs: u64,

    /// Near-par sell price used for claims.
    pub claim_sell_price: Decimal,

    /// Initial retry backoff (seconds).
    pub base_retry_secs: u64,

    /// Maximum retry backoff (seconds).
    pub max_retry_secs: u64,

    /// Attempts before a row is abandoned.
    pub max_claim_attempts: u32,

    /// Consecutive failures before a degradation alert.
    pub alert_after_failures: u32,

    /// Claim sweep cadence (seconds).
    pub check_interval_secs: u64,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub warn_failures: u32,
    pub caution_failures: u32,
    pub halt_failures: u32,
    /// Daily loss thresholds (positive USD magnitudes).
    pub warn_loss_usd: Decimal,
    pub caution_loss_usd: Decimal,
    pub halt_loss_usd: Decimal,
    /// Hour (UTC) at which daily counters reset.
    pub daily_reset_hour_utc: u32,
}

/// Scheduled trading blackout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlackoutSettings {
    pub enabled: bool,
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
    /// IANA timezone name the window is expressed in.
    pub timezone: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            assets: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            dry_run: false,
            log_level: "info".to_string(),
            market_refresh_secs: 30,
            opportunity_queue_capacity: 100,
            trading: TradingConfig::default(),
            rebalance: RebalanceSettings::default(),
            settlement: SettlementSettings::default(),
            breaker: BreakerSettings::default(),
            blackout: BlackoutSettings::default(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            min_spread_usd: Decimal::new(2, 2),               // $0.02
            balance_sizing_pct: Decimal::new(25, 2),          // 0.25
            max_trade_size_usd: Decimal::new(25, 0),          // $25
            min_trade_size_usd: Decimal::new(3, 0),           // $3
            max_per_window_usd: Decimal::new(50, 0),          // $50
            max_liquidity_consumption_pct: Decimal::new(50, 2), // 0.50
            parallel_fill_timeout_secs: 10,
            stale_threshold_secs: 10,
            gradual_entry: GradualEntryConfig::default(),
        }
    }
}

impl Default for GradualEntryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tranches: 3,
            delay_secs: 30,
            min_spread_cents: Decimal::new(3, 0),
        }
    }
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            threshold: Decimal::new(80, 2),            // 0.80
            min_profit_per_share: Decimal::new(2, 2),  // $0.02
            max_attempts: 5,
            no_go_secs_before_end: 60,
            min_spread_usd: Decimal::new(2, 2),        // $0.02
            allow_partial_rebalance: true,
            sweep_interval_secs: 5,
        }
    }
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            resolution_wait_secs: 600,
            claim_sell_price: Decimal::new(99, 2), // $0.99
            base_retry_secs: 60,
            max_retry_secs: 3600,
            max_claim_attempts: 5,
            alert_after_failures: 3,
            check_interval_secs: 60,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            warn_failures: 3,
            caution_failures: 4,
            halt_failures: 5,
            warn_loss_usd: Decimal::new(50, 0),
            caution_loss_usd: Decimal::new(75, 0),
            halt_loss_usd: Decimal::new(100, 0),
            daily_reset_hour_utc: 0,
        }
    }
}

impl Default for BlackoutSettings {
    fn default() -> Self {
        // The venue restarts daily at 05:15 America/Chicago; stand down
        // for the surrounding half hour.
        Self {
            enabled: true,
            start_hour: 5,
            start_minute: 0,
            end_hour: 5,
            end_minute: 29,
            timezone: "America/Chicago".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: EngineConfig =
            toml::from_str(&raw).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Apply `PAIR_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PAIR_ASSETS") {
            self.assets = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("PAIR_DRY_RUN") {
            self.dry_run = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Ok(v) = std::env::var("PAIR_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("PAIR_MIN_SPREAD") {
            if let Ok(d) = Decimal::from_str(&v) {
                self.trading.min_spread_usd = d;
            }
        }
        if let Ok(v) = std::env::var("PAIR_MAX_TRADE_SIZE") {
            if let Ok(d) = Decimal::from_str(&v) {
                self.trading.max_trade_size_usd = d;
            }
        }
        if let Ok(v) = std::env::var("PAIR_MAX_PER_WINDOW") {
            if let Ok(d) = Decimal::from_str(&v) {
                self.trading.max_per_window_usd = d;
            }
        }
        if let Ok(v) = std::env::var("PAIR_BALANCE_SIZING_PCT") {
            if let Ok(d) = Decimal::from_str(&v) {
                self.trading.balance_sizing_pct = d;
            }
        }
    }

    /// Parsed asset list.
    pub fn parsed_assets(&self) -> Result<Vec<CryptoAsset>> {
        self.assets
            .iter()
            .map(|s| {
                CryptoAsset::from_str(s).map_err(|e| anyhow::anyhow!("Invalid asset: {}", e))
            })
            .collect()
    }

    /// Validate the configuration. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.assets.is_empty() {
            bail!("No assets configured");
        }
        self.parsed_assets()?;

        let t = &self.trading;
        if t.min_spread_usd <= Decimal::ZERO || t.min_spread_usd >= Decimal::ONE {
            bail!("min_spread_usd must be in (0, 1)");
        }
        if t.balance_sizing_pct <= Decimal::ZERO || t.balance_sizing_pct > Decimal::ONE {
            bail!("balance_sizing_pct must be in (0, 1]");
        }
        if t.max_liquidity_consumption_pct <= Decimal::ZERO
            || t.max_liquidity_consumption_pct > Decimal::ONE
        {
            bail!("max_liquidity_consumption_pct must be in (0, 1]");
        }
        if t.min_trade_size_usd <= Decimal::ZERO || t.max_trade_size_usd < t.min_trade_size_usd {
            bail!("trade size bounds invalid: min={} max={}", t.min_trade_size_usd, t.max_trade_size_usd);
        }
        if t.max_per_window_usd < t.max_trade_size_usd {
            bail!("max_per_window_usd must be >= max_trade_size_usd");
        }
        if t.gradual_entry.enabled && t.gradual_entry.tranches == 0 {
            bail!("gradual_entry.tranches must be >= 1");
        }

        let b = &self.breaker;
        if !(b.warn_failures <= b.caution_failures && b.caution_failures <= b.halt_failures) {
            bail!("breaker failure thresholds must be non-decreasing");
        }
        if !(b.warn_loss_usd <= b.caution_loss_usd && b.caution_loss_usd <= b.halt_loss_usd) {
            bail!("breaker loss thresholds must be non-decreasing");
        }
        if b.daily_reset_hour_utc >= 24 {
            bail!("daily_reset_hour_utc must be < 24");
        }

        let r = &self.rebalance;
        if r.threshold <= Decimal::ZERO || r.threshold > Decimal::ONE {
            bail!("rebalance.threshold must be in (0, 1]");
        }

        let s = &self.settlement;
        if s.claim_sell_price <= Decimal::ZERO || s.claim_sell_price >= Decimal::ONE {
            bail!("claim_sell_price must be in (0, 1)");
        }
        if s.base_retry_secs == 0 || s.max_retry_secs < s.base_retry_secs {
            bail!("settlement retry bounds invalid");
        }

        let bl = &self.blackout;
        if bl.enabled {
            if bl.start_hour >= 24 || bl.end_hour >= 24 || bl.start_minute >= 60 || bl.end_minute >= 60 {
                bail!("blackout window out of range");
            }
            if bl.timezone.parse::<chrono_tz::Tz>().is_err() {
                bail!("unknown blackout timezone: {}", bl.timezone);
            }
        }

        Ok(())
    }

    /// Parallel fill timeout as a `Duration`.
    pub fn parallel_fill_timeout(&self) -> Duration {
        Duration::from_secs(self.trading.parallel_fill_timeout_secs)
    }

    /// Stale threshold as a `Duration`.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.trading.stale_threshold_secs)
    }
}
