//! Slot-aligned market discovery.
//!
//! 15-minute markets are keyed by the epoch second their window ends at:
//! `end_ts = (now / 900) * 900 + 900`. The finder asks the exchange for the
//! current and next window per configured asset, memoizes hits per
//! `(asset, end_ts)` so a market is only looked up once, and prunes markets
//! whose windows have closed. Lookup errors are soft: the previous market
//! set stays intact and a degradation event is emitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pair_common::{CryptoAsset, Exchange, ExchangeError, SlotMarket, SLOT_SECS};

/// Finder configuration.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Assets to enumerate markets for.
    pub assets: Vec<CryptoAsset>,
    /// Refresh cadence.
    pub refresh_interval: Duration,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            assets: vec![CryptoAsset::Btc, CryptoAsset::Eth, CryptoAsset::Sol],
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Events published by the finder.
#[derive(Debug, Clone)]
pub enum FinderEvent {
    /// A new slot market was discovered.
    Discovered(SlotMarket),
    /// A market's window closed and it was dropped.
    Expired { condition_id: String },
    /// A lookup failed; the previous market set is unchanged.
    Degraded { asset: CryptoAsset, error: String },
}

/// Enumerates tradeable slot markets per asset.
pub struct MarketFinder {
    exchange: Arc<dyn Exchange>,
    config: FinderConfig,
    /// Memoized lookups keyed by (asset, window end ts).
    known: Mutex<HashMap<(CryptoAsset, i64), SlotMarket>>,
    events_tx: mpsc::Sender<FinderEvent>,
}

impl MarketFinder {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: FinderConfig,
        events_tx: mpsc::Sender<FinderEvent>,
    ) -> Self {
        Self {
            exchange,
            config,
            known: Mutex::new(HashMap::new()),
            events_tx,
        }
    }

    /// The refresh cadence from config.
    pub fn refresh_interval(&self) -> Duration {
        self.config.refresh_interval
    }

    /// Window-end candidates worth querying at `now`: the current window
    /// and the next one (so tracking is warm when the slot rolls over).
    fn end_candidates(now: DateTime<Utc>) -> [i64; 2] {
        let slot = SlotMarket::slot_ts(now);
        [slot + SLOT_SECS, slot + 2 * SLOT_SECS]
    }

    /// Refresh the market set. Returns newly discovered markets.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Vec<SlotMarket> {
        let mut discovered = Vec::new();

        for &asset in &self.config.assets {
            for end_ts in Self::end_candidates(now) {
                if self.known.lock().contains_key(&(asset, end_ts)) {
                    continue;
                }

                match self.exchange.find_market(asset, end_ts).await {
                    Ok(market) => {
                        info!(
                            asset = %asset,
                            slug = %market.slug,
                            end = %market.window_end,
                            "Discovered market"
                        );
                        self.known.lock().insert((asset, end_ts), market.clone());
                        let _ = self
                            .events_tx
                            .try_send(FinderEvent::Discovered(market.clone()));
                        discovered.push(market);
                    }
                    Err(ExchangeError::NotFound(_)) => {
                        // The venue has not listed this slot yet.
                        debug!(asset = %asset, end_ts, "Slot market not listed yet");
                    }
                    Err(e) => {
                        warn!(asset = %asset, end_ts, error = %e, "Market lookup failed");
                        let _ = self.events_tx.try_send(FinderEvent::Degraded {
                            asset,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        discovered
    }

    /// Drop markets whose windows have closed. Returns their condition ids.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut known = self.known.lock();
        let mut expired = Vec::new();
        known.retain(|_, market| {
            if market.is_expired(now) {
                expired.push(market.condition_id.clone());
                false
            } else {
                true
            }
        });
        drop(known);

        for condition_id in &expired {
            let _ = self.events_tx.try_send(FinderEvent::Expired {
                condition_id: condition_id.clone(),
            });
        }
        expired
    }

    /// Markets whose windows are currently open.
    pub fn active_markets(&self, now: DateTime<Utc>) -> Vec<SlotMarket> {
        self.known
            .lock()
            .values()
            .filter(|m| m.is_active(now))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex as PlMutex;
    use pair_common::{Balance, Book, BookUpdate, Order, OrderOutcome};
    use rust_decimal::Decimal;

    /// Exchange stub that serves slot markets and counts lookups.
    struct StubExchange {
        listed: PlMutex<HashMap<(CryptoAsset, i64), SlotMarket>>,
        lookups: PlMutex<u32>,
        fail_transient: PlMutex<bool>,
    }

    impl StubExchange {
        fn new() -> Self {
            Self {
                listed: PlMutex::new(HashMap::new()),
                lookups: PlMutex::new(0),
                fail_transient: PlMutex::new(false),
            }
        }

        fn list(&self, asset: CryptoAsset, end_ts: i64) -> SlotMarket {
            let (start, end) = SlotMarket::window_for_end(end_ts);
            let market = SlotMarket {
                condition_id: format!("{}-{}", asset.slug_str(), end_ts),
                slug: SlotMarket::slug_for(asset, end_ts),
                asset,
                yes_token_id: format!("{}-{}-yes", asset.slug_str(), end_ts),
                no_token_id: format!("{}-{}-no", asset.slug_str(), end_ts),
                window_start: start,
                window_end: end,
            };
            self.listed.lock().insert((asset, end_ts), market.clone());
            market
        }
    }

    #[async_trait]
    impl Exchange for StubExchange {
        async fn get_book(&self, _token_id: &str) -> Result<Book, ExchangeError> {
            Ok(Book::default())
        }
        async fn subscribe_book(
            &self,
            _token_ids: Vec<String>,
        ) -> Result<mpsc::Receiver<BookUpdate>, ExchangeError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn place_order(&self, _order: &Order) -> Result<OrderOutcome, ExchangeError> {
            Err(ExchangeError::Rejected("stub".into()))
        }
        async fn cancel_order(&self, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn get_balance(&self) -> Result<Balance, ExchangeError> {
            Ok(Balance {
                balance: Decimal::ZERO,
                allowance: Decimal::ZERO,
            })
        }
        async fn find_market(
            &self,
            asset: CryptoAsset,
            end_ts: i64,
        ) -> Result<SlotMarket, ExchangeError> {
            *self.lookups.lock() += 1;
            if *self.fail_transient.lock() {
                return Err(ExchangeError::Transient("503".into()));
            }
            self.listed
                .lock()
                .get(&(asset, end_ts))
                .cloned()
                .ok_or_else(|| ExchangeError::NotFound(format!("{asset} {end_ts}")))
        }
    }

    fn finder_with(
        exchange: Arc<StubExchange>,
        assets: Vec<CryptoAsset>,
    ) -> (MarketFinder, mpsc::Receiver<FinderEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let config = FinderConfig {
            assets,
            ..Default::default()
        };
        (MarketFinder::new(exchange, config, tx), rx)
    }

    fn slot_now() -> (DateTime<Utc>, i64) {
        let now = Utc.timestamp_opt(1_700_000_400, 0).unwrap();
        (now, SlotMarket::slot_ts(now))
    }

    #[tokio::test]
    async fn test_discovers_current_and_next_slot() {
        let (now, slot) = slot_now();
        let exchange = Arc::new(StubExchange::new());
        exchange.list(CryptoAsset::Btc, slot + SLOT_SECS);
        exchange.list(CryptoAsset::Btc, slot + 2 * SLOT_SECS);

        let (finder, mut rx) = finder_with(exchange, vec![CryptoAsset::Btc]);
        let discovered = finder.refresh(now).await;
        assert_eq!(discovered.len(), 2);
        assert!(matches!(rx.try_recv(), Ok(FinderEvent::Discovered(_))));

        // The current-window market is active; the next-window one is not yet.
        assert_eq!(finder.active_markets(now).len(), 1);
    }

    #[tokio::test]
    async fn test_memoizes_per_slot() {
        let (now, slot) = slot_now();
        let exchange = Arc::new(StubExchange::new());
        exchange.list(CryptoAsset::Eth, slot + SLOT_SECS);

        let (finder, _rx) = finder_with(exchange.clone(), vec![CryptoAsset::Eth]);
        finder.refresh(now).await;
        let first_pass = *exchange.lookups.lock();

        // Second refresh only re-queries the still-unlisted next slot.
        let again = finder.refresh(now).await;
        assert!(again.is_empty());
        assert_eq!(*exchange.lookups.lock(), first_pass + 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_previous_set() {
        let (now, slot) = slot_now();
        let exchange = Arc::new(StubExchange::new());
        exchange.list(CryptoAsset::Sol, slot + SLOT_SECS);

        let (finder, mut rx) = finder_with(exchange.clone(), vec![CryptoAsset::Sol]);
        finder.refresh(now).await;
        assert_eq!(finder.active_markets(now).len(), 1);

        *exchange.fail_transient.lock() = true;
        let discovered = finder.refresh(now).await;
        assert!(discovered.is_empty());
        // Previous set intact, degradation surfaced.
        assert_eq!(finder.active_markets(now).len(), 1);
        let mut saw_degraded = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FinderEvent::Degraded { .. }) {
                saw_degraded = true;
            }
        }
        assert!(saw_degraded);
    }

    #[tokio::test]
    async fn test_prunes_expired_windows() {
        let (now, slot) = slot_now();
        let exchange = Arc::new(StubExchange::new());
        exchange.list(CryptoAsset::Btc, slot + SLOT_SECS);

        let (finder, _rx) = finder_with(exchange, vec![CryptoAsset::Btc]);
        finder.refresh(now).await;

        let after_close = now + chrono::Duration::seconds(2 * SLOT_SECS);
        let expired = finder.prune_expired(after_close);
        assert_eq!(expired.len(), 1);
        assert!(finder.active_markets(after_close).is_empty());
    }
}
