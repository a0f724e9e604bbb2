//! Real-time order-book state per tracked market.
//!
//! `BookTracker` consumes the exchange's streaming book feed, maintains the
//! latest [`MarketState`] per market, and publishes `Updated` / `Stale`
//! events downstream. It owns its subscription set so a reconnect restores
//! every tracked token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use pair_common::{BookUpdate, CryptoAsset, Exchange, Outcome, SlotMarket};

use crate::orderbook::OrderBook;

/// Combined book state for a YES/NO pair.
#[derive(Debug, Clone)]
pub struct MarketState {
    /// The market this state belongs to.
    pub market: SlotMarket,
    /// YES side order book.
    pub yes_book: OrderBook,
    /// NO side order book.
    pub no_book: OrderBook,
    /// Timestamp of the most recent update (None until the first one).
    pub last_update: Option<DateTime<Utc>>,
    /// Monotonically increasing update counter.
    pub revision: u64,
    /// Whether this market is currently flagged stale.
    stale_flagged: bool,
}

impl MarketState {
    /// Fresh state with empty books.
    pub fn new(market: SlotMarket) -> Self {
        Self {
            market,
            yes_book: OrderBook::new(),
            no_book: OrderBook::new(),
            last_update: None,
            revision: 0,
            stale_flagged: false,
        }
    }

    /// Best YES ask, if any.
    #[inline]
    pub fn yes_ask(&self) -> Option<Decimal> {
        self.yes_book.best_ask()
    }

    /// Best NO ask, if any.
    #[inline]
    pub fn no_ask(&self) -> Option<Decimal> {
        self.no_book.best_ask()
    }

    /// Arbitrage spread: `1 - yes_ask - no_ask`. None if either side is missing.
    pub fn spread(&self) -> Option<Decimal> {
        Some(Decimal::ONE - self.yes_ask()? - self.no_ask()?)
    }

    /// The book for one outcome.
    pub fn book(&self, outcome: Outcome) -> &OrderBook {
        match outcome {
            Outcome::Yes => &self.yes_book,
            Outcome::No => &self.no_book,
        }
    }

    /// A market is stale when no update has arrived within the threshold.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_update {
            Some(ts) => now - ts > chrono::Duration::from_std(threshold).unwrap_or_default(),
            None => true,
        }
    }
}

/// Events published by the tracker.
#[derive(Debug, Clone)]
pub enum BookEvent {
    /// A book update was applied; carries a snapshot of the new state.
    Updated(Box<MarketState>),
    /// A market crossed the staleness threshold.
    Stale {
        condition_id: String,
        asset: CryptoAsset,
    },
    /// The feed was resubscribed after a disconnect.
    Reconnected { tokens: usize },
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Feed silence beyond this marks a market stale.
    pub stale_threshold: Duration,
    /// Delay before resubscribing after the feed drops.
    pub resubscribe_delay: Duration,
    /// Staleness sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Maintains per-market book state from the exchange's streaming feed.
pub struct BookTracker {
    exchange: Arc<dyn Exchange>,
    config: TrackerConfig,
    /// State per condition id. Writes happen only on the ingest path.
    states: DashMap<String, MarketState>,
    /// token_id -> (condition_id, outcome).
    token_index: DashMap<String, (String, Outcome)>,
    events_tx: mpsc::Sender<BookEvent>,
}

impl BookTracker {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: TrackerConfig,
        events_tx: mpsc::Sender<BookEvent>,
    ) -> Self {
        Self {
            exchange,
            config,
            states: DashMap::new(),
            token_index: DashMap::new(),
            events_tx,
        }
    }

    /// Start tracking a market. Idempotent per condition id.
    pub fn track(&self, market: SlotMarket) {
        if self.states.contains_key(&market.condition_id) {
            return;
        }
        self.token_index.insert(
            market.yes_token_id.clone(),
            (market.condition_id.clone(), Outcome::Yes),
        );
        self.token_index.insert(
            market.no_token_id.clone(),
            (market.condition_id.clone(), Outcome::No),
        );
        debug!(condition_id = %market.condition_id, asset = %market.asset, "Tracking market");
        self.states
            .insert(market.condition_id.clone(), MarketState::new(market));
    }

    /// Stop tracking a market (after expiry).
    pub fn untrack(&self, condition_id: &str) {
        if let Some((_, state)) = self.states.remove(condition_id) {
            self.token_index.remove(&state.market.yes_token_id);
            self.token_index.remove(&state.market.no_token_id);
            debug!(condition_id = %condition_id, "Untracked market");
        }
    }

    /// Snapshot of one market's state.
    pub fn snapshot(&self, condition_id: &str) -> Option<MarketState> {
        self.states.get(condition_id).map(|s| s.clone())
    }

    /// Condition ids currently tracked.
    pub fn tracked_markets(&self) -> Vec<String> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }

    /// Token ids that a (re)subscription must cover.
    pub fn subscribed_tokens(&self) -> Vec<String> {
        self.token_index.iter().map(|e| e.key().clone()).collect()
    }

    /// Apply one feed update. Returns the new revision if the token is tracked.
    pub fn apply_update(&self, update: BookUpdate) -> Option<u64> {
        let (condition_id, outcome) = {
            let entry = self.token_index.get(&update.token_id)?;
            entry.value().clone()
        };

        let mut state = self.states.get_mut(&condition_id)?;
        let book = match outcome {
            Outcome::Yes => &mut state.yes_book,
            Outcome::No => &mut state.no_book,
        };
        book.apply_snapshot(update.bids, update.asks);
        state.last_update = Some(update.ts);
        state.revision += 1;
        state.stale_flagged = false;
        let revision = state.revision;

        let snapshot = state.clone();
        drop(state);

        if self.events_tx.try_send(BookEvent::Updated(Box::new(snapshot))).is_err() {
            debug!(condition_id = %condition_id, "Book event channel full, dropping update");
        }
        Some(revision)
    }

    /// Flag markets that crossed the staleness threshold since the last sweep.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut flagged = Vec::new();
        for mut entry in self.states.iter_mut() {
            if !entry.stale_flagged && entry.is_stale(now, self.config.stale_threshold) {
                entry.stale_flagged = true;
                flagged.push(entry.key().clone());
                let event = BookEvent::Stale {
                    condition_id: entry.key().clone(),
                    asset: entry.market.asset,
                };
                let _ = self.events_tx.try_send(event);
            }
        }
        if !flagged.is_empty() {
            warn!(count = flagged.len(), "Markets went stale");
        }
        flagged
    }

    /// Run the ingest loop: subscribe, apply updates, resubscribe on drop.
    ///
    /// Returns when the shutdown signal fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'outer: loop {
            let tokens = self.subscribed_tokens();
            if tokens.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.resubscribe_delay) => continue,
                    _ = shutdown.recv() => break,
                }
            }

            let mut stream = match self.exchange.subscribe_book(tokens.clone()).await {
                Ok(stream) => {
                    info!(tokens = tokens.len(), "Book feed subscribed");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "Book subscription failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.resubscribe_delay) => continue,
                        _ = shutdown.recv() => break,
                    }
                }
            };

            loop {
                tokio::select! {
                    update = stream.recv() => match update {
                        Some(update) => {
                            self.apply_update(update);
                            // A tracked set that grew needs a fresh subscription.
                            if self.subscribed_tokens().len() != tokens.len() {
                                debug!("Subscription set changed, resubscribing");
                                let _ = self.events_tx.try_send(BookEvent::Reconnected {
                                    tokens: self.subscribed_tokens().len(),
                                });
                                continue 'outer;
                            }
                        }
                        None => {
                            warn!("Book feed disconnected, resubscribing");
                            let _ = self.events_tx.try_send(BookEvent::Reconnected {
                                tokens: self.subscribed_tokens().len(),
                            });
                            tokio::time::sleep(self.config.resubscribe_delay).await;
                            continue 'outer;
                        }
                    },
                    _ = sweep.tick() => {
                        self.sweep_stale(Utc::now());
                    }
                    _ = shutdown.recv() => break 'outer,
                }
            }
        }
        info!("Book tracker stopped");
    }
}
