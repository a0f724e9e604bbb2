//! Scriptable in-memory exchange.
//!
//! Backs the integration tests and paper trading: books and markets are
//! seeded directly, order outcomes can be scripted per token, and every
//! placed/cancelled order is recorded for inspection. Unscripted FOK and
//! GTC orders fill completely at their limit price.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use pair_common::{
    Balance, Book, BookUpdate, CryptoAsset, Exchange, ExchangeError, Order, OrderOutcome,
    SlotMarket,
};

enum Scripted {
    Outcome(OrderOutcome),
    TransportError(String),
}

#[derive(Default)]
struct SimInner {
    books: HashMap<String, Book>,
    markets: HashMap<(CryptoAsset, i64), SlotMarket>,
    scripts: HashMap<String, VecDeque<Scripted>>,
    placed: Vec<Order>,
    cancelled: Vec<String>,
    subscribers: Vec<mpsc::Sender<BookUpdate>>,
}

/// In-memory exchange with scriptable behavior.
pub struct SimExchange {
    inner: Mutex<SimInner>,
    balance: Mutex<Balance>,
}

impl SimExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner::default()),
            balance: Mutex::new(Balance {
                balance: Decimal::new(1000, 0),
                allowance: Decimal::new(1000, 0),
            }),
        }
    }

    /// Set the reported balance.
    pub fn set_balance(&self, balance: Decimal) {
        let mut b = self.balance.lock();
        b.balance = balance;
        b.allowance = balance;
    }

    /// Seed a book snapshot for a token.
    pub fn set_book(&self, token_id: &str, book: Book) {
        self.inner.lock().books.insert(token_id.to_string(), book);
    }

    /// List a slot market so `find_market` can serve it.
    pub fn list_market(&self, market: SlotMarket) {
        let end_ts = market.window_end.timestamp();
        self.inner
            .lock()
            .markets
            .insert((market.asset, end_ts), market);
    }

    /// Queue an outcome for the next order on a token.
    pub fn script_outcome(&self, token_id: &str, outcome: OrderOutcome) {
        self.inner
            .lock()
            .scripts
            .entry(token_id.to_string())
            .or_default()
            .push_back(Scripted::Outcome(outcome));
    }

    /// Queue a transport error for the next order on a token.
    pub fn script_transport_error(&self, token_id: &str, message: &str) {
        self.inner
            .lock()
            .scripts
            .entry(token_id.to_string())
            .or_default()
            .push_back(Scripted::TransportError(message.to_string()));
    }

    /// Orders placed so far.
    pub fn placed_orders(&self) -> Vec<Order> {
        self.inner.lock().placed.clone()
    }

    /// Order ids cancelled so far.
    pub fn cancelled_orders(&self) -> Vec<String> {
        self.inner.lock().cancelled.clone()
    }

    /// Push a streaming book update to all subscribers.
    pub async fn push_update(&self, update: BookUpdate) {
        let senders: Vec<_> = self.inner.lock().subscribers.clone();
        for tx in senders {
            let _ = tx.send(update.clone()).await;
        }
    }
}

impl Default for SimExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for SimExchange {
    async fn get_book(&self, token_id: &str) -> Result<Book, ExchangeError> {
        Ok(self
            .inner
            .lock()
            .books
            .get(token_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe_book(
        &self,
        _token_ids: Vec<String>,
    ) -> Result<mpsc::Receiver<BookUpdate>, ExchangeError> {
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().subscribers.push(tx);
        Ok(rx)
    }

    async fn place_order(&self, order: &Order) -> Result<OrderOutcome, ExchangeError> {
        let mut inner = self.inner.lock();
        inner.placed.push(order.clone());

        if let Some(queue) = inner.scripts.get_mut(&order.token_id) {
            if let Some(scripted) = queue.pop_front() {
                return match scripted {
                    Scripted::Outcome(outcome) => Ok(outcome),
                    Scripted::TransportError(msg) => Err(ExchangeError::Transient(msg)),
                };
            }
        }

        // Default: complete immediate fill at the limit price.
        Ok(OrderOutcome::Matched {
            filled_size: order.size,
            filled_cost: order.notional(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        self.inner.lock().cancelled.push(order_id.to_string());
        Ok(())
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        Ok(*self.balance.lock())
    }

    async fn find_market(
        &self,
        asset: CryptoAsset,
        end_ts: i64,
    ) -> Result<SlotMarket, ExchangeError> {
        self.inner
            .lock()
            .markets
            .get(&(asset, end_ts))
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("{asset} {end_ts}")))
    }
}
