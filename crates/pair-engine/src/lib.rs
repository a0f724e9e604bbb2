//! Two-sided arbitrage trading core for binary slot markets.
//!
//! When the YES and NO asks of a 15-minute up/down market sum to strictly
//! less than $1.00, buying matched shares of both sides locks in the
//! difference at resolution. This crate detects those spreads, gates them
//! through safety controls, executes both legs atomically, rebalances
//! one-sided fills, and claims resolved positions through a durable
//! settlement queue.
//!
//! ## Architecture
//!
//! - `pair-market` feeds [`detector::OpportunityDetector`] from streaming
//!   books; candidates flow through a bounded queue.
//! - [`risk::RiskGate`] applies blackout, circuit breaker, dedup and
//!   per-window budget rules; [`sizing::Sizer`] produces equal-share pairs.
//! - [`executor::Executor`] places both legs in parallel as fill-or-kill
//!   at exactly the detected prices and records every fill durably.
//! - [`position::PositionManager`] owns open positions and the
//!   rebalancing policy; [`settlement::SettlementManager`] claims resolved
//!   positions via near-par sell-backs.
//!
//! All prices and quantities use `rust_decimal::Decimal`; never f64.

pub mod clock;
pub mod config;
pub mod detector;
pub mod engine;
pub mod events;
pub mod exchange_sim;
pub mod executor;
pub mod position;
pub mod recovery;
pub mod risk;
pub mod settlement;
pub mod sizing;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use detector::{DetectorSkip, Opportunity, OpportunityDetector};
pub use engine::{Engine, EngineHandle};
pub use events::{EngineEvent, EventSink};
pub use exchange_sim::SimExchange;
pub use executor::{ExecError, ExecutionReport, Executor, ExecutorConfig, InFlight};
pub use position::{ActivePosition, PositionManager, RebalanceAction, RebalanceOption};
pub use recovery::{recover, RecoveredState};
pub use risk::{
    Admission, BlackoutWindow, BreakerLevel, BreakerThresholds, CircuitBreaker, GateConfig,
    RejectReason, RiskGate, WindowLedger,
};
pub use settlement::{SettlementConfig, SettlementManager};
pub use sizing::{EntryPlan, OrderPair, Sizer, SizerConfig, SizingSkip};
pub use store::{
    CircuitBreakerSnapshot, ExecutionStatus, MemoryStore, RebalanceRecord, SettlementEntry,
    Store, StoreError, TradeRecord,
};
