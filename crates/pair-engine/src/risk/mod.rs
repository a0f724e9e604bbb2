//! Risk and safety controls: admission gating, circuit breaker, blackout
//! window and per-window exposure accounting.

pub mod blackout;
pub mod circuit_breaker;
pub mod gate;
pub mod window;

pub use blackout::BlackoutWindow;
pub use circuit_breaker::{BreakerLevel, BreakerThresholds, CircuitBreaker};
pub use gate::{Admission, GateConfig, RejectReason, RiskGate};
pub use window::WindowLedger;
