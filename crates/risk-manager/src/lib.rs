//! Risk Manager
//!
//! Exit-rule evaluation and the persisted circuit breaker that halts trading
//! when losses or drawdown breach their limits.

pub mod circuit_breaker;
pub mod state_store;
pub mod stop_loss;

pub use circuit_breaker::{
    BreakerCallback, BreakerEvent, CircuitBreaker, CircuitBreakerState, CircuitState,
    HealthReport, Permit, TriggerType,
};
pub use state_store::JsonStateStore;
pub use stop_loss::{ExitRules, ExitTrigger, TrailingStop};
pub use trading_core::config::CircuitBreakerConfig;
