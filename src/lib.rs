//! Tradeguard: order execution and circuit-breaker risk control
//!
//! This is the root crate that provides benchmark access to the internal modules.
//! For actual functionality, use the individual crates directly:
//!
//! - `trading-core`: Shared types, configuration, crash-safe persistence
//! - `risk-manager`: Circuit breaker, kill switch, stop-loss and take-profit rules
//! - `trading-engine`: Ledger, order executor, paper broker, trading cycle
//! - `backtester`: Historical simulation over one OHLCV series
//! - `paper-trader`: Scheduled paper trading and admin commands

// Re-export for benchmarks and integration tests
pub use backtester;
pub use risk_manager as risk;
pub use trading_core as core;
pub use trading_engine as trading;
