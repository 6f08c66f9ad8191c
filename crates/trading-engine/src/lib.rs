//! Trading Engine
//!
//! Cash and position bookkeeping, per-bar order execution, the persisted
//! paper broker, and the cycle that ties them to the circuit breaker.

pub mod broker;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod sizing;

pub use broker::{Broker, BrokerSnapshot, ExecutionReport, PaperBroker, TradeHook};
pub use engine::{CycleReport, DataSource, Strategy, TradingEngine};
pub use executor::{BarOutcome, ExecutorTrackers, OrderExecutor};
pub use ledger::Ledger;
pub use sizing::{PercentOfEquity, PositionSizer};
