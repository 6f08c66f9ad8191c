//! Backtester
//!
//! Historical simulation of the execution rules over a single OHLCV series.
//!
//! # Example
//!
//! ```ignore
//! use backtester::Backtester;
//!
//! let backtester = Backtester::new(config.execution.clone(), config.broker.initial_capital);
//! let report = backtester.run("AAPL", &bars, &signals)?;
//! println!("Return: {}", report.total_return);
//! ```

pub mod simulator;

pub use simulator::{BacktestReport, Backtester};
