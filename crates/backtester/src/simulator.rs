//! Bar-by-bar backtest simulator.
//!
//! Runs the same [`OrderExecutor`] the live broker uses over one historical
//! series, with a fresh in-memory [`Ledger`] and no circuit breaker.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trading_core::config::ExecutionConfig;
use trading_core::types::{Bar, Fill, Signal, Trade};
use trading_core::{Error, Result};
use trading_engine::engine::Strategy;
use trading_engine::executor::OrderExecutor;
use trading_engine::ledger::Ledger;
use trading_engine::sizing::{PercentOfEquity, PositionSizer};

/// Result of a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub ticker: String,
    pub initial_capital: Decimal,
    /// Equity after the last bar, open positions marked to its close.
    pub final_equity: Decimal,
    /// Fractional return on initial capital.
    pub total_return: Decimal,
    /// Share of closed round trips with positive P&L.
    pub win_rate: Decimal,
    /// Largest peak-to-trough decline of the equity curve, as a fraction.
    pub max_drawdown: Decimal,
    pub total_commission: Decimal,
    /// Equity curve (timestamp, value).
    pub equity_curve: Vec<(DateTime<Utc>, Decimal)>,
    /// Closed round trips.
    pub trades: Vec<Trade>,
    pub fills: Vec<Fill>,
}

impl BacktestReport {
    /// Check if the backtest was profitable.
    pub fn is_profitable(&self) -> bool {
        self.final_equity > self.initial_capital
    }
}

/// The backtest simulator.
pub struct Backtester {
    config: ExecutionConfig,
    initial_capital: Decimal,
    sizer: Option<Box<dyn Fn() -> Box<dyn PositionSizer>>>,
}

impl Backtester {
    pub fn new(config: ExecutionConfig, initial_capital: Decimal) -> Self {
        Self {
            config,
            initial_capital,
            sizer: None,
        }
    }

    /// Use a custom sizer instead of `position_size_pct` of equity. The
    /// factory is called once per run.
    pub fn with_sizer<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PositionSizer> + 'static,
    {
        self.sizer = Some(Box::new(factory));
        self
    }

    /// Replay `bars` with one optional signal per bar.
    pub fn run(
        &self,
        ticker: &str,
        bars: &[Bar],
        signals: &[Option<Signal>],
    ) -> Result<BacktestReport> {
        if bars.is_empty() {
            return Err(Error::data_unavailable(ticker, "no bars to backtest"));
        }
        if signals.len() != bars.len() {
            return Err(Error::data_unavailable(
                ticker,
                format!("{} signals for {} bars", signals.len(), bars.len()),
            ));
        }

        info!(
            ticker = %ticker,
            bars = bars.len(),
            initial_capital = %self.initial_capital,
            "Starting backtest"
        );

        let sizer: Box<dyn PositionSizer> = match &self.sizer {
            Some(factory) => factory(),
            None => Box::new(PercentOfEquity::new(self.config.position_size_pct)),
        };
        let mut executor = OrderExecutor::new(self.config.clone(), sizer);
        let mut ledger = Ledger::new(self.initial_capital);

        let mut equity_curve = Vec::with_capacity(bars.len());
        let mut trades = Vec::new();
        let mut fills = Vec::new();

        for (bar, signal) in bars.iter().zip(signals) {
            let outcome = executor.process_bar(&mut ledger, ticker, bar, signal.as_ref());
            if !outcome.is_empty() {
                debug!(
                    ticker = %ticker,
                    timestamp = %bar.timestamp,
                    fills = outcome.fills.len(),
                    exit = outcome.exit_executed,
                    "Bar produced fills"
                );
            }
            fills.extend(outcome.fills);
            trades.extend(outcome.trades);
            equity_curve.push((bar.timestamp, ledger.total_equity()));
        }

        let final_equity = ledger.total_equity();
        let total_return = if self.initial_capital.is_zero() {
            Decimal::ZERO
        } else {
            (final_equity - self.initial_capital) / self.initial_capital
        };
        let win_rate = if trades.is_empty() {
            Decimal::ZERO
        } else {
            let wins = trades.iter().filter(|t| t.is_win()).count();
            Decimal::from(wins) / Decimal::from(trades.len())
        };
        let max_drawdown = calculate_max_drawdown(self.initial_capital, &equity_curve);
        let total_commission = fills.iter().map(|f| f.commission).sum();

        info!(
            ticker = %ticker,
            final_equity = %final_equity,
            total_return = %total_return,
            trades = trades.len(),
            max_drawdown = %max_drawdown,
            "Backtest complete"
        );

        Ok(BacktestReport {
            ticker: ticker.to_string(),
            initial_capital: self.initial_capital,
            final_equity,
            total_return,
            win_rate,
            max_drawdown,
            total_commission,
            equity_curve,
            trades,
            fills,
        })
    }

    /// Generate signals with `strategy` over the whole series, then replay.
    pub fn run_strategy(
        &self,
        ticker: &str,
        bars: &[Bar],
        strategy: &dyn Strategy,
    ) -> Result<BacktestReport> {
        let signals = strategy.generate_signals(ticker, bars);
        self.run(ticker, bars, &signals)
    }
}

fn calculate_max_drawdown(initial: Decimal, equity_curve: &[(DateTime<Utc>, Decimal)]) -> Decimal {
    let mut peak = initial;
    let mut max_drawdown = Decimal::ZERO;

    for (_, value) in equity_curve {
        if *value > peak {
            peak = *value;
        }
        if peak > Decimal::ZERO {
            max_drawdown = max_drawdown.max((peak - *value) / peak);
        }
    }

    max_drawdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use trading_core::types::TradeReason;

    fn d(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn bar(day: i64, open: i64, high: i64, low: i64, close: i64) -> Bar {
        let start = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        Bar::new(start + Duration::days(day), d(open), d(high), d(low), d(close))
    }

    fn config(size_pct: i64) -> ExecutionConfig {
        ExecutionConfig {
            stop_loss_pct: Some(Decimal::new(5, 2)),
            take_profit_pct: Some(Decimal::new(10, 2)),
            trailing_stop_pct: None,
            position_size_pct: Decimal::new(size_pct, 2),
            slippage_pct: Decimal::ZERO,
            commission_pct: Decimal::ZERO,
            allow_short: false,
        }
    }

    struct BuyFirstBar;

    impl Strategy for BuyFirstBar {
        fn generate_signals(&self, _ticker: &str, bars: &[Bar]) -> Vec<Option<Signal>> {
            let mut signals = vec![None; bars.len()];
            if let Some(first) = signals.first_mut() {
                *first = Some(Signal::long());
            }
            signals
        }
    }

    #[test]
    fn test_take_profit_round_trip() {
        let backtester = Backtester::new(config(1), d(100_000));
        let bars = [bar(0, 100, 101, 99, 100), bar(1, 105, 115, 95, 105)];

        let report = backtester.run_strategy("AAPL", &bars, &BuyFirstBar).unwrap();
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].reason, TradeReason::TakeProfit);
        assert_eq!(report.final_equity, d(100_100));
        assert_eq!(report.total_return, Decimal::new(1, 3));
        assert_eq!(report.win_rate, Decimal::ONE);
        assert_eq!(report.equity_curve.len(), 2);
        assert!(report.is_profitable());
    }

    #[test]
    fn test_open_position_marked_to_last_close() {
        let backtester = Backtester::new(config(1), d(100_000));
        let bars = [bar(0, 100, 101, 99, 100), bar(1, 100, 104, 98, 103)];

        let report = backtester.run_strategy("AAPL", &bars, &BuyFirstBar).unwrap();
        assert!(report.trades.is_empty());
        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.final_equity, d(100_030));
    }

    #[test]
    fn test_max_drawdown_and_losing_trade() {
        let backtester = Backtester::new(config(10), d(100_000));
        let bars = [
            bar(0, 100, 101, 99, 100),
            bar(1, 100, 101, 96, 97),
            bar(2, 97, 98, 94, 96),
        ];

        let report = backtester.run_strategy("AAPL", &bars, &BuyFirstBar).unwrap();
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].reason, TradeReason::StopLoss);
        assert_eq!(report.final_equity, d(99_500));
        assert_eq!(report.win_rate, Decimal::ZERO);
        assert_eq!(report.max_drawdown, Decimal::new(5, 3));
        assert!(!report.is_profitable());
    }

    #[test]
    fn test_custom_sizer() {
        let backtester = Backtester::new(config(1), d(100_000))
            .with_sizer(|| -> Box<dyn PositionSizer> {
                Box::new(|_: Decimal, _: Decimal| Decimal::new(3, 0))
            });
        let bars = [bar(0, 100, 101, 99, 100)];
        let report = backtester.run("AAPL", &bars, &[Some(Signal::long())]).unwrap();
        assert_eq!(report.fills[0].quantity, d(3));
    }

    #[test]
    fn test_input_errors() {
        let backtester = Backtester::new(config(1), d(100_000));
        assert!(matches!(
            backtester.run("AAPL", &[], &[]),
            Err(Error::DataUnavailable { .. })
        ));
        let bars = [bar(0, 100, 101, 99, 100)];
        assert!(backtester.run("AAPL", &bars, &[]).is_err());
    }
}
