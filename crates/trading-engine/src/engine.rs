//! Trading cycle orchestration.
//!
//! One cycle walks the tracked tickers: fetch bars, gate on the circuit
//! breaker, ask the strategy for a signal, and hand the bar to the broker.
//! Each bar is handed over at most once per ticker.
//! Realized results are fed back into the breaker, and the cycle ends with a
//! portfolio health check.

use std::collections::HashMap;
use std::sync::Arc;

use risk_manager::circuit_breaker::{CircuitBreaker, HealthReport};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use trading_core::config::EngineConfig;
use trading_core::types::{Bar, Signal};
use trading_core::Result;

use crate::broker::{Broker, ExecutionReport};

/// Source of OHLCV history.
#[cfg_attr(test, mockall::automock)]
pub trait DataSource {
    /// Up to `lookback` most recent bars, oldest first.
    fn fetch(&self, ticker: &str, lookback: usize) -> Result<Vec<Bar>>;
}

/// Signal generator. Returns one entry per input bar.
#[cfg_attr(test, mockall::automock)]
pub trait Strategy {
    fn generate_signals(&self, ticker: &str, bars: &[Bar]) -> Vec<Option<Signal>>;
}

/// Summary of one trading cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Tickers handed to the broker.
    pub processed: usize,
    /// Tickers skipped for missing data, no new bar, or because trading halted.
    pub skipped: usize,
    /// The circuit breaker refused execution during this cycle.
    pub halted: bool,
    pub portfolio_value: Decimal,
    pub health: HealthReport,
}

/// Drives the broker from a data source and strategy, gated by a shared
/// circuit breaker.
pub struct TradingEngine<B: Broker> {
    broker: B,
    breaker: Arc<CircuitBreaker>,
    data: Box<dyn DataSource>,
    strategy: Box<dyn Strategy>,
    tickers: Vec<String>,
    lookback: usize,
    initial_capital: Decimal,
}

impl<B: Broker> TradingEngine<B> {
    pub fn new(
        broker: B,
        breaker: Arc<CircuitBreaker>,
        data: Box<dyn DataSource>,
        strategy: Box<dyn Strategy>,
        config: &EngineConfig,
        initial_capital: Decimal,
    ) -> Self {
        Self {
            broker,
            breaker,
            data,
            strategy,
            tickers: config.tickers.clone(),
            lookback: config.lookback,
            initial_capital,
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// Run one cycle. Failures for one ticker never abort the others; a
    /// refusal from the circuit breaker skips the rest of the cycle.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut processed = 0;
        let mut skipped = 0;
        let mut halted = false;
        let mut prices: HashMap<String, Decimal> = HashMap::new();

        info!(tickers = self.tickers.len(), "Starting trading cycle");

        for (index, ticker) in self.tickers.iter().enumerate() {
            let bars = match self.data.fetch(ticker, self.lookback) {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "Data unavailable, skipping ticker");
                    skipped += 1;
                    continue;
                }
            };
            let Some(latest) = bars.last() else {
                warn!(ticker = %ticker, "No bars returned, skipping ticker");
                skipped += 1;
                continue;
            };
            if let Err(e) = latest.validate(ticker) {
                warn!(ticker = %ticker, error = %e, "Latest bar invalid, skipping ticker");
                skipped += 1;
                continue;
            }
            prices.insert(ticker.clone(), latest.close);

            let permit = self.breaker.can_execute();
            if !permit.allowed {
                warn!(
                    ticker = %ticker,
                    reason = %permit.reason,
                    "Circuit breaker refused execution, skipping remainder of cycle"
                );
                halted = true;
                skipped += self.tickers.len() - index;
                break;
            }

            if let Some(last) = self.broker.last_processed(ticker) {
                if latest.timestamp <= last {
                    debug!(
                        ticker = %ticker,
                        bar = %latest.timestamp,
                        "No new bar since last cycle, skipping ticker"
                    );
                    skipped += 1;
                    continue;
                }
            }

            let signal = self
                .strategy
                .generate_signals(ticker, &bars)
                .pop()
                .flatten();

            let report = self.broker.execute_order(ticker, latest, signal.as_ref());
            Self::report_results(&self.breaker, ticker, &report);
            processed += 1;
        }

        let portfolio_value = self.broker.mark_to_market(&prices);
        let health = self
            .breaker
            .check_portfolio_health(portfolio_value, self.initial_capital);

        info!(
            processed = processed,
            skipped = skipped,
            halted = halted,
            portfolio_value = %portfolio_value,
            drawdown = %health.drawdown,
            "Trading cycle complete"
        );

        CycleReport {
            processed,
            skipped,
            halted,
            portfolio_value,
            health,
        }
    }

    /// Losses count against the breaker's budgets; profitable closes count
    /// toward half-open recovery.
    fn report_results(breaker: &CircuitBreaker, ticker: &str, report: &ExecutionReport) {
        for fill in &report.fills {
            match fill.realized_pnl {
                Some(pnl) if pnl < Decimal::ZERO => {
                    if let Some(trigger) = breaker.record_loss(pnl) {
                        warn!(
                            ticker = %ticker,
                            loss = %pnl,
                            trigger = ?trigger,
                            "Loss tripped circuit breaker"
                        );
                    }
                }
                Some(pnl) if pnl > Decimal::ZERO => {
                    let state = breaker.record_success();
                    debug!(
                        ticker = %ticker,
                        pnl = %pnl,
                        state = ?state,
                        "Recorded profitable close"
                    );
                }
                _ => {}
            }
        }
    }
}
