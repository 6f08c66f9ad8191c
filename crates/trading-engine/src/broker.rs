//! Paper broker with crash-safe state persistence.
//!
//! Wraps a [`Ledger`] and an [`OrderExecutor`] behind the [`Broker`]
//! interface. Every execution that changes state writes a full snapshot
//! before returning, so a crash loses at most the call in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use trading_core::config::{BrokerConfig, ExecutionConfig};
use trading_core::persistence::{read_json, write_json_atomic};
use trading_core::types::{Bar, Fill, Position, Signal, Trade};

use crate::executor::{BarOutcome, ExecutorTrackers, OrderExecutor};
use crate::ledger::Ledger;
use crate::sizing::PositionSizer;

/// Uniform interface over paper and live brokers.
pub trait Broker {
    fn cash(&self) -> Decimal;

    fn positions(&self) -> &HashMap<String, Position>;

    /// Cash plus marked position value.
    fn portfolio_value(&self) -> Decimal;

    /// Evaluate one bar and optional signal for a ticker. Never fails:
    /// rejected orders are logged and reported as not executed. A bar no
    /// newer than the last one processed for the ticker is ignored.
    fn execute_order(
        &mut self,
        ticker: &str,
        bar: &Bar,
        signal: Option<&Signal>,
    ) -> ExecutionReport;

    fn mark_to_market(&mut self, prices: &HashMap<String, Decimal>) -> Decimal;

    fn trade_history(&self) -> &[Fill];

    /// Timestamp of the newest bar executed for `ticker`.
    fn last_processed(&self, ticker: &str) -> Option<DateTime<Utc>>;
}

/// Result of one `execute_order` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub executed: bool,
    pub exit_executed: bool,
    pub fills: Vec<Fill>,
    pub trades: Vec<Trade>,
}

impl From<BarOutcome> for ExecutionReport {
    fn from(outcome: BarOutcome) -> Self {
        Self {
            executed: !outcome.fills.is_empty(),
            exit_executed: outcome.exit_executed,
            fills: outcome.fills,
            trades: outcome.trades,
        }
    }
}

/// On-disk broker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub cash: Decimal,
    pub positions: HashMap<String, Position>,
    pub trade_history: Vec<Fill>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub trackers: ExecutorTrackers,
    #[serde(default)]
    pub completed_trades: Vec<Trade>,
    #[serde(default)]
    pub realized_pnl: Decimal,
    /// Newest bar timestamp executed per ticker.
    #[serde(default)]
    pub last_processed: HashMap<String, DateTime<Utc>>,
}

pub type TradeHook = Arc<dyn Fn(&Fill) + Send + Sync>;

/// Simulated broker backed by a JSON state file.
pub struct PaperBroker {
    ledger: Ledger,
    executor: OrderExecutor,
    trade_history: Vec<Fill>,
    completed_trades: Vec<Trade>,
    last_processed: HashMap<String, DateTime<Utc>>,
    state_path: Option<PathBuf>,
    hooks: Vec<(String, TradeHook)>,
}

impl PaperBroker {
    /// Load the snapshot at `config.state_path`, or start from
    /// `config.initial_capital` when there is none or it cannot be read.
    pub fn open(
        config: &BrokerConfig,
        execution: ExecutionConfig,
        sizer: Box<dyn PositionSizer>,
    ) -> Self {
        let mut broker = Self::in_memory(config.initial_capital, execution, sizer);
        broker.state_path = Some(config.state_path.clone());

        match read_json::<BrokerSnapshot>(&config.state_path) {
            Ok(Some(snapshot)) => {
                info!(
                    path = %config.state_path.display(),
                    cash = %snapshot.cash,
                    positions = snapshot.positions.len(),
                    fills = snapshot.trade_history.len(),
                    last_updated = %snapshot.last_updated,
                    "Loaded broker state"
                );
                broker.restore(snapshot);
            }
            Ok(None) => {
                info!(
                    path = %config.state_path.display(),
                    initial_capital = %config.initial_capital,
                    "No broker state found, starting fresh"
                );
            }
            Err(e) => {
                error!(
                    path = %config.state_path.display(),
                    error = %e,
                    "Failed to load broker state, starting from initial capital"
                );
            }
        }

        broker
    }

    /// Broker without persistence.
    pub fn in_memory(
        initial_capital: Decimal,
        execution: ExecutionConfig,
        sizer: Box<dyn PositionSizer>,
    ) -> Self {
        Self {
            ledger: Ledger::new(initial_capital),
            executor: OrderExecutor::new(execution, sizer),
            trade_history: Vec::new(),
            completed_trades: Vec::new(),
            last_processed: HashMap::new(),
            state_path: None,
            hooks: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    pub fn completed_trades(&self) -> &[Trade] {
        &self.completed_trades
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    /// Register a named hook called for every fill, replacing any hook
    /// with the same name.
    pub fn on_trade<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(&Fill) + Send + Sync + 'static,
    {
        let name = name.into();
        self.hooks.retain(|(existing, _)| *existing != name);
        self.hooks.push((name, Arc::new(hook)));
    }

    pub fn remove_hook(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(existing, _)| existing != name);
        self.hooks.len() != before
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            cash: self.ledger.cash(),
            positions: self.ledger.positions().clone(),
            trade_history: self.trade_history.clone(),
            last_updated: Utc::now(),
            trackers: self.executor.trackers().clone(),
            completed_trades: self.completed_trades.clone(),
            realized_pnl: self.ledger.realized_pnl(),
            last_processed: self.last_processed.clone(),
        }
    }

    /// Write the full state. Failures are logged and the broker carries on
    /// in memory.
    pub fn save(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        match write_json_atomic(path, &self.snapshot()) {
            Ok(()) => debug!(path = %path.display(), "Broker state saved"),
            Err(e) => error!(
                path = %path.display(),
                error = %e,
                "Failed to persist broker state"
            ),
        }
    }

    fn restore(&mut self, snapshot: BrokerSnapshot) {
        self.ledger = Ledger::restore(snapshot.cash, snapshot.positions, snapshot.realized_pnl);
        self.trade_history = snapshot.trade_history;
        self.completed_trades = snapshot.completed_trades;
        self.last_processed = snapshot.last_processed;

        // Trackers for tickers no longer held are stale
        let mut trackers = snapshot.trackers;
        let held = self.ledger.positions();
        trackers.trailing.retain(|ticker, _| held.contains_key(ticker));
        trackers.entry_dates.retain(|ticker, _| held.contains_key(ticker));
        self.executor.restore_trackers(trackers);
    }
}

impl Broker for PaperBroker {
    fn cash(&self) -> Decimal {
        self.ledger.cash()
    }

    fn positions(&self) -> &HashMap<String, Position> {
        self.ledger.positions()
    }

    fn portfolio_value(&self) -> Decimal {
        self.ledger.total_equity()
    }

    fn execute_order(
        &mut self,
        ticker: &str,
        bar: &Bar,
        signal: Option<&Signal>,
    ) -> ExecutionReport {
        if let Some(last) = self.last_processed(ticker) {
            if bar.timestamp <= last {
                debug!(
                    ticker = %ticker,
                    bar = %bar.timestamp,
                    last_processed = %last,
                    "Bar already processed, ignoring"
                );
                return ExecutionReport::default();
            }
        }

        let trackers_before = self.executor.trackers().trailing.get(ticker).cloned();
        let outcome = self
            .executor
            .process_bar(&mut self.ledger, ticker, bar, signal);
        let trackers_changed =
            self.executor.trackers().trailing.get(ticker) != trackers_before.as_ref();
        self.last_processed.insert(ticker.to_string(), bar.timestamp);

        // A bar that changed nothing replays as a no-op, so it is not saved
        if outcome.fills.is_empty() {
            if trackers_changed {
                self.save();
            }
            if let Some(signal) = signal.filter(|s| s.is_actionable()) {
                debug!(ticker = %ticker, signal = ?signal, "Signal produced no fill");
            }
            return outcome.into();
        }

        self.trade_history.extend(outcome.fills.iter().cloned());
        self.completed_trades.extend(outcome.trades.iter().cloned());
        self.save();

        for fill in &outcome.fills {
            for (name, hook) in &self.hooks {
                debug!(hook = %name, fill_id = %fill.id, "Dispatching trade hook");
                hook(fill);
            }
        }

        info!(
            ticker = %ticker,
            fills = outcome.fills.len(),
            exit = outcome.exit_executed,
            cash = %self.ledger.cash(),
            equity = %self.ledger.total_equity(),
            "Order executed"
        );
        outcome.into()
    }

    fn mark_to_market(&mut self, prices: &HashMap<String, Decimal>) -> Decimal {
        let missing: Vec<&String> = self
            .ledger
            .positions()
            .keys()
            .filter(|ticker| !prices.contains_key(*ticker))
            .collect();
        if !missing.is_empty() {
            warn!(tickers = ?missing, "No price for held positions, using last mark");
        }
        self.ledger.mark_to_market(prices)
    }

    fn trade_history(&self) -> &[Fill] {
        &self.trade_history
    }

    fn last_processed(&self, ticker: &str) -> Option<DateTime<Utc>> {
        self.last_processed.get(ticker).copied()
    }
}
