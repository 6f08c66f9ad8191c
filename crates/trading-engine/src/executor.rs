//! Per-bar fill logic.
//!
//! For each ticker and bar the executor evaluates, in order: the trailing
//! stop (longs only), take-profit, stop-loss, a directional signal closing
//! an opposing position, structured order matching, and finally a new entry.
//! Exits are tested against the bar's high and low so a stop or target
//! touched intrabar fills even if the close recovered. Once an exit fires
//! nothing else happens for that ticker on that bar.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use risk_manager::stop_loss::{ExitRules, ExitTrigger, TrailingStop};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use trading_core::config::ExecutionConfig;
use trading_core::types::{
    Bar, Direction, Fill, Order, OrderSide, OrderType, Signal, TradeReason, TradeType, Trade,
};
use trading_core::{Error, Result};

use crate::ledger::Ledger;
use crate::sizing::{PercentOfEquity, PositionSizer};

/// Per-ticker state that lives only while a position is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorTrackers {
    #[serde(default)]
    pub trailing: HashMap<String, TrailingStop>,
    #[serde(default)]
    pub entry_dates: HashMap<String, DateTime<Utc>>,
}

/// What happened to one ticker on one bar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarOutcome {
    /// A trailing stop, take-profit, stop-loss or signal close fired.
    pub exit_executed: bool,
    pub fills: Vec<Fill>,
    /// Round trips closed on this bar.
    pub trades: Vec<Trade>,
}

impl BarOutcome {
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }

    /// Net realized P&L of the fills on this bar.
    pub fn realized_pnl(&self) -> Decimal {
        self.fills.iter().filter_map(|f| f.realized_pnl).sum()
    }
}

/// Turns signals and exit rules into ledger mutations.
pub struct OrderExecutor {
    config: ExecutionConfig,
    rules: ExitRules,
    sizer: Box<dyn PositionSizer>,
    trackers: ExecutorTrackers,
}

impl OrderExecutor {
    pub fn new(config: ExecutionConfig, sizer: Box<dyn PositionSizer>) -> Self {
        Self {
            rules: ExitRules::from_config(&config),
            config,
            sizer,
            trackers: ExecutorTrackers::default(),
        }
    }

    /// Executor sizing entries at `position_size_pct` of equity.
    pub fn with_percent_sizing(config: ExecutionConfig) -> Self {
        let sizer = PercentOfEquity::new(config.position_size_pct);
        Self::new(config, Box::new(sizer))
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn trackers(&self) -> &ExecutorTrackers {
        &self.trackers
    }

    pub fn restore_trackers(&mut self, trackers: ExecutorTrackers) {
        self.trackers = trackers;
    }

    pub fn trailing_stop(&self, ticker: &str) -> Option<&TrailingStop> {
        self.trackers.trailing.get(ticker)
    }

    /// Evaluate one bar for one ticker. Validation failures are logged and
    /// leave the ledger untouched.
    pub fn process_bar(
        &mut self,
        ledger: &mut Ledger,
        ticker: &str,
        bar: &Bar,
        signal: Option<&Signal>,
    ) -> BarOutcome {
        let mut outcome = BarOutcome::default();

        if let Err(e) = bar.validate(ticker) {
            warn!(ticker = %ticker, error = %e, "Skipping malformed bar");
            return outcome;
        }

        if let Some(trigger) = self.check_exits(ledger, ticker, bar) {
            self.close_position(ledger, ticker, trigger.price, trigger.reason, bar, &mut outcome);
        }

        if !outcome.exit_executed {
            match signal {
                Some(Signal::Directional(direction)) => {
                    self.apply_direction(ledger, ticker, *direction, bar, &mut outcome)
                }
                Some(Signal::Order(order)) => {
                    self.apply_order(ledger, ticker, order, bar, &mut outcome)
                }
                None => {}
            }
        }

        ledger.mark(ticker, bar.close);
        outcome
    }

    /// Trailing stop, then take-profit, then stop-loss. The first one that
    /// fires wins and the rest are not evaluated.
    fn check_exits(&mut self, ledger: &Ledger, ticker: &str, bar: &Bar) -> Option<ExitTrigger> {
        let position = ledger.position(ticker)?;
        let entry = position.average_entry_price;
        let side = if position.is_long() {
            TradeType::Long
        } else {
            TradeType::Short
        };

        if side == TradeType::Long {
            if let Some(pct) = self.rules.trailing_stop_pct {
                let stop = self
                    .trackers
                    .trailing
                    .entry(ticker.to_string())
                    .or_insert_with(|| TrailingStop::new(entry, pct));
                if let Some(trigger) = stop.check(bar) {
                    return Some(trigger);
                }
            }
        }

        self.rules
            .check_take_profit(side, entry, bar)
            .or_else(|| self.rules.check_stop_loss(side, entry, bar))
    }

    fn apply_direction(
        &mut self,
        ledger: &mut Ledger,
        ticker: &str,
        direction: Direction,
        bar: &Bar,
        outcome: &mut BarOutcome,
    ) {
        let held = ledger.quantity(ticker);
        match direction {
            Direction::Flat => {}
            Direction::Long if held < Decimal::ZERO => {
                let price = self.slipped(OrderSide::Buy, bar.close);
                self.close_position(ledger, ticker, price, TradeReason::Signal, bar, outcome);
            }
            Direction::Short if held > Decimal::ZERO => {
                let price = self.slipped(OrderSide::Sell, bar.close);
                self.close_position(ledger, ticker, price, TradeReason::Signal, bar, outcome);
            }
            Direction::Long if held.is_zero() => {
                self.enter(ledger, ticker, OrderSide::Buy, bar, outcome);
            }
            Direction::Short if held.is_zero() => {
                if self.config.allow_short {
                    self.enter(ledger, ticker, OrderSide::Sell, bar, outcome);
                } else {
                    debug!(ticker = %ticker, "Short entries disabled, ignoring short signal");
                }
            }
            _ => {
                debug!(ticker = %ticker, direction = ?direction, "Already positioned, holding");
            }
        }
    }

    fn apply_order(
        &mut self,
        ledger: &mut Ledger,
        ticker: &str,
        order: &Order,
        bar: &Bar,
        outcome: &mut BarOutcome,
    ) {
        if let Err(e) = order.validate() {
            warn!(ticker = %ticker, error = %e, "Dropping invalid order");
            return;
        }
        if order.ticker != ticker {
            warn!(
                ticker = %ticker,
                order_ticker = %order.ticker,
                "Dropping order for a different ticker"
            );
            return;
        }

        let Some(price) = self.match_order(order, bar) else {
            debug!(
                ticker = %ticker,
                order_type = ?order.order_type,
                side = ?order.side,
                price = ?order.price,
                "Order not triggered on this bar"
            );
            return;
        };

        if let Err(e) = self.execute_fill(
            ledger,
            ticker,
            order.side,
            order.quantity,
            price,
            TradeReason::Order,
            bar.timestamp,
            outcome,
        ) {
            log_rejection(ticker, &e);
        }
    }

    /// Fill price for a structured order on this bar, if it triggers.
    fn match_order(&self, order: &Order, bar: &Bar) -> Option<Decimal> {
        let exec = self.slipped(order.side, bar.close);
        match (order.order_type, order.side) {
            (OrderType::Market, _) => Some(exec),
            (OrderType::Limit, OrderSide::Buy) => order
                .price
                .filter(|limit| bar.low <= *limit)
                .map(|limit| limit.min(exec)),
            (OrderType::Limit, OrderSide::Sell) => order
                .price
                .filter(|limit| bar.high >= *limit)
                .map(|limit| limit.max(exec)),
            // A bar that gaps through the stop fills at the open
            (OrderType::Stop, OrderSide::Buy) => order
                .price
                .filter(|stop| bar.high >= *stop)
                .map(|stop| stop.max(bar.open)),
            (OrderType::Stop, OrderSide::Sell) => order
                .price
                .filter(|stop| bar.low <= *stop)
                .map(|stop| stop.min(bar.open)),
        }
    }

    fn enter(
        &mut self,
        ledger: &mut Ledger,
        ticker: &str,
        side: OrderSide,
        bar: &Bar,
        outcome: &mut BarOutcome,
    ) {
        let price = self.slipped(side, bar.close);
        let mut quantity = self.sizer.size(ledger.total_equity(), price);

        if side == OrderSide::Buy {
            let unit_cost = price * (Decimal::ONE + self.config.commission_pct);
            let affordable = (ledger.cash() / unit_cost).floor();
            quantity = quantity.min(affordable);
        }

        if quantity <= Decimal::ZERO {
            debug!(ticker = %ticker, price = %price, "Position size rounds to zero, no entry");
            return;
        }

        if let Err(e) = self.execute_fill(
            ledger,
            ticker,
            side,
            quantity,
            price,
            TradeReason::Entry,
            bar.timestamp,
            outcome,
        ) {
            log_rejection(ticker, &e);
        }
    }

    fn close_position(
        &mut self,
        ledger: &mut Ledger,
        ticker: &str,
        price: Decimal,
        reason: TradeReason,
        bar: &Bar,
        outcome: &mut BarOutcome,
    ) {
        let Some(position) = ledger.position(ticker) else {
            return;
        };
        let quantity = position.quantity.abs();
        let side = if position.is_long() {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };

        match self.execute_fill(
            ledger,
            ticker,
            side,
            quantity,
            price,
            reason,
            bar.timestamp,
            outcome,
        ) {
            Ok(()) => outcome.exit_executed = true,
            Err(e) => log_rejection(ticker, &e),
        }
    }

    /// Apply one fill to the ledger, charge commission, record the fill and
    /// any closed round trip, and maintain the trackers.
    #[allow(clippy::too_many_arguments)]
    fn execute_fill(
        &mut self,
        ledger: &mut Ledger,
        ticker: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reason: TradeReason,
        timestamp: DateTime<Utc>,
        outcome: &mut BarOutcome,
    ) -> Result<()> {
        let before = ledger.position(ticker).cloned();
        let commission = quantity * price * self.config.commission_pct;

        let realized = match side {
            OrderSide::Buy => {
                let required = quantity * price + commission;
                if required > ledger.cash() {
                    return Err(Error::InsufficientFunds {
                        required,
                        available: ledger.cash(),
                    });
                }
                ledger.apply_buy(ticker, quantity, price)?
            }
            OrderSide::Sell => {
                let held = ledger.quantity(ticker);
                if held > Decimal::ZERO {
                    ledger.apply_sell(ticker, quantity, price)?
                } else if self.config.allow_short {
                    ledger.apply_short(ticker, quantity, price)?;
                    Decimal::ZERO
                } else {
                    return Err(Error::InsufficientPosition {
                        ticker: ticker.to_string(),
                        requested: quantity,
                        held: held.max(Decimal::ZERO),
                    });
                }
            }
        };
        ledger.charge_commission(commission)?;

        let closed = before
            .as_ref()
            .filter(|p| match side {
                OrderSide::Buy => p.is_short(),
                OrderSide::Sell => p.is_long(),
            })
            .map(|p| (p, quantity.min(p.quantity.abs())));

        let mut fill = Fill::new(ticker, side, quantity, price, timestamp, reason)
            .with_commission(commission);

        if let Some((position, closed_quantity)) = closed {
            fill = fill.with_realized_pnl(Some(realized - commission));
            let trade_type = if position.is_long() {
                TradeType::Long
            } else {
                TradeType::Short
            };
            let entry_date = self
                .trackers
                .entry_dates
                .get(ticker)
                .copied()
                .unwrap_or(timestamp);
            let trade = Trade::close(
                ticker,
                trade_type,
                closed_quantity,
                position.average_entry_price,
                price,
                entry_date,
                timestamp,
                reason,
            );
            info!(
                ticker = %ticker,
                reason = %reason,
                entry = %trade.entry_price,
                exit = %trade.exit_price,
                pnl = %trade.pnl,
                "Round trip closed"
            );
            outcome.trades.push(trade);
        }

        self.update_trackers(ledger, ticker, before.as_ref().map(|p| p.quantity), timestamp);

        info!(
            ticker = %ticker,
            side = ?side,
            quantity = %quantity,
            price = %price,
            commission = %commission,
            reason = %reason,
            cash = %ledger.cash(),
            "Fill executed"
        );
        outcome.fills.push(fill);
        Ok(())
    }

    fn update_trackers(
        &mut self,
        ledger: &Ledger,
        ticker: &str,
        quantity_before: Option<Decimal>,
        timestamp: DateTime<Utc>,
    ) {
        let Some(after) = ledger.position(ticker) else {
            self.trackers.trailing.remove(ticker);
            self.trackers.entry_dates.remove(ticker);
            return;
        };

        let opened = match quantity_before {
            None => true,
            Some(before) => before.is_sign_positive() != after.quantity.is_sign_positive(),
        };
        if !opened {
            return;
        }

        self.trackers
            .entry_dates
            .insert(ticker.to_string(), timestamp);
        match self.rules.trailing_stop_pct {
            Some(pct) if after.is_long() => {
                let stop = TrailingStop::new(after.average_entry_price, pct);
                debug!(ticker = %ticker, level = %stop.stop_level, "Trailing stop initialized");
                self.trackers.trailing.insert(ticker.to_string(), stop);
            }
            _ => {
                self.trackers.trailing.remove(ticker);
            }
        }
    }

    /// Adverse slippage: buys pay more, sells receive less.
    fn slipped(&self, side: OrderSide, price: Decimal) -> Decimal {
        match side {
            OrderSide::Buy => price * (Decimal::ONE + self.config.slippage_pct),
            OrderSide::Sell => price * (Decimal::ONE - self.config.slippage_pct),
        }
    }
}

fn log_rejection(ticker: &str, err: &Error) {
    if err.is_validation() {
        warn!(ticker = %ticker, error = %err, "Fill rejected, no change");
    } else {
        error!(ticker = %ticker, error = %err, "Fill failed");
    }
}
