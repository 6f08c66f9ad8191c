//! Stop-loss, take-profit, and trailing-stop evaluation against a bar.
//!
//! Triggers are checked against the bar's intrabar extremes rather than the
//! close, and fill at the exact threshold price.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use trading_core::config::ExecutionConfig;
use trading_core::types::{Bar, TradeReason, TradeType};

/// A threshold that was crossed during a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitTrigger {
    pub reason: TradeReason,
    /// Price at which the exit fills.
    pub price: Decimal,
}

/// Percentage exit thresholds measured from the average entry price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    pub stop_loss_pct: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    pub trailing_stop_pct: Option<Decimal>,
}

impl ExitRules {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            stop_loss_pct: config.stop_loss_pct,
            take_profit_pct: config.take_profit_pct,
            trailing_stop_pct: config.trailing_stop_pct,
        }
    }

    /// Price at which the position has gained `take_profit_pct`.
    pub fn take_profit_price(&self, side: TradeType, entry_price: Decimal) -> Option<Decimal> {
        self.take_profit_pct.map(|pct| match side {
            TradeType::Long => entry_price * (Decimal::ONE + pct),
            TradeType::Short => entry_price * (Decimal::ONE - pct),
        })
    }

    /// Price at which the position has lost `stop_loss_pct`.
    pub fn stop_loss_price(&self, side: TradeType, entry_price: Decimal) -> Option<Decimal> {
        self.stop_loss_pct.map(|pct| match side {
            TradeType::Long => entry_price * (Decimal::ONE - pct),
            TradeType::Short => entry_price * (Decimal::ONE + pct),
        })
    }

    /// Target reached anywhere inside the bar fills at the target itself.
    pub fn check_take_profit(
        &self,
        side: TradeType,
        entry_price: Decimal,
        bar: &Bar,
    ) -> Option<ExitTrigger> {
        let target = self.take_profit_price(side, entry_price)?;
        let reached = match side {
            TradeType::Long => bar.high >= target,
            TradeType::Short => bar.low <= target,
        };
        reached.then_some(ExitTrigger {
            reason: TradeReason::TakeProfit,
            price: target,
        })
    }

    pub fn check_stop_loss(
        &self,
        side: TradeType,
        entry_price: Decimal,
        bar: &Bar,
    ) -> Option<ExitTrigger> {
        let stop = self.stop_loss_price(side, entry_price)?;
        let reached = match side {
            TradeType::Long => bar.low <= stop,
            TradeType::Short => bar.high >= stop,
        };
        reached.then_some(ExitTrigger {
            reason: TradeReason::StopLoss,
            price: stop,
        })
    }

    /// Tracker for a freshly opened long, if trailing stops are enabled.
    pub fn trailing_for_entry(&self, entry_price: Decimal) -> Option<TrailingStop> {
        self.trailing_stop_pct
            .map(|pct| TrailingStop::new(entry_price, pct))
    }
}

/// Ratcheting stop for a long position.
///
/// The stop level only ever moves up. It lives while the position is open
/// and is discarded when the position closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub offset_pct: Decimal,
    pub highest_price: Decimal,
    pub stop_level: Decimal,
}

impl TrailingStop {
    pub fn new(entry_price: Decimal, offset_pct: Decimal) -> Self {
        Self {
            offset_pct,
            highest_price: entry_price,
            stop_level: entry_price * (Decimal::ONE - offset_pct),
        }
    }

    /// Raise the highest price from a bar high. Returns the stop level.
    pub fn update(&mut self, high: Decimal) -> Decimal {
        if high > self.highest_price {
            self.highest_price = high;
        }
        let candidate = self.highest_price * (Decimal::ONE - self.offset_pct);
        if candidate > self.stop_level {
            debug!(
                highest = %self.highest_price,
                old_level = %self.stop_level,
                new_level = %candidate,
                "Trailing stop raised"
            );
            self.stop_level = candidate;
        }
        self.stop_level
    }

    pub fn is_triggered(&self, low: Decimal) -> bool {
        low <= self.stop_level
    }

    /// Ratchet from the bar high, then test the bar low.
    pub fn check(&mut self, bar: &Bar) -> Option<ExitTrigger> {
        let level = self.update(bar.high);
        self.is_triggered(bar.low).then_some(ExitTrigger {
            reason: TradeReason::TrailingStop,
            price: level,
        })
    }
}
