//! Fill and trade records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderSide;

/// Why a fill happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeReason {
    /// New position opened from a directional signal.
    Entry,
    /// Opposing directional signal closed the position.
    Signal,
    #[serde(rename = "Stop Loss")]
    StopLoss,
    #[serde(rename = "Take Profit")]
    TakeProfit,
    #[serde(rename = "Trailing Stop")]
    TrailingStop,
    /// Structured order from the strategy.
    Order,
}

impl std::fmt::Display for TradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TradeReason::Entry => "Entry",
            TradeReason::Signal => "Signal",
            TradeReason::StopLoss => "Stop Loss",
            TradeReason::TakeProfit => "Take Profit",
            TradeReason::TrailingStop => "Trailing Stop",
            TradeReason::Order => "Order",
        };
        f.write_str(label)
    }
}

/// Direction of a closed round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeType {
    Long,
    Short,
}

/// A single executed fill against the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: Uuid,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
    pub reason: TradeReason,
    /// P&L realized by this fill, if it reduced a position.
    pub realized_pnl: Option<Decimal>,
}

impl Fill {
    pub fn new(
        ticker: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
        reason: TradeReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            side,
            quantity,
            price,
            commission: Decimal::ZERO,
            timestamp,
            reason,
            realized_pnl: None,
        }
    }

    pub fn with_commission(mut self, commission: Decimal) -> Self {
        self.commission = commission;
        self
    }

    pub fn with_realized_pnl(mut self, pnl: Option<Decimal>) -> Self {
        self.realized_pnl = pnl;
        self
    }

    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// A closed round trip. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub entry_date: DateTime<Utc>,
    pub exit_date: DateTime<Utc>,
    #[serde(rename = "return")]
    pub return_pct: Decimal,
    pub pnl: Decimal,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    pub reason: TradeReason,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn close(
        ticker: impl Into<String>,
        trade_type: TradeType,
        quantity: Decimal,
        entry_price: Decimal,
        exit_price: Decimal,
        entry_date: DateTime<Utc>,
        exit_date: DateTime<Utc>,
        reason: TradeReason,
    ) -> Self {
        let direction = match trade_type {
            TradeType::Long => Decimal::ONE,
            TradeType::Short => Decimal::NEGATIVE_ONE,
        };
        let return_pct = if entry_price.is_zero() {
            Decimal::ZERO
        } else {
            (exit_price - entry_price) / entry_price * direction
        };
        Self {
            ticker: ticker.into(),
            quantity,
            entry_price,
            exit_price,
            entry_date,
            exit_date,
            return_pct,
            pnl: (exit_price - entry_price) * quantity * direction,
            trade_type,
            reason,
        }
    }

    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}
