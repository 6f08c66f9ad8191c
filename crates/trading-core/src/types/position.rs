//! Position tracking types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An open holding in one ticker.
///
/// `quantity` is signed: positive is long, negative is short. A position
/// whose quantity reaches zero is removed by the ledger, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Position {
    pub fn new(ticker: impl Into<String>, quantity: Decimal, price: Decimal) -> Self {
        Self {
            ticker: ticker.into(),
            quantity,
            average_entry_price: price,
            current_price: price,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    /// Signed market value; negative for shorts.
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.current_price
    }

    /// Update unrealized P&L from a new mark price.
    pub fn mark(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.average_entry_price) * self.quantity;
    }
}
