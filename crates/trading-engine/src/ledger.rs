//! Cash and position bookkeeping.
//!
//! The ledger is the only owner of positions. Every operation either applies
//! completely or returns an error with nothing changed.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use trading_core::types::Position;
use trading_core::{Error, Result};

/// Authoritative cash and position state for one portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    cash: Decimal,
    positions: HashMap<String, Position>,
    realized_pnl: Decimal,
}

impl Ledger {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            cash: initial_cash,
            positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Rebuild from a persisted snapshot. Zero-quantity entries are dropped.
    pub fn restore(
        cash: Decimal,
        positions: HashMap<String, Position>,
        realized_pnl: Decimal,
    ) -> Self {
        let positions = positions
            .into_iter()
            .filter(|(_, p)| !p.quantity.is_zero())
            .collect();
        Self {
            cash,
            positions,
            realized_pnl,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, ticker: &str) -> Option<&Position> {
        self.positions.get(ticker)
    }

    /// Signed quantity held, zero when flat.
    pub fn quantity(&self, ticker: &str) -> Decimal {
        self.positions
            .get(ticker)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Cumulative realized P&L since this ledger was created.
    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    /// Cash plus the signed market value of every position.
    pub fn total_equity(&self) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(Position::market_value)
                .sum::<Decimal>()
    }

    /// Buy `quantity` at `price`. Covers an open short first; any remainder
    /// opens or adds to a long. Returns the P&L realized by covering.
    pub fn apply_buy(
        &mut self,
        ticker: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Decimal> {
        check_fill(quantity, price)?;
        let cost = quantity * price;
        if cost > self.cash {
            return Err(Error::InsufficientFunds {
                required: cost,
                available: self.cash,
            });
        }

        let held = self.quantity(ticker);
        let mut realized = Decimal::ZERO;
        let new_quantity = held + quantity;

        match self.positions.get_mut(ticker) {
            Some(position) if position.is_short() => {
                let covered = quantity.min(-held);
                realized = (position.average_entry_price - price) * covered;
                position.quantity = new_quantity;
                if new_quantity > Decimal::ZERO {
                    // Flipped through zero into a long
                    position.average_entry_price = price;
                }
                position.mark(price);
            }
            Some(position) => {
                position.average_entry_price =
                    (held * position.average_entry_price + quantity * price) / new_quantity;
                position.quantity = new_quantity;
                position.mark(price);
            }
            None => {
                self.positions
                    .insert(ticker.to_string(), Position::new(ticker, quantity, price));
            }
        }

        self.cash -= cost;
        self.realized_pnl += realized;
        self.remove_if_flat(ticker);

        debug!(
            ticker = %ticker,
            quantity = %quantity,
            price = %price,
            cash = %self.cash,
            position = %new_quantity,
            "Applied buy"
        );
        Ok(realized)
    }

    /// Sell `quantity` of a long position at `price`. Returns realized P&L.
    pub fn apply_sell(
        &mut self,
        ticker: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<Decimal> {
        check_fill(quantity, price)?;
        let held = self.quantity(ticker).max(Decimal::ZERO);
        if quantity > held {
            return Err(Error::InsufficientPosition {
                ticker: ticker.to_string(),
                requested: quantity,
                held,
            });
        }

        let realized = match self.positions.get_mut(ticker) {
            Some(position) => {
                let realized = (price - position.average_entry_price) * quantity;
                position.quantity -= quantity;
                position.mark(price);
                realized
            }
            None => Decimal::ZERO,
        };

        self.cash += quantity * price;
        self.realized_pnl += realized;
        self.remove_if_flat(ticker);

        debug!(
            ticker = %ticker,
            quantity = %quantity,
            price = %price,
            realized = %realized,
            cash = %self.cash,
            "Applied sell"
        );
        Ok(realized)
    }

    /// Open or extend a short position; proceeds are credited to cash.
    pub fn apply_short(&mut self, ticker: &str, quantity: Decimal, price: Decimal) -> Result<()> {
        check_fill(quantity, price)?;
        let held = self.quantity(ticker);
        if held > Decimal::ZERO {
            return Err(Error::invalid_order(format!(
                "cannot short {} while holding a long of {}",
                ticker, held
            )));
        }

        match self.positions.get_mut(ticker) {
            Some(position) => {
                let short_held = -held;
                position.average_entry_price = (short_held * position.average_entry_price
                    + quantity * price)
                    / (short_held + quantity);
                position.quantity = held - quantity;
                position.mark(price);
            }
            None => {
                self.positions
                    .insert(ticker.to_string(), Position::new(ticker, -quantity, price));
            }
        }

        self.cash += quantity * price;

        debug!(
            ticker = %ticker,
            quantity = %quantity,
            price = %price,
            cash = %self.cash,
            "Applied short"
        );
        Ok(())
    }

    pub fn charge_commission(&mut self, amount: Decimal) -> Result<()> {
        if amount < Decimal::ZERO {
            return Err(Error::invalid_order(format!(
                "commission must be non-negative, got {}",
                amount
            )));
        }
        if amount > self.cash {
            return Err(Error::InsufficientFunds {
                required: amount,
                available: self.cash,
            });
        }
        self.cash -= amount;
        Ok(())
    }

    /// Mark one position to `price`. No-op when flat.
    pub fn mark(&mut self, ticker: &str, price: Decimal) {
        if let Some(position) = self.positions.get_mut(ticker) {
            position.mark(price);
        }
    }

    /// Recompute unrealized P&L from the given prices and return total
    /// equity. Tickers without a price keep their last mark.
    pub fn mark_to_market(&mut self, prices: &HashMap<String, Decimal>) -> Decimal {
        for (ticker, position) in self.positions.iter_mut() {
            if let Some(price) = prices.get(ticker) {
                position.mark(*price);
            }
        }
        self.total_equity()
    }

    fn remove_if_flat(&mut self, ticker: &str) {
        if self
            .positions
            .get(ticker)
            .is_some_and(|p| p.quantity.is_zero())
        {
            self.positions.remove(ticker);
        }
    }
}

fn check_fill(quantity: Decimal, price: Decimal) -> Result<()> {
    if quantity <= Decimal::ZERO {
        return Err(Error::invalid_order(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    if price <= Decimal::ZERO {
        return Err(Error::invalid_order(format!(
            "price must be positive, got {}",
            price
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    #[test]
    fn test_round_trip_restores_cash() {
        let mut ledger = Ledger::new(d(100_000));
        ledger.apply_buy("AAPL", d(10), d(100)).unwrap();
        assert_eq!(ledger.cash(), d(99_000));
        let position = ledger.position("AAPL").unwrap();
        assert_eq!(position.quantity, d(10));
        assert_eq!(position.average_entry_price, d(100));

        let realized = ledger.apply_sell("AAPL", d(10), d(100)).unwrap();
        assert_eq!(realized, Decimal::ZERO);
        assert_eq!(ledger.cash(), d(100_000));
        assert!(ledger.position("AAPL").is_none());
    }

    #[test]
    fn test_weighted_average_entry() {
        let mut ledger = Ledger::new(d(100_000));
        ledger.apply_buy("MSFT", d(10), d(100)).unwrap();
        ledger.apply_buy("MSFT", d(30), d(120)).unwrap();
        let position = ledger.position("MSFT").unwrap();
        assert_eq!(position.quantity, d(40));
        assert_eq!(position.average_entry_price, d(115));

        let odd = {
            let mut l = Ledger::new(d(100_000));
            l.apply_buy("X", d(3), d(10)).unwrap();
            l.apply_buy("X", d(7), d(13)).unwrap();
            l.position("X").unwrap().average_entry_price
        };
        assert_eq!(odd, (d(3) * d(10) + d(7) * d(13)) / d(10));
    }

    #[test]
    fn test_oversell_is_rejected_without_mutation() {
        let mut ledger = Ledger::new(d(10_000));
        ledger.apply_buy("AAPL", d(5), d(100)).unwrap();
        let before = ledger.clone();

        let err = ledger.apply_sell("AAPL", d(6), d(100)).unwrap_err();
        assert!(matches!(err, Error::InsufficientPosition { .. }));
        assert_eq!(ledger, before);

        let err = ledger.apply_sell("TSLA", d(1), d(100)).unwrap_err();
        assert!(matches!(err, Error::InsufficientPosition { .. }));
    }

    #[test]
    fn test_insufficient_funds() {
        let mut ledger = Ledger::new(d(500));
        let err = ledger.apply_buy("AAPL", d(10), d(100)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(ledger.cash(), d(500));
        assert!(ledger.positions().is_empty());
    }

    #[test]
    fn test_partial_sell_realizes_pnl() {
        let mut ledger = Ledger::new(d(10_000));
        ledger.apply_buy("AAPL", d(10), d(100)).unwrap();
        let realized = ledger.apply_sell("AAPL", d(4), d(110)).unwrap();
        assert_eq!(realized, d(40));
        assert_eq!(ledger.quantity("AAPL"), d(6));
        assert_eq!(ledger.position("AAPL").unwrap().average_entry_price, d(100));
        assert_eq!(ledger.realized_pnl(), d(40));
    }

    #[test]
    fn test_short_then_cover() {
        let mut ledger = Ledger::new(d(10_000));
        ledger.apply_short("TSLA", d(10), d(200)).unwrap();
        assert_eq!(ledger.cash(), d(12_000));
        assert_eq!(ledger.quantity("TSLA"), d(-10));
        assert_eq!(ledger.total_equity(), d(10_000));

        let realized = ledger.apply_buy("TSLA", d(10), d(180)).unwrap();
        assert_eq!(realized, d(200));
        assert_eq!(ledger.cash(), d(10_200));
        assert!(ledger.position("TSLA").is_none());
    }

    #[test]
    fn test_cover_beyond_short_flips_long() {
        let mut ledger = Ledger::new(d(10_000));
        ledger.apply_short("TSLA", d(5), d(200)).unwrap();
        ledger.apply_buy("TSLA", d(8), d(190)).unwrap();
        let position = ledger.position("TSLA").unwrap();
        assert_eq!(position.quantity, d(3));
        assert_eq!(position.average_entry_price, d(190));
        assert_eq!(ledger.realized_pnl(), d(50));
    }

    #[test]
    fn test_short_while_long_rejected() {
        let mut ledger = Ledger::new(d(10_000));
        ledger.apply_buy("AAPL", d(1), d(100)).unwrap();
        assert!(ledger.apply_short("AAPL", d(1), d(100)).is_err());
        assert_eq!(ledger.quantity("AAPL"), d(1));
    }

    #[test]
    fn test_equity_invariant_after_marking() {
        let mut ledger = Ledger::new(d(50_000));
        ledger.apply_buy("AAPL", d(10), d(100)).unwrap();
        ledger.apply_short("TSLA", d(5), d(200)).unwrap();

        let prices = HashMap::from([
            ("AAPL".to_string(), d(110)),
            ("TSLA".to_string(), d(190)),
        ]);
        let equity = ledger.mark_to_market(&prices);

        let market_value: Decimal = ledger.positions().values().map(|p| p.market_value()).sum();
        assert_eq!(equity, ledger.cash() + market_value);
        // +100 on the long, +50 on the short
        assert_eq!(equity, d(50_150));
        assert_eq!(ledger.position("AAPL").unwrap().unrealized_pnl, d(100));
        assert_eq!(ledger.position("TSLA").unwrap().unrealized_pnl, d(50));
    }

    #[test]
    fn test_commission() {
        let mut ledger = Ledger::new(d(100));
        ledger.charge_commission(d(3)).unwrap();
        assert_eq!(ledger.cash(), d(97));
        assert!(ledger.charge_commission(d(98)).is_err());
        assert!(ledger.charge_commission(d(-1)).is_err());
        assert_eq!(ledger.cash(), d(97));
    }

    #[test]
    fn test_invalid_fill_inputs() {
        let mut ledger = Ledger::new(d(1_000));
        assert!(ledger.apply_buy("AAPL", Decimal::ZERO, d(10)).is_err());
        assert!(ledger.apply_buy("AAPL", d(1), Decimal::ZERO).is_err());
        assert!(ledger.apply_short("AAPL", d(-1), d(10)).is_err());
    }
}
