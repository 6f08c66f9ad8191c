//! Position sizing for new entries.

use rust_decimal::Decimal;

/// Decides how many units a new entry buys.
pub trait PositionSizer: Send + Sync {
    /// Units to trade given current equity and the expected fill price.
    fn size(&self, equity: Decimal, price: Decimal) -> Decimal;
}

/// Allocates a fixed fraction of equity per entry, in whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PercentOfEquity {
    pub pct: Decimal,
}

impl PercentOfEquity {
    pub fn new(pct: Decimal) -> Self {
        Self { pct }
    }
}

impl PositionSizer for PercentOfEquity {
    fn size(&self, equity: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO || equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (equity * self.pct / price).floor()
    }
}

impl<F> PositionSizer for F
where
    F: Fn(Decimal, Decimal) -> Decimal + Send + Sync,
{
    fn size(&self, equity: Decimal, price: Decimal) -> Decimal {
        self(equity, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of_equity_floors() {
        let sizer = PercentOfEquity::new(Decimal::new(10, 2));
        assert_eq!(
            sizer.size(Decimal::new(100_000, 0), Decimal::new(100, 0)),
            Decimal::new(100, 0)
        );
        // 10_000 / 333 = 30.03
        assert_eq!(
            sizer.size(Decimal::new(100_000, 0), Decimal::new(333, 0)),
            Decimal::new(30, 0)
        );
    }

    #[test]
    fn test_degenerate_inputs() {
        let sizer = PercentOfEquity::new(Decimal::new(10, 2));
        assert_eq!(sizer.size(Decimal::ZERO, Decimal::ONE), Decimal::ZERO);
        assert_eq!(sizer.size(Decimal::ONE, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_closure_sizer() {
        let fixed = |_equity: Decimal, _price: Decimal| Decimal::new(10, 0);
        assert_eq!(fixed.size(Decimal::ONE, Decimal::ONE), Decimal::new(10, 0));
    }
}
