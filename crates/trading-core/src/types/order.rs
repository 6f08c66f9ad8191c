//! Order and signal types for trading execution.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Side of the order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Type of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Fills at the bar's execution price.
    Market,
    /// Fills only at the limit price or better.
    Limit,
    /// Becomes a market order once the stop price trades.
    Stop,
}

/// A structured order emitted by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    /// Limit or stop price. Ignored for market orders.
    pub price: Option<Decimal>,
}

impl Order {
    pub fn market(ticker: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            ticker: ticker.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
        }
    }

    pub fn limit(
        ticker: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            side,
            quantity,
            order_type: OrderType::Limit,
            price: Some(limit_price),
        }
    }

    pub fn stop(
        ticker: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            side,
            quantity,
            order_type: OrderType::Stop,
            price: Some(stop_price),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ticker.trim().is_empty() {
            return Err(Error::invalid_order("ticker is empty"));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(Error::invalid_order(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.order_type == OrderType::Market {
            return Ok(());
        }
        match self.price {
            Some(price) if price > Decimal::ZERO => Ok(()),
            Some(price) => Err(Error::invalid_order(format!(
                "{:?} price must be positive, got {}",
                self.order_type, price
            ))),
            None => Err(Error::invalid_order(format!(
                "{:?} order requires a price",
                self.order_type
            ))),
        }
    }
}

/// Legacy integer signal resolved into a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Short,
    Flat,
    Long,
}

impl Direction {
    pub fn as_i8(self) -> i8 {
        match self {
            Direction::Short => -1,
            Direction::Flat => 0,
            Direction::Long => 1,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = Error;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            -1 => Ok(Direction::Short),
            0 => Ok(Direction::Flat),
            1 => Ok(Direction::Long),
            other => Err(Error::InvalidSignal(other)),
        }
    }
}

/// What a strategy wants done on a bar.
///
/// Strategies either emit a bare direction or a fully specified order; both
/// are normalized into this type at the boundary so the executor only ever
/// sees one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Signal {
    Directional(Direction),
    Order(Order),
}

impl Signal {
    pub fn from_legacy(value: i8) -> Result<Self> {
        Direction::try_from(value).map(Signal::Directional)
    }

    pub fn long() -> Self {
        Signal::Directional(Direction::Long)
    }

    pub fn short() -> Self {
        Signal::Directional(Direction::Short)
    }

    pub fn flat() -> Self {
        Signal::Directional(Direction::Flat)
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, Signal::Directional(Direction::Flat))
    }
}

impl From<Order> for Signal {
    fn from(order: Order) -> Self {
        Signal::Order(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_validation() {
        let ok = Order::limit("AAPL", OrderSide::Buy, Decimal::new(10, 0), Decimal::new(99, 0));
        assert!(ok.validate().is_ok());

        let zero_qty = Order::market("AAPL", OrderSide::Buy, Decimal::ZERO);
        assert!(matches!(zero_qty.validate(), Err(Error::InvalidOrder { .. })));

        let mut missing_price = Order::stop("AAPL", OrderSide::Sell, Decimal::ONE, Decimal::ONE);
        missing_price.price = None;
        assert!(missing_price.validate().is_err());

        let negative = Order::limit("AAPL", OrderSide::Buy, Decimal::ONE, Decimal::new(-5, 0));
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_legacy_signal_conversion() {
        assert_eq!(Signal::from_legacy(1).unwrap(), Signal::long());
        assert_eq!(Signal::from_legacy(-1).unwrap(), Signal::short());
        assert!(!Signal::from_legacy(0).unwrap().is_actionable());
        assert!(matches!(Signal::from_legacy(2), Err(Error::InvalidSignal(2))));
    }

    #[test]
    fn test_order_serializes_uppercase() {
        let order = Order::market("MSFT", OrderSide::Sell, Decimal::new(5, 0));
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["side"], "SELL");
        assert_eq!(json["order_type"], "MARKET");
    }
}
