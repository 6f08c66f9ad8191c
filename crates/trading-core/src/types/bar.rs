//! OHLCV bar type.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One OHLCV observation for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = volume;
        self
    }

    /// Reject bars whose extremes don't bracket open and close.
    pub fn validate(&self, ticker: &str) -> Result<()> {
        if self.low <= Decimal::ZERO {
            return Err(Error::data_unavailable(
                ticker,
                format!("non-positive low {}", self.low),
            ));
        }
        if self.high < self.low {
            return Err(Error::data_unavailable(
                ticker,
                format!("high {} below low {}", self.high, self.low),
            ));
        }
        for (name, value) in [("open", self.open), ("close", self.close)] {
            if value < self.low || value > self.high {
                return Err(Error::data_unavailable(
                    ticker,
                    format!("{} {} outside [{}, {}]", name, value, self.low, self.high),
                ));
            }
        }
        Ok(())
    }
}
