//! Simple moving-average crossover.

use rust_decimal::Decimal;
use trading_core::types::{Bar, Signal};
use trading_engine::engine::Strategy;

/// Goes long when the fast average crosses above the slow one and short
/// when it crosses below. Bars without a cross carry no signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmaCrossover {
    pub fast: usize,
    pub slow: usize,
}

impl Default for SmaCrossover {
    fn default() -> Self {
        Self { fast: 10, slow: 30 }
    }
}

impl SmaCrossover {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self { fast, slow }
    }

    /// Bars needed before the first signal can appear.
    pub fn warmup(&self) -> usize {
        self.slow.max(self.fast) + 1
    }
}

impl Strategy for SmaCrossover {
    fn generate_signals(&self, _ticker: &str, bars: &[Bar]) -> Vec<Option<Signal>> {
        let mut signals = vec![None; bars.len()];
        if self.fast == 0 || self.slow == 0 || bars.len() < self.warmup() {
            return signals;
        }

        // prefix[i] = sum of the first i closes
        let mut prefix = Vec::with_capacity(bars.len() + 1);
        prefix.push(Decimal::ZERO);
        for bar in bars {
            let last = prefix.last().copied().unwrap_or(Decimal::ZERO);
            prefix.push(last + bar.close);
        }
        let sma = |end: usize, window: usize| -> Decimal {
            (prefix[end + 1] - prefix[end + 1 - window]) / Decimal::from(window)
        };

        for i in (self.warmup() - 1)..bars.len() {
            let spread_now = sma(i, self.fast) - sma(i, self.slow);
            let spread_prev = sma(i - 1, self.fast) - sma(i - 1, self.slow);

            signals[i] = if spread_now > Decimal::ZERO && spread_prev <= Decimal::ZERO {
                Some(Signal::long())
            } else if spread_now < Decimal::ZERO && spread_prev >= Decimal::ZERO {
                Some(Signal::short())
            } else {
                None
            };
        }

        signals
    }
}
