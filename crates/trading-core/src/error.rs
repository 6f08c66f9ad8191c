//! Error types for the tradeguard system.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Data unavailable for {ticker}: {reason}")]
    DataUnavailable { ticker: String, reason: String },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Insufficient position in {ticker}: requested {requested}, held {held}")]
    InsufficientPosition {
        ticker: String,
        requested: Decimal,
        held: Decimal,
    },

    #[error("Invalid order: {message}")]
    InvalidOrder { message: String },

    #[error("Invalid directional signal: {0} (expected -1, 0 or 1)")]
    InvalidSignal(i8),

    #[error("Persistence error at {path}: {message}")]
    Persistence { path: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Validation failures are logged and dropped rather than propagated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFunds { .. }
                | Error::InsufficientPosition { .. }
                | Error::InvalidOrder { .. }
                | Error::InvalidSignal(_)
        )
    }

    pub fn invalid_order(message: impl Into<String>) -> Self {
        Error::InvalidOrder {
            message: message.into(),
        }
    }

    pub fn data_unavailable(ticker: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::DataUnavailable {
            ticker: ticker.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(Error::invalid_order("zero quantity").is_validation());
        assert!(Error::InvalidSignal(3).is_validation());
        assert!(Error::InsufficientFunds {
            required: Decimal::new(100, 0),
            available: Decimal::new(50, 0),
        }
        .is_validation());
        assert!(!Error::data_unavailable("AAPL", "empty series").is_validation());
        assert!(!Error::Config {
            message: "bad".to_string()
        }
        .is_validation());
    }
}
