//! Bar history read from per-ticker JSON files.

use std::path::{Path, PathBuf};

use tracing::debug;
use trading_core::persistence::read_json;
use trading_core::types::Bar;
use trading_core::{Error, Result};
use trading_engine::engine::DataSource;

/// Reads `<dir>/<TICKER>.json`, a JSON array of bars.
///
/// The file is re-read on every fetch so an external downloader can refresh
/// it between cycles.
#[derive(Debug, Clone)]
pub struct JsonFileDataSource {
    dir: PathBuf,
}

impl JsonFileDataSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, ticker: &str) -> PathBuf {
        self.dir.join(format!("{}.json", ticker))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DataSource for JsonFileDataSource {
    fn fetch(&self, ticker: &str, lookback: usize) -> Result<Vec<Bar>> {
        let path = self.path_for(ticker);
        let mut bars: Vec<Bar> = read_json(&path)?.ok_or_else(|| {
            Error::data_unavailable(ticker, format!("no data file at {}", path.display()))
        })?;

        bars.sort_by_key(|bar| bar.timestamp);
        if bars.len() > lookback {
            bars.drain(..bars.len() - lookback);
        }

        debug!(ticker = %ticker, bars = bars.len(), "Loaded bars");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn write_bars(dir: &Path, ticker: &str, count: i64) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Written newest first to check ordering
        let bars: Vec<Bar> = (0..count)
            .rev()
            .map(|i| {
                let price = Decimal::new(100 + i, 0);
                Bar::new(start + Duration::days(i), price, price, price, price)
            })
            .collect();
        std::fs::write(
            dir.join(format!("{}.json", ticker)),
            serde_json::to_string(&bars).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_fetch_returns_latest_bars_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_bars(dir.path(), "AAPL", 10);

        let source = JsonFileDataSource::new(dir.path());
        let bars = source.fetch("AAPL", 3).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, Decimal::new(107, 0));
        assert_eq!(bars[2].close, Decimal::new(109, 0));
    }

    #[test]
    fn test_missing_file_is_data_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonFileDataSource::new(dir.path());
        assert!(matches!(
            source.fetch("NOPE", 5),
            Err(Error::DataUnavailable { .. })
        ));
    }
}
