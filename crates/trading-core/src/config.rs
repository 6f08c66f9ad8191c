//! Configuration management for the tradeguard system.
//!
//! Thresholds are consumed here, not owned: the broker, executor, and
//! circuit breaker each receive their own section at construction.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub execution: ExecutionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Starting cash when no snapshot exists.
    pub initial_capital: Decimal,
    /// Location of the broker snapshot.
    pub state_path: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::new(100_000, 0),
            state_path: PathBuf::from("state/broker_state.json"),
        }
    }
}

/// Exit rules, sizing, and cost model for the order executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Adverse move from entry that closes the position (e.g. 0.05 = 5%).
    pub stop_loss_pct: Option<Decimal>,
    /// Favourable move from entry that closes the position.
    pub take_profit_pct: Option<Decimal>,
    /// Distance of the trailing stop below the highest price since entry.
    pub trailing_stop_pct: Option<Decimal>,
    /// Fraction of equity committed to a new directional entry.
    pub position_size_pct: Decimal,
    /// Adverse slippage applied to market fills.
    pub slippage_pct: Decimal,
    /// Commission as a fraction of fill notional.
    pub commission_pct: Decimal,
    /// Whether a short signal may open a short position.
    pub allow_short: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: Some(Decimal::new(5, 2)),
            take_profit_pct: Some(Decimal::new(10, 2)),
            trailing_stop_pct: None,
            position_size_pct: Decimal::new(10, 2),
            slippage_pct: Decimal::ZERO,
            commission_pct: Decimal::ZERO,
            allow_short: false,
        }
    }
}

/// Thresholds for the global circuit breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether the breaker gates trading at all.
    pub enabled: bool,
    /// Cumulative loss (negative) that trips the breaker.
    pub hard_budget_limit: Decimal,
    /// Loss within one UTC day (negative) that trips the breaker.
    pub daily_loss_limit: Decimal,
    /// Drawdown from initial capital (e.g. 0.20 = 20%) that trips the breaker.
    pub max_drawdown_limit: Decimal,
    /// Seconds an open breaker waits before allowing a half-open probe.
    pub failure_timeout_secs: i64,
    /// Consecutive successes needed to close from half-open.
    pub half_open_success_threshold: u32,
    /// Open breakers older than this reset fully.
    pub auto_reset_hours: Option<i64>,
    /// Trips require an explicit `reset()` before probing resumes.
    pub manual_reset_required: bool,
    /// Location of the breaker state file. `None` keeps state in memory.
    pub state_path: Option<PathBuf>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hard_budget_limit: Decimal::new(-10_000, 0),
            daily_loss_limit: Decimal::new(-2_000, 0),
            max_drawdown_limit: Decimal::new(20, 2),
            failure_timeout_secs: 3600,
            half_open_success_threshold: 3,
            auto_reset_hours: None,
            manual_reset_required: false,
            state_path: Some(PathBuf::from("state/circuit_breaker.json")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tickers: Vec<String>,
    /// Bars requested from the data source per ticker per cycle.
    pub lookback: usize,
    pub cycle_interval_secs: u64,
    /// Directory read by the file-backed data source.
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            lookback: 50,
            cycle_interval_secs: 300,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    /// Load a TOML file, overridden by `TRADEGUARD__SECTION__KEY` variables.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("TRADEGUARD")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let broker_defaults = BrokerConfig::default();
        let exec_defaults = ExecutionConfig::default();
        let breaker_defaults = CircuitBreakerConfig::default();
        let engine_defaults = EngineConfig::default();

        let config = Self {
            broker: BrokerConfig {
                initial_capital: env_parse("INITIAL_CAPITAL")?
                    .unwrap_or(broker_defaults.initial_capital),
                state_path: env::var("BROKER_STATE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(broker_defaults.state_path),
            },
            execution: ExecutionConfig {
                stop_loss_pct: env_optional_pct("STOP_LOSS_PCT", exec_defaults.stop_loss_pct)?,
                take_profit_pct: env_optional_pct(
                    "TAKE_PROFIT_PCT",
                    exec_defaults.take_profit_pct,
                )?,
                trailing_stop_pct: env_optional_pct(
                    "TRAILING_STOP_PCT",
                    exec_defaults.trailing_stop_pct,
                )?,
                position_size_pct: env_parse("POSITION_SIZE_PCT")?
                    .unwrap_or(exec_defaults.position_size_pct),
                slippage_pct: env_parse("SLIPPAGE_PCT")?.unwrap_or(exec_defaults.slippage_pct),
                commission_pct: env_parse("COMMISSION_PCT")?
                    .unwrap_or(exec_defaults.commission_pct),
                allow_short: env_parse("ALLOW_SHORT")?.unwrap_or(exec_defaults.allow_short),
            },
            circuit_breaker: CircuitBreakerConfig {
                enabled: env_parse("BREAKER_ENABLED")?.unwrap_or(breaker_defaults.enabled),
                hard_budget_limit: env_parse("HARD_BUDGET_LIMIT")?
                    .unwrap_or(breaker_defaults.hard_budget_limit),
                daily_loss_limit: env_parse("DAILY_LOSS_LIMIT")?
                    .unwrap_or(breaker_defaults.daily_loss_limit),
                max_drawdown_limit: env_parse("MAX_DRAWDOWN_LIMIT")?
                    .unwrap_or(breaker_defaults.max_drawdown_limit),
                failure_timeout_secs: env_parse("FAILURE_TIMEOUT_SECS")?
                    .unwrap_or(breaker_defaults.failure_timeout_secs),
                half_open_success_threshold: env_parse("HALF_OPEN_SUCCESS_THRESHOLD")?
                    .unwrap_or(breaker_defaults.half_open_success_threshold),
                auto_reset_hours: env_parse("AUTO_RESET_HOURS")?
                    .or(breaker_defaults.auto_reset_hours),
                manual_reset_required: env_parse("MANUAL_RESET_REQUIRED")?
                    .unwrap_or(breaker_defaults.manual_reset_required),
                state_path: env::var("BREAKER_STATE_PATH")
                    .ok()
                    .map(PathBuf::from)
                    .or(breaker_defaults.state_path),
            },
            engine: EngineConfig {
                tickers: env::var("TICKERS")
                    .map(|raw| {
                        raw.split(',')
                            .map(|t| t.trim().to_uppercase())
                            .filter(|t| !t.is_empty())
                            .collect()
                    })
                    .unwrap_or(engine_defaults.tickers),
                lookback: env_parse("LOOKBACK")?.unwrap_or(engine_defaults.lookback),
                cycle_interval_secs: env_parse("CYCLE_INTERVAL_SECS")?
                    .unwrap_or(engine_defaults.cycle_interval_secs),
                data_dir: env::var("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(engine_defaults.data_dir),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds that would make the risk controls meaningless.
    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        for (name, value) in [
            ("stop_loss_pct", exec.stop_loss_pct),
            ("take_profit_pct", exec.take_profit_pct),
            ("trailing_stop_pct", exec.trailing_stop_pct),
            ("position_size_pct", Some(exec.position_size_pct)),
            ("slippage_pct", Some(exec.slippage_pct)),
            ("commission_pct", Some(exec.commission_pct)),
        ] {
            if let Some(v) = value {
                check_fraction(name, v)?;
            }
        }

        let breaker = &self.circuit_breaker;
        if breaker.hard_budget_limit >= Decimal::ZERO {
            return Err(config_error("hard_budget_limit must be negative"));
        }
        if breaker.daily_loss_limit >= Decimal::ZERO {
            return Err(config_error("daily_loss_limit must be negative"));
        }
        check_fraction("max_drawdown_limit", breaker.max_drawdown_limit)?;
        if !(0..=MAX_FAILURE_TIMEOUT_SECS).contains(&breaker.failure_timeout_secs) {
            return Err(config_error(format!(
                "failure_timeout_secs must be in [0, {}], got {}",
                MAX_FAILURE_TIMEOUT_SECS, breaker.failure_timeout_secs
            )));
        }
        if let Some(hours) = breaker.auto_reset_hours {
            if !(0..=MAX_AUTO_RESET_HOURS).contains(&hours) {
                return Err(config_error(format!(
                    "auto_reset_hours must be in [0, {}], got {}",
                    MAX_AUTO_RESET_HOURS, hours
                )));
            }
        }
        if breaker.half_open_success_threshold == 0 {
            return Err(config_error("half_open_success_threshold must be at least 1"));
        }
        if self.broker.initial_capital <= Decimal::ZERO {
            return Err(config_error("initial_capital must be positive"));
        }
        Ok(())
    }
}

// Breaker windows are capped at one year
const MAX_FAILURE_TIMEOUT_SECS: i64 = 365 * 24 * 60 * 60;
const MAX_AUTO_RESET_HOURS: i64 = 365 * 24;

fn check_fraction(name: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO || value >= Decimal::ONE {
        return Err(config_error(format!("{} must be in [0, 1), got {}", name, value)));
    }
    Ok(())
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config {
        message: message.into(),
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| config_error(format!("{} is invalid ({}): {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// An explicitly empty value (or "none") disables the rule.
fn env_optional_pct(name: &str, default: Option<Decimal>) -> Result<Option<Decimal>> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() || raw.trim().eq_ignore_ascii_case("none") => Ok(None),
        Ok(_) => env_parse(name),
        Err(_) => Ok(default),
    }
}
