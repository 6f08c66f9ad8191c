//! Paper Trader
//!
//! Long-lived paper trading process plus the admin commands that inspect and
//! override the persisted circuit breaker.

mod data;
mod strategy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use risk_manager::CircuitBreaker;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trading_core::config::Config;
use trading_engine::{Broker, PaperBroker, PercentOfEquity, TradingEngine};

use crate::data::JsonFileDataSource;
use crate::strategy::SmaCrossover;

#[derive(Parser, Debug)]
#[command(author, version, about = "Paper trading with a persisted circuit breaker")]
struct Cli {
    /// TOML configuration file. Environment variables are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run trading cycles on a fixed schedule until interrupted.
    Run {
        /// Stop after this many cycles.
        #[arg(long)]
        cycles: Option<u64>,

        /// Seconds between cycles (defaults to the configured interval).
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Print circuit breaker and broker state.
    Status,

    /// Force trading off, or release a previous override.
    KillSwitch {
        #[command(subcommand)]
        action: KillSwitchAction,
    },

    /// Manually close an open circuit breaker.
    Reset,
}

#[derive(Subcommand, Debug)]
enum KillSwitchAction {
    Activate {
        #[arg(long)]
        reason: String,
    },
    Deactivate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            cycles,
            interval_secs,
        } => run(config, cycles, interval_secs).await,
        Commands::Status => status(&config),
        Commands::KillSwitch { action } => {
            let breaker = CircuitBreaker::from_config(config.circuit_breaker);
            match action {
                KillSwitchAction::Activate { reason } => {
                    breaker.activate_kill_switch(reason);
                    println!("Kill switch activated");
                }
                KillSwitchAction::Deactivate => {
                    if breaker.deactivate_kill_switch() {
                        println!("Kill switch deactivated, circuit breaker closed");
                    } else {
                        println!("Kill switch was not active");
                    }
                }
            }
            Ok(())
        }
        Commands::Reset => {
            let breaker = CircuitBreaker::from_config(config.circuit_breaker);
            if !breaker.reset() {
                bail!("reset refused while the kill switch is active");
            }
            println!("Circuit breaker reset to CLOSED");
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "paper_trader=info,trading_engine=info,risk_manager=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    Ok(config)
}

fn open_broker(config: &Config) -> PaperBroker {
    PaperBroker::open(
        &config.broker,
        config.execution.clone(),
        Box::new(PercentOfEquity::new(config.execution.position_size_pct)),
    )
}

async fn run(config: Config, cycles: Option<u64>, interval_secs: Option<u64>) -> Result<()> {
    if config.engine.tickers.is_empty() {
        bail!("no tickers configured (set TICKERS or engine.tickers)");
    }

    let breaker = Arc::new(CircuitBreaker::from_config(config.circuit_breaker.clone()));
    breaker.on_event("log", |event| {
        info!(event = ?event, "Circuit breaker event");
    });

    let mut broker = open_broker(&config);
    broker.on_trade("log", |fill| {
        info!(
            ticker = %fill.ticker,
            side = ?fill.side,
            quantity = %fill.quantity,
            price = %fill.price,
            reason = %fill.reason,
            "Trade executed"
        );
    });

    let mut engine = TradingEngine::new(
        broker,
        Arc::clone(&breaker),
        Box::new(JsonFileDataSource::new(&config.engine.data_dir)),
        Box::new(SmaCrossover::default()),
        &config.engine,
        config.broker.initial_capital,
    );

    let period = interval_secs.unwrap_or(config.engine.cycle_interval_secs).max(1);
    info!(
        tickers = ?config.engine.tickers,
        interval_secs = period,
        cycles = ?cycles,
        "Starting paper trader"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(period));
    let mut completed: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.run_cycle();
                completed += 1;
                info!(
                    cycle = completed,
                    processed = report.processed,
                    skipped = report.skipped,
                    halted = report.halted,
                    portfolio_value = %report.portfolio_value,
                    healthy = report.health.healthy,
                    "Cycle finished"
                );
                if cycles.is_some_and(|limit| completed >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!(
        cycles = completed,
        cash = %engine.broker().cash(),
        portfolio_value = %engine.broker().portfolio_value(),
        "Paper trader stopped"
    );
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let breaker = CircuitBreaker::from_config(config.circuit_breaker.clone());
    let broker = open_broker(config);

    println!("Circuit breaker:");
    println!("{}", serde_json::to_string_pretty(&breaker.state())?);
    println!();
    println!("Cash:            {}", broker.cash());
    println!("Portfolio value: {}", broker.portfolio_value());
    println!("Realized trades: {}", broker.completed_trades().len());
    let mut positions: Vec<_> = broker.positions().values().collect();
    positions.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    for position in positions {
        println!(
            "  {:<8} qty {:>10}  avg {:>10}  last {:>10}  upnl {:>10}",
            position.ticker,
            position.quantity,
            position.average_entry_price,
            position.current_price,
            position.unrealized_pnl
        );
    }
    Ok(())
}
