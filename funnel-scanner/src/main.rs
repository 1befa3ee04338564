//! Funnel Scanner - cascading 1h/15m/5m kline scanner.
//!
//! Ranks the exchange's spot universe on hourly bars, refines the leaders on
//! 15-minute bars and emits signals from 5-minute confirmation.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use funnel_common::config::Config;
use funnel_common::logging::init_logging;
use funnel_scanner::funnel::Stage;
use funnel_scanner::ScannerService;

#[derive(Parser)]
#[command(name = "funnel-scanner")]
#[command(about = "Cascading kline scanner that ranks symbols and emits trade signals")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to ~/.funnel/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync, backfill, then run all stages on their schedules
    Run,
    /// Refresh the symbol universe
    Sync,
    /// Load 1h history for symbols that have too little
    Backfill,
    /// Run a single stage once
    Stage {
        /// hourly, refine or confirm
        stage: String,
    },
    /// Show recent signals
    Signals {
        /// Number of signals to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List stored strategies
    Strategies,
    /// Replay stored 1h bars for a symbol against a strategy
    Backtest {
        symbol: String,
        /// Strategy name (defaults to the configured one)
        #[arg(short, long)]
        strategy: Option<String>,
        /// Also list every trade
        #[arg(long)]
        trades: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_and_validate(cli.config.as_deref())?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Funnel Scanner v{}", env!("CARGO_PKG_VERSION"));

    let service = ScannerService::new(config)?;

    match cli.command {
        Commands::Run => service.run().await?,
        Commands::Sync => {
            let stages = service.stages(None).await?;
            println!("{}", stages.sync_universe().await?);
        }
        Commands::Backfill => {
            let stages = service.stages(None).await?;
            println!("{}", stages.backfill_history().await?);
        }
        Commands::Stage { stage } => {
            let stage = match Stage::parse(&stage.to_ascii_lowercase()) {
                Some(stage @ (Stage::Hourly | Stage::Refine | Stage::Confirm)) => stage,
                _ => bail!("Unknown stage '{}': expected hourly, refine or confirm", stage),
            };
            let stages = service.stages(None).await?;
            let report = stages.run(stage).await?;
            println!("{}", report);
            for candidate in &report.candidates {
                println!("  #{:<3} {:<16} {:+.3}", candidate.rank, candidate.symbol, candidate.score);
            }
            if !report.strategy_matches.is_empty() {
                println!("  strategy matches: {}", report.strategy_matches.join(", "));
            }
            for signal in &report.signals {
                println!(
                    "  {} @ {} (sl {:.6}, tp {:.6}) conf {:.2} [{}]",
                    signal.symbol,
                    signal.price,
                    signal.stop_loss,
                    signal.take_profit,
                    signal.confidence,
                    signal.active_indicators.join(", ")
                );
            }
        }
        Commands::Signals { limit } => {
            let signals = service.storage().get_recent_signals(limit).await?;
            if signals.is_empty() {
                println!("No signals yet");
            }
            for signal in signals {
                println!(
                    "{} {:<16} {:>14} score {:+.3} conf {:.2} {} [{}]",
                    signal.created_at.format("%Y-%m-%d %H:%M:%S"),
                    signal.symbol,
                    signal.price,
                    signal.prob_score,
                    signal.confidence,
                    signal.strategy,
                    signal.active_indicators.join(", ")
                );
            }
        }
        Commands::Strategies => {
            service.load_strategies().await?;
            for strategy in service.storage().list_strategies().await? {
                println!(
                    "{:<16} min_signals {} prob >= {:.2} risk {}",
                    strategy.name, strategy.min_signals, strategy.prob_threshold, strategy.risk
                );
            }
            println!("{}", service.storage().get_stats().await?);
        }
        Commands::Backtest {
            symbol,
            strategy,
            trades,
        } => {
            let symbol = symbol.to_ascii_uppercase();
            let result = service.backtest(&symbol, strategy.as_deref()).await?;
            println!(
                "{} on {} ({} bars, sl {:.1}%, tp {:.1}%)",
                result.strategy,
                symbol,
                result.bars_replayed,
                result.config.stop_loss_pct * 100.0,
                result.config.take_profit_pct * 100.0
            );
            println!("{}", result.metrics);
            if trades {
                for trade in &result.trades {
                    let at = |ms: i64| {
                        DateTime::<Utc>::from_timestamp_millis(ms)
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| ms.to_string())
                    };
                    println!(
                        "  {} {} -> {} {} {:+.2}% ({})",
                        at(trade.entry_time),
                        trade.entry_price,
                        at(trade.exit_time),
                        trade.exit_price,
                        trade.return_pct(),
                        trade.exit_reason
                    );
                }
            }
        }
    }

    Ok(())
}
