//! MartingaleEngine - Main Entry Point
//!
//! Runs the batch engine against the paper broker, or inspects persisted
//! state and order labels.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use martingale_engine::config::loader::load_config;
use martingale_engine::{
    AllowAll, BatchEngine, BatchLabel, Direction, EntrySignal, PaperBroker, PriceBook, Quote,
    SnapshotStore,
};

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the trading loop against the paper broker until Ctrl-C
    Run {
        /// JSON file of `{"SYMBOL": price}` re-read every cycle
        #[arg(long)]
        prices: PathBuf,

        /// Entry signals as SYMBOL:DIRECTION (e.g. EURUSD:long)
        #[arg(long = "open", value_delimiter = ',')]
        open: Vec<String>,

        /// First-layer volume for new batches
        #[arg(long, default_value = "0.01")]
        volume: Decimal,

        /// Trigger spacing for new batches, in pips
        #[arg(long, default_value = "50")]
        spacing_pips: Decimal,

        /// Override the cycle interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Print the persisted snapshot
    Inspect,
    /// Decode an order label
    DecodeLabel { label: String },
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn read_prices(path: &Path) -> Result<PriceBook> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading prices from {}", path.display()))?;
    let raw: HashMap<String, Decimal> = serde_json::from_str(&content)?;
    Ok(raw
        .into_iter()
        .map(|(symbol, price)| (symbol, Quote::flat(price)))
        .collect())
}

fn parse_signal(raw: &str, volume: Decimal, spacing_pips: Decimal) -> Result<EntrySignal> {
    let (symbol, direction) = raw
        .split_once(':')
        .with_context(|| format!("expected SYMBOL:DIRECTION, got {}", raw))?;
    let direction: Direction = direction.parse().map_err(anyhow::Error::msg)?;
    let symbol = symbol.to_uppercase();
    let layer_spacing = spacing_pips * martingale_engine::batch::pip_size(&symbol);
    Ok(EntrySignal {
        symbol,
        direction,
        volume,
        layer_spacing,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let config = load_config(Some(&args.config))?;
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.settings.log_level.clone());
    init_logging(&log_level)?;

    match args.command {
        Command::DecodeLabel { label } => {
            let decoded = BatchLabel::decode(&label)?;
            println!(
                "batch {} | {} {} | layer {}",
                decoded.batch_id, decoded.symbol, decoded.direction, decoded.layer_index
            );
        }
        Command::Inspect => {
            let store = SnapshotStore::from_config(&config);
            match SnapshotStore::read_file(store.primary_path()).await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("No state at {}", store.primary_path().display()),
            }
        }
        Command::Run {
            prices,
            open,
            volume,
            spacing_pips,
            interval,
        } => {
            info!("Starting MartingaleEngine (account {})", config.account.account_id);
            info!("Configuration file: {}", args.config);

            let signals = open
                .iter()
                .map(|raw| parse_signal(raw, volume, spacing_pips))
                .collect::<Result<Vec<_>>>()?;

            let broker = Arc::new(PaperBroker::new());
            let mut engine = BatchEngine::new(&config, broker.clone(), Arc::new(AllowAll));

            let book = read_prices(&prices)?;
            for (symbol, quote) in &book {
                broker.set_quote(symbol, *quote);
            }
            let recovery = engine.startup(&book).await;
            info!(
                "Startup: {} rebuilt, {} adopted, {} missed layers",
                recovery.rebuilt.len(),
                recovery.adopted.len(),
                recovery.missed_layers.len()
            );

            let period = Duration::from_secs(interval.unwrap_or(config.settings.cycle_interval_seconds));
            let mut ticker = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let book = match read_prices(&prices) {
                            Ok(book) => book,
                            Err(e) => {
                                warn!("Skipping cycle, cannot read prices: {:#}", e);
                                continue;
                            }
                        };
                        for (symbol, quote) in &book {
                            broker.set_quote(symbol, *quote);
                        }

                        for signal in &signals {
                            let Some(quote) = book.get(&signal.symbol) else {
                                continue;
                            };
                            if let Err(e) = engine.open_batch(signal, *quote).await {
                                warn!("Entry for {} {} skipped: {}", signal.symbol, signal.direction, e);
                            }
                        }

                        let report = engine.run_cycle(&book).await;
                        info!(
                            "Cycle: {} batches, {} layers added, {} pending, emergency {}",
                            engine.registry().len(),
                            report.layers_added.len(),
                            report.pending.len(),
                            report.emergency_stop
                        );
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal, cleaning up...");
                        engine.persist().await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
