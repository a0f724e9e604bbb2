//! pair-engine: two-sided arbitrage engine for binary slot markets.
//!
//! Usage:
//!   pair-engine [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Config file path (default: config/engine.toml)
//!   --assets <ASSETS>      Comma-separated assets (overrides config)
//!   --dry-run              Simulate placements (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pair_engine::{Engine, EngineConfig, MemoryStore, SimExchange, SystemClock};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pair-engine")]
#[command(about = "Two-sided arbitrage engine for 15-minute binary markets")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/engine.toml")]
    config: PathBuf,

    /// Comma-separated assets to trade (e.g., "BTC,ETH,SOL")
    #[arg(long, value_delimiter = ',')]
    assets: Option<Vec<String>>,

    /// Simulate placements without exchange calls
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        EngineConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        EngineConfig::default()
    };

    config.apply_env_overrides();
    if let Some(assets) = args.assets {
        config.assets = assets;
    }
    if args.dry_run {
        config.dry_run = true;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting pair-engine");
    info!("Assets: {:?}", config.assets);
    info!("Dry run: {}", config.dry_run);

    config.validate().context("Configuration validation failed")?;

    // The exchange adapter and a durable store are deployment concerns
    // injected behind the `Exchange`/`Store` traits; the stock binary wires
    // the in-memory simulation pair, which is only meaningful for dry runs.
    if !config.dry_run {
        warn!("No live exchange adapter is wired in this build; forcing dry run");
        config.dry_run = true;
    }
    let exchange = Arc::new(SimExchange::new());
    let store = Arc::new(MemoryStore::new());

    let engine = Arc::new(Engine::new(
        config,
        exchange,
        store,
        Arc::new(SystemClock),
    )?);

    // First Ctrl-C begins graceful shutdown; the second forces exit.
    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested (Ctrl-C)");
            handle.request_shutdown();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Forced exit");
            std::process::exit(130);
        }
    });

    engine.run().await
}
