use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use tracing::{info, warn};

use pm_arb_core::{EngineConfig, SystemClock, Venue};
use pm_arb_engine::{TradingEngine, UdpNtpTransport};
use pm_arb_store::{MemoryStore, PgStore};
use pm_arb_venue_paper::PaperVenue;

#[derive(Parser)]
#[command(name = "pm-arb")]
#[command(about = "Cross-venue prediction-market arbitrage engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine against Postgres persistence
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Run an end-to-end dry run on in-memory stores and seeded paper books
    Paper {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config, false).await,
        Commands::Paper { config } => run(&config, true).await,
        Commands::CheckConfig { config } => check_config(&config),
    }
}

async fn run(config_path: &str, paper: bool) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading config from {config_path}"))?;
    info!(
        pairs = config.pairs.len(),
        polling_interval_ms = config.polling_interval_ms,
        paper,
        "Starting pm-arb"
    );

    // Venue API clients are external collaborators; both modes run against
    // the paper venue, seeded so the full pipeline is exercised.
    let polymarket = Arc::new(PaperVenue::new(Venue::Polymarket));
    let kalshi = Arc::new(PaperVenue::new(Venue::Kalshi));
    seed_paper_books(&config, &polymarket, &kalshi);

    let engine = if paper {
        let store = Arc::new(MemoryStore::new());
        TradingEngine::new(
            config,
            polymarket,
            kalshi,
            store.clone(),
            store,
            Arc::new(UdpNtpTransport::default()),
            Arc::new(SystemClock),
        )
        .await?
    } else {
        let database_url = config
            .database_url
            .clone()
            .context("run mode requires database_url in the config")?;
        let store = Arc::new(PgStore::connect(&database_url, 5).await?);
        store.ensure_schema().await?;
        TradingEngine::new(
            config,
            polymarket,
            kalshi,
            store.clone(),
            store,
            Arc::new(UdpNtpTransport::default()),
            Arc::new(SystemClock),
        )
        .await?
    };

    tokio::select! {
        result = engine.start() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received; draining in-flight work");
            engine.initiate_shutdown();
            if !engine.wait_for_shutdown(Duration::from_secs(12)).await {
                warn!("Shutdown timed out with work still in flight");
            }
        }
    }
    Ok(())
}

fn check_config(config_path: &str) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading config from {config_path}"))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Seeds a mildly crossed book per pair so the dry run exercises detection,
/// enrichment, risk checks, and both execution legs.
fn seed_paper_books(config: &EngineConfig, polymarket: &PaperVenue, kalshi: &PaperVenue) {
    for pair in &config.pairs {
        polymarket.set_book(&pair.polymarket_id, dec!(0.51), dec!(0.52), dec!(100));
        kalshi.set_book(&pair.kalshi_id, dec!(0.55), dec!(0.56), dec!(100));
    }
}
