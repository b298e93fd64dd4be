mod allocation;
mod candles;
mod config;
mod data;
mod error;
mod index;
mod market;
mod persistence;
mod portfolio;
mod registry;
mod scoring;
mod simulator;
mod webui;

use allocation::AllocationService;
use anyhow::{Context, Result};
use candles::CandleHistoryBuilder;
use clap::Parser;
use config::SimConfig;
use data::StockData;
use market::MarketEngine;
use persistence::{JsonFileStore, MemoryStore, SnapshotStore};
use registry::InstrumentRegistry;
use scoring::MomentumScorer;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PaperMarket: simulated stock market with a knapsack allocation optimizer",
    after_help = "EXAMPLES:
    # Run the tick loop and the HTTP/WebSocket API
    cargo run --release -- --serve --port 8080

    # Print a deterministic candle series
    cargo run --release -- --candles NABIL --timeframe 1D --seed 42

    # Advance 500 cycles headless and print the index
    cargo run --release -- --ticks 500

    # Allocate a budget using momentum scores after 200 warm-up cycles
    cargo run --release -- --optimize 100000 --ticks 200 --unit-cap 50"
)]
struct Args {
    /// Run the market loop and serve the API
    #[arg(long)]
    serve: bool,

    /// API server port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Print the candle series for this symbol as JSON
    #[arg(long)]
    candles: Option<String>,

    /// Candle timeframe (1D, 1W, 1M, 3M, 1Y)
    #[arg(long, default_value = "1D")]
    timeframe: String,

    /// Base seed (default: PAPERMARKET_SEED or 42)
    #[arg(long)]
    seed: Option<u64>,

    /// Number of tick cycles to run headless
    #[arg(long)]
    ticks: Option<u64>,

    /// Optimize an allocation for this budget and print it as JSON
    #[arg(long)]
    optimize: Option<f64>,

    /// Maximum units per instrument for --optimize
    #[arg(long)]
    unit_cap: Option<u64>,

    /// Keep snapshots in memory only (no files under the data directory)
    #[arg(long)]
    no_persist: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("papermarket=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    config::init_cpu_parallelism();

    let args = Args::parse();
    let mut config = SimConfig::from_env();
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    if let Some(ref symbol) = args.candles {
        let registry = InstrumentRegistry::default_catalog()?;
        let builder = CandleHistoryBuilder::new(&registry, config.market_volatility, config.candle_epoch);
        match builder.chart_series(symbol, &args.timeframe, config.seed) {
            Ok(series) => {
                println!("{}", serde_json::to_string_pretty(&series)?);
                let stock = StockData::new(symbol, series);
                let (mean, std) = stock.stats();
                if let (Some(first), Some(last)) = (stock.history.first(), stock.history.last()) {
                    info!(
                        "{} {} from {:?}: {} bars, last close {:.2}, log-return mean {:.5} std {:.5}",
                        stock.symbol,
                        args.timeframe,
                        first.date(),
                        stock.history.len(),
                        last.close,
                        mean,
                        std
                    );
                }
            }
            Err(e) => error!("Candle generation failed: {}", e),
        }
        return Ok(());
    }

    if let Some(budget) = args.optimize {
        let warmup = args.ticks.unwrap_or(config.score_horizon as u64);
        let engine = run_headless(&config, warmup).await?;
        let snapshot = engine.snapshot();
        let scorer = MomentumScorer::new(config.score_horizon);
        let candidates = scoring::candidates_from_snapshot(&snapshot, &scorer, config.granularity);
        let service = AllocationService::from_config(&config);
        match service.optimize("cli", budget, candidates, args.unit_cap).await {
            Ok(result) => {
                if result.is_empty() {
                    warn!("Empty allocation: {:?}", result.note);
                }
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Err(e) => error!("Allocation failed: {}", e),
        }
        return Ok(());
    }

    if let Some(ticks) = args.ticks {
        let engine = run_headless(&config, ticks).await?;
        println!("{}", serde_json::to_string_pretty(engine.index())?);
        return Ok(());
    }

    if !args.serve {
        info!("No mode selected; serving on port {}", args.port);
    }
    serve(config, args.port, args.no_persist).await
}

/// Runs `ticks` cycles without the scheduler or persistence.
async fn run_headless(config: &SimConfig, ticks: u64) -> Result<MarketEngine> {
    let mut engine = MarketEngine::new(InstrumentRegistry::default_catalog()?, config.clone())?;
    let engine = tokio::task::spawn_blocking(move || {
        for _ in 0..ticks {
            engine.advance_cycle();
        }
        engine
    })
    .await
    .context("headless simulation task failed")?;
    info!("Ran {} cycles; index at {:.2}", ticks, engine.index().value);
    Ok(engine)
}

async fn serve(config: SimConfig, port: u16, no_persist: bool) -> Result<()> {
    let store: Arc<dyn SnapshotStore> = if no_persist {
        info!("Persistence disabled; snapshots stay in memory");
        Arc::new(MemoryStore::default())
    } else {
        let files = JsonFileStore::new(&config.data_dir)
            .with_context(|| format!("cannot open data directory {}", config.data_dir.display()))?;
        info!("Persisting snapshots under {}", files.dir().display());
        Arc::new(files)
    };

    let mut engine = MarketEngine::new(InstrumentRegistry::default_catalog()?, config.clone())?;
    match store.load_latest() {
        Ok(Some(saved)) => {
            engine.restore(&saved);
        }
        Ok(None) => info!("No persisted snapshot; starting from baseline"),
        Err(e) => warn!("Ignoring unreadable persisted snapshot: {}", e),
    }

    let registry = engine.registry();
    info!("Instruments: {}", registry.symbols().collect::<Vec<_>>().join(", "));
    let (market, market_task) = market::spawn_market(engine, Duration::from_millis(config.tick_interval_ms), store);
    let state = webui::WebState::new(
        market.clone(),
        registry,
        Arc::new(AllocationService::from_config(&config)),
        Arc::new(MomentumScorer::new(config.score_horizon)),
        config,
    );

    let served = webui::run_webui_server(port, state).await;
    if let Err(ref e) = served {
        error!("API server failed: {}", e);
    }

    if market.stop().await.is_ok() {
        match market_task.await {
            Ok(Ok(())) => info!("Market loop exited."),
            Ok(Err(e)) => error!("Market loop failed: {}", e),
            Err(e) => error!("Market loop panicked: {}", e),
        }
    }
    served
}
