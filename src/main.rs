use clap::{Parser, Subcommand};
use graduated_arbitrage::{
    config::{ArbitrageConfig, StoreBackend},
    connectors::{ConnectorFactory, Exchange, ExchangeConnector, ExchangeHandles, GuardedConnector, PaperConnector},
    market_data::MarketDataProvider,
    notify::{LogNotifier, Notifier},
    position::{InMemoryPositionStore, JsonFilePositionStore, PositionStore},
    strategy::{MonitoredExchange, PositionLauncher, SignalMonitor, TriangularDetector},
    trading::{spawn_pipeline, GraduatedEntryEngine, TriangularExecutor},
    utils::{logger::{self, LogFormat}, metrics},
    ArbitrageError, Result,
};
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "arbitrage")]
#[command(about = "Graduated-entry cross-exchange arbitrage engine")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/arbitrage.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log file path
    #[arg(long, default_value = "logs/arbitrage.log")]
    log_file: PathBuf,

    /// Log file format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run against live exchanges
    Run,
    /// Run the same pipeline against simulated exchanges
    DryRun {
        /// Starting price of the simulated feed when no live market data is configured
        #[arg(long, default_value_t = 100.0)]
        seed_price: f64,
    },
    /// Validate configuration
    Validate,
    /// List persisted positions
    Status,
    /// Run one triangular detection pass and print the opportunities found
    ScanTriangular,
    /// Delete a never-executed ERROR position
    Delete {
        /// Position id
        position_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = logger::init(&cli.log_level, &cli.log_file, cli.log_format)?;
    info!("Starting graduated-entry arbitrage v{}", graduated_arbitrage::VERSION);

    let config = ArbitrageConfig::from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config.display());

    match cli.command {
        Commands::Run => run_live(config).await,
        Commands::DryRun { seed_price } => run_dry(config, seed_price).await,
        Commands::Validate => validate_config(config),
        Commands::Status => show_status(config).await,
        Commands::ScanTriangular => scan_triangular(config).await,
        Commands::Delete { position_id } => delete_position(config, &position_id).await,
    }
}

fn open_store(config: &ArbitrageConfig) -> Arc<dyn PositionStore> {
    match config.persistence.backend {
        StoreBackend::Memory => Arc::new(InMemoryPositionStore::new()),
        StoreBackend::Json => Arc::new(JsonFilePositionStore::new(&config.persistence.directory)),
    }
}

fn live_handles(config: &ArbitrageConfig) -> HashMap<Exchange, ExchangeHandles> {
    let mut handles = HashMap::new();
    for (name, exchange_config) in &config.exchanges {
        let exchange = match name.parse::<Exchange>() {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(exchange = %name, error = %e, "Skipping unknown exchange");
                continue;
            }
        };
        match ConnectorFactory::create(exchange, exchange_config) {
            Ok(h) => {
                handles.insert(exchange, h);
            }
            Err(e) => warn!(exchange = %exchange, error = %e, "Exchange adapter unavailable"),
        }
    }
    handles
}

fn signal_exchanges(config: &ArbitrageConfig) -> Result<(Exchange, Exchange)> {
    Ok((config.signal.primary_exchange.parse()?, config.signal.hedge_exchange.parse()?))
}

/// Engine plus background tasks shared by `run` and `dry-run`
async fn run_pipeline(
    config: ArbitrageConfig,
    connectors: Vec<Arc<dyn ExchangeConnector>>,
    market_data: HashMap<Exchange, Arc<dyn MarketDataProvider>>,
    store: Arc<dyn PositionStore>,
    mut background: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    if config.monitoring.enable_metrics {
        metrics::install_exporter(&config.monitoring.metrics_listen_addr)?;
    }

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let triangular = if config.triangular.enabled {
        Some(triangular_executor(&config, &connectors, &market_data, Arc::clone(&notifier))?)
    } else {
        None
    };
    let engine = Arc::new(GraduatedEntryEngine::new(&config, connectors, store, notifier)?);

    let report = engine.recover().await?;
    info!(
        resumed = report.resumed,
        unwound = report.unwound,
        failed = report.failed,
        "Persisted positions recovered"
    );

    if config.signal.enabled {
        let (primary, hedge) = signal_exchanges(&config)?;
        let source = |exchange: Exchange| {
            market_data
                .get(&exchange)
                .cloned()
                .ok_or_else(|| ArbitrageError::Config(format!("no market data for signal exchange {}", exchange)))
        };
        let launcher: Arc<dyn PositionLauncher> = Arc::new(Arc::clone(&engine));
        let monitor = SignalMonitor::new(
            config.signal.clone(),
            MonitoredExchange {
                exchange: primary,
                market_data: source(primary)?,
            },
            MonitoredExchange {
                exchange: hedge,
                market_data: source(hedge)?,
            },
            launcher,
        );
        let shutdown = shutdown_tx.subscribe();
        background.push(tokio::spawn(async move { monitor.run(shutdown).await }));
    } else {
        info!("Signal monitor disabled");
    }

    match triangular {
        Some((detector, executor)) => {
            let (detector_task, executor_task) =
                spawn_pipeline(detector, executor, config.triangular.start_amount, shutdown_tx.subscribe());
            background.push(detector_task);
            background.push(tokio::spawn(async move {
                match executor_task.await {
                    Ok(stats) if stats.halted => error!(?stats, "Triangular trading halted with an asset held"),
                    Ok(stats) => info!(?stats, "Triangular trading finished"),
                    Err(e) => error!(error = %e, "Triangular executor task failed"),
                }
            }));
        }
        None => info!("Triangular trading disabled"),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send_replace(true);
    for task in background {
        if let Err(e) = task.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }
    engine.shutdown().await;
    Ok(())
}

/// Detector and executor for the configured triangular exchange
fn triangular_executor(
    config: &ArbitrageConfig,
    connectors: &[Arc<dyn ExchangeConnector>],
    market_data: &HashMap<Exchange, Arc<dyn MarketDataProvider>>,
    notifier: Arc<dyn Notifier>,
) -> Result<(TriangularDetector, TriangularExecutor)> {
    let exchange: Exchange = config.triangular.exchange.parse()?;
    let connector = connectors
        .iter()
        .find(|c| c.exchange() == exchange)
        .cloned()
        .ok_or_else(|| ArbitrageError::Config(format!("no connector for triangular exchange {}", exchange)))?;
    let prices = market_data
        .get(&exchange)
        .cloned()
        .ok_or_else(|| ArbitrageError::Config(format!("no market data for triangular exchange {}", exchange)))?;

    let detector = TriangularDetector::from_config(&config.triangular, Arc::clone(&prices))?;
    let guarded: Arc<dyn ExchangeConnector> = Arc::new(GuardedConnector::new(
        connector,
        Duration::from_millis(config.engine.call_timeout_ms),
        config.engine.max_in_flight_requests,
    ));
    let executor = TriangularExecutor::new(guarded, prices, detector.fees(), notifier, config.signal.user_id.clone());
    Ok((detector, executor))
}

async fn run_live(config: ArbitrageConfig) -> Result<()> {
    if cfg!(feature = "dry-run-only") {
        return Err(ArbitrageError::Config("live trading is disabled in this build; use dry-run".to_string()).into());
    }
    config.validate()?;
    info!("Starting live trading");

    let handles = live_handles(&config);
    if handles.len() < 2 {
        return Err(ArbitrageError::Config("at least two exchanges must be configured".to_string()).into());
    }
    let connectors = handles.values().map(|h| Arc::clone(&h.connector)).collect();
    let market_data = handles
        .iter()
        .map(|(exchange, h)| (*exchange, Arc::clone(&h.market_data)))
        .collect();

    let (shutdown_tx, _) = watch::channel(false);
    run_pipeline(config.clone(), connectors, market_data, open_store(&config), Vec::new(), shutdown_tx).await
}

/// Copy live prices into a paper exchange, or random-walk from `seed_price` without a source
async fn feed_paper_prices(
    paper: Arc<PaperConnector>,
    source: Option<Arc<dyn MarketDataProvider>>,
    symbols: Vec<String>,
    seed_price: f64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut walk: HashMap<String, f64> = symbols.iter().map(|s| (s.clone(), seed_price)).collect();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        for symbol in &symbols {
            match &source {
                Some(source) => {
                    if let Some(price) = source.get_price(symbol).await {
                        paper.set_price(symbol, price).await;
                    }
                    if let Some(funding) = source.get_funding_rate(symbol).await {
                        paper.set_funding_rate(symbol, funding.rate, funding.interval_hours).await;
                    }
                }
                None => {
                    let step = rand::thread_rng().gen_range(-0.001..=0.001);
                    let price = walk.entry(symbol.clone()).or_insert(seed_price);
                    *price *= 1.0 + step;
                    paper.set_price(symbol, *price).await;
                }
            }
        }
    }
}

async fn run_dry(config: ArbitrageConfig, seed_price: f64) -> Result<()> {
    config.validate()?;
    info!("Starting dry-run against simulated exchanges");

    let (primary, hedge) = signal_exchanges(&config)?;
    let live = live_handles(&config);
    let (shutdown_tx, _) = watch::channel(false);

    let mut simulated: Vec<(Exchange, Vec<String>)> = vec![
        (primary, config.signal.symbols.clone()),
        (hedge, config.signal.symbols.clone()),
    ];
    if config.triangular.enabled {
        let exchange: Exchange = config.triangular.exchange.parse()?;
        // a random walk per symbol has no cross-rate consistency
        if !live.contains_key(&exchange) {
            return Err(ArbitrageError::Config(format!(
                "dry-run triangular trading needs live market data for {}",
                exchange
            ))
            .into());
        }
        let cycle_symbols = config.triangular.cycles.iter().flat_map(|c| c.pairs.iter().map(|p| p.symbol.clone()));
        match simulated.iter_mut().find(|(e, _)| *e == exchange) {
            Some((_, symbols)) => symbols.extend(cycle_symbols),
            None => simulated.push((exchange, cycle_symbols.collect())),
        }
    }

    let mut connectors: Vec<Arc<dyn ExchangeConnector>> = Vec::new();
    let mut market_data: HashMap<Exchange, Arc<dyn MarketDataProvider>> = HashMap::new();
    let mut background = Vec::new();
    for (exchange, mut symbols) in simulated {
        symbols.sort();
        symbols.dedup();
        let fee = config.exchange(exchange).map_or(0.0005, |c| c.taker_fee);
        let paper = ConnectorFactory::paper(exchange, fee);
        let source = live.get(&exchange).map(|h| Arc::clone(&h.market_data));
        if source.is_none() {
            info!(exchange = %exchange, seed_price, "No live market data, simulating prices");
        }
        background.push(tokio::spawn(feed_paper_prices(
            Arc::clone(&paper),
            source,
            symbols,
            seed_price,
            Duration::from_millis(config.signal.poll_interval_ms.max(100)),
            shutdown_tx.subscribe(),
        )));
        connectors.push(paper.clone());
        market_data.insert(exchange, paper);
    }

    let store: Arc<dyn PositionStore> = Arc::new(InMemoryPositionStore::new());
    run_pipeline(config, connectors, market_data, store, background, shutdown_tx).await
}

fn validate_config(config: ArbitrageConfig) -> Result<()> {
    info!("Validating configuration...");

    match config.validate() {
        Ok(_) => {
            info!("Configuration is valid");
            println!("Configuration validation passed!");
            Ok(())
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            Err(e)
        }
    }
}

async fn show_status(config: ArbitrageConfig) -> Result<()> {
    let store = open_store(&config);
    let positions = store.load_all_positions().await?;

    println!("Positions: {}", positions.len());
    for p in positions {
        println!(
            "  {} {} {}/{} {} part {}/{} net {:.4}{}",
            p.position_id,
            p.symbol,
            p.primary.exchange,
            p.hedge.exchange,
            p.status,
            p.current_part,
            p.total_parts,
            p.net_profit,
            p.error_message.map(|m| format!(" ({})", m)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn scan_triangular(config: ArbitrageConfig) -> Result<()> {
    let exchange: Exchange = config.triangular.exchange.parse()?;
    let exchange_config = config
        .exchange(exchange)
        .ok_or_else(|| ArbitrageError::Config(format!("exchange {} is not configured", exchange)))?;
    let handles = ConnectorFactory::create(exchange, exchange_config)?;

    let detector = TriangularDetector::from_config(&config.triangular, handles.market_data)?;
    let opportunities = detector.scan().await;
    info!(count = opportunities.len(), "Triangular scan finished");
    println!("{}", serde_json::to_string_pretty(&opportunities)?);
    Ok(())
}

async fn delete_position(config: ArbitrageConfig, position_id: &str) -> Result<()> {
    open_store(&config).delete_position(position_id).await?;
    println!("Deleted {}", position_id);
    Ok(())
}
