//! Configuration management module

pub mod settings;

pub use settings::*;

use crate::{connectors::OrderType, ArbitrageError, Exchange, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `ARB__ENGINE__CALL_TIMEOUT_MS=5000`
pub const ENV_PREFIX: &str = "ARB";

/// Main configuration structure for the arbitrage system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// Graduated-entry engine configuration
    pub engine: EngineConfig,
    /// Liquidation monitoring configuration
    pub liquidation: LiquidationConfig,
    /// Funding tracker configuration
    pub funding: FundingConfig,
    /// Triangular arbitrage configuration
    pub triangular: TriangularConfig,
    /// Cross-exchange signal monitor configuration
    pub signal: SignalConfig,
    /// Position persistence configuration
    pub persistence: PersistenceConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Exchange configuration keyed by exchange name
    pub exchanges: HashMap<String, ExchangeConfig>,
}

/// Graduated-entry engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tranches used when a request does not specify one
    pub default_total_parts: u32,
    /// Delay between tranches in milliseconds
    pub inter_part_delay_ms: u64,
    /// Hedge order retries before an imbalance is corrected
    pub max_hedge_retries: u32,
    /// Close retries per leg before manual intervention is flagged
    pub max_close_retries: u32,
    /// Base backoff between retries in milliseconds
    pub retry_backoff_ms: u64,
    /// Timeout applied to every connector call in milliseconds
    pub call_timeout_ms: u64,
    /// Liquidation/price monitoring interval in milliseconds
    pub monitor_interval_ms: u64,
    /// Smallest tranche quantity accepted
    pub min_order_quantity: f64,
    /// Lot step tranche quantities are rounded down to (0 disables rounding)
    pub quantity_step: f64,
    /// Largest leverage accepted
    pub max_leverage: u32,
    /// TP/SL distance from entry as a fraction of price
    pub stop_distance_pct: f64,
    /// Fraction of the liquidation distance a stop may use at most
    pub stop_liquidation_buffer: f64,
    /// Concurrent in-flight requests per exchange
    pub max_in_flight_requests: usize,
    /// Per-subscriber event buffer
    pub event_buffer: usize,
}

/// Liquidation monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidationConfig {
    /// Proximity ratio at which a leg is considered in danger
    pub danger_threshold: f64,
    /// Maintenance margin rate overrides keyed by exchange name
    pub maintenance_margin_overrides: HashMap<String, f64>,
}

/// Funding tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    /// Funding history poll interval in seconds
    pub poll_interval_secs: u64,
    /// Window re-queried before the last funding update, in hours
    pub history_overlap_hours: i64,
}

/// Trading pair of a triangular cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    /// Exchange symbol, e.g. "ETHBTC"
    pub symbol: String,
    /// Base asset
    pub base: String,
    /// Quote asset
    pub quote: String,
    /// Order type used on this leg (decides maker or taker fee)
    #[serde(default)]
    pub order_type: OrderType,
}

/// One three-pair cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Asset the cycle starts and ends in
    pub start_asset: String,
    /// The three pairs connecting the cycle's assets
    pub pairs: Vec<PairConfig>,
}

/// Triangular arbitrage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangularConfig {
    /// Run the detector and execute what it finds
    pub enabled: bool,
    /// Exchange the cycles are scanned on
    pub exchange: String,
    /// Rescan interval in milliseconds
    pub scan_interval_ms: u64,
    /// Opportunity time to live in milliseconds
    pub opportunity_ttl_ms: u64,
    /// Maker fee rate
    pub maker_fee: f64,
    /// Taker fee rate
    pub taker_fee: f64,
    /// Minimum fee-adjusted profit in percent (strictly exceeded)
    pub min_profit_percent: f64,
    /// Amount of the start asset committed per execution
    pub start_amount: f64,
    /// Cycle universe
    pub cycles: Vec<CycleConfig>,
}

/// Cross-exchange signal monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Run the signal monitor
    pub enabled: bool,
    /// Owner of positions opened by the monitor
    pub user_id: String,
    /// Symbols to watch
    pub symbols: Vec<String>,
    /// Primary leg exchange
    pub primary_exchange: String,
    /// Hedge leg exchange
    pub hedge_exchange: String,
    /// Price spread trigger in basis points
    pub min_price_spread_bps: f64,
    /// Funding-rate spread trigger (absolute rate difference)
    pub min_funding_spread: f64,
    /// Planned quantity per leg
    pub quantity: f64,
    /// Leverage applied on both legs
    pub leverage: u32,
    /// Tranches (falls back to the engine default)
    pub total_parts: Option<u32>,
    /// Evaluation interval in milliseconds
    pub poll_interval_ms: u64,
    /// Minimum time between two launches for one symbol, in seconds
    pub cooldown_secs: u64,
}

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory only
    Memory,
    /// One JSON document per position on disk
    Json,
}

/// Position persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store backend
    pub backend: StoreBackend,
    /// Directory for the JSON backend
    pub directory: PathBuf,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Enable metrics collection
    pub enable_metrics: bool,
    /// Prometheus listener address
    pub metrics_listen_addr: String,
    /// Enable trade logging
    pub enable_trade_logging: bool,
}

/// Individual exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// REST API URL
    pub rest_api_url: String,
    /// API key
    pub api_key: String,
    /// Secret key
    pub secret_key: String,
    /// Enable testnet
    pub testnet: bool,
    /// Testnet REST API URL
    pub testnet_rest_api_url: Option<String>,
    /// HTTP connection timeout in seconds
    pub connection_timeout_secs: u64,
    /// Signed request receive window in milliseconds
    pub recv_window_ms: u64,
    /// Maker fee
    pub maker_fee: f64,
    /// Taker fee
    pub taker_fee: f64,
}

impl ArbitrageConfig {
    /// Load configuration from a TOML file, expanding `${VAR}` references and
    /// applying `ARB__SECTION__KEY` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ArbitrageError::Config(format!("Failed to read config file: {}", e)))?;

        let expanded = EnvExpander::expand(&content)?;

        let config: ArbitrageConfig = config::Config::builder()
            .add_source(config::File::from_str(&expanded, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ArbitrageError::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        ConfigValidator::validate_at_least_one(engine.default_total_parts as u64, "default_total_parts")?;
        ConfigValidator::validate_at_least_one(engine.call_timeout_ms, "call_timeout_ms")?;
        ConfigValidator::validate_at_least_one(engine.monitor_interval_ms, "monitor_interval_ms")?;
        ConfigValidator::validate_at_least_one(engine.max_leverage as u64, "max_leverage")?;
        ConfigValidator::validate_at_least_one(engine.max_in_flight_requests as u64, "max_in_flight_requests")?;
        ConfigValidator::validate_positive(engine.min_order_quantity, "min_order_quantity")?;
        ConfigValidator::validate_non_negative(engine.quantity_step, "quantity_step")?;
        ConfigValidator::validate_positive(engine.stop_distance_pct, "stop_distance_pct")?;
        ConfigValidator::validate_unit_interval(engine.stop_liquidation_buffer, "stop_liquidation_buffer")?;

        ConfigValidator::validate_unit_interval(self.liquidation.danger_threshold, "danger_threshold")?;
        for (name, mmr) in &self.liquidation.maintenance_margin_overrides {
            name.parse::<Exchange>()?;
            ConfigValidator::validate_percentage(*mmr, "maintenance margin rate")?;
        }

        ConfigValidator::validate_at_least_one(self.funding.poll_interval_secs, "funding poll_interval_secs")?;

        let tri = &self.triangular;
        ConfigValidator::validate_non_negative(tri.maker_fee, "triangular maker_fee")?;
        ConfigValidator::validate_non_negative(tri.taker_fee, "triangular taker_fee")?;
        ConfigValidator::validate_non_negative(tri.min_profit_percent, "min_profit_percent")?;
        if tri.enabled {
            tri.exchange.parse::<Exchange>()?;
            ConfigValidator::validate_positive(tri.start_amount, "triangular start_amount")?;
            if tri.cycles.is_empty() {
                return Err(ArbitrageError::Config("Triangular trading needs at least one cycle".to_string()).into());
            }
        }
        for cycle in &tri.cycles {
            if cycle.pairs.len() != 3 {
                return Err(ArbitrageError::Config(format!(
                    "Cycle starting at {} must have exactly three pairs",
                    cycle.start_asset
                ))
                .into());
            }
            for pair in &cycle.pairs {
                ConfigValidator::validate_symbol(&pair.symbol)?;
            }
        }

        if self.signal.enabled {
            let primary: Exchange = self.signal.primary_exchange.parse()?;
            let hedge: Exchange = self.signal.hedge_exchange.parse()?;
            if primary == hedge {
                return Err(ArbitrageError::Config("Signal monitor needs two different exchanges".to_string()).into());
            }
            if self.signal.symbols.is_empty() {
                return Err(ArbitrageError::Config("Signal monitor needs at least one symbol".to_string()).into());
            }
            for symbol in &self.signal.symbols {
                ConfigValidator::validate_symbol(symbol)?;
            }
            ConfigValidator::validate_positive(self.signal.quantity, "signal quantity")?;
            if self.signal.leverage == 0 || self.signal.leverage > engine.max_leverage {
                return Err(ArbitrageError::Config("Signal leverage outside allowed range".to_string()).into());
            }
        }

        for (name, exchange) in &self.exchanges {
            name.parse::<Exchange>()?;
            ConfigValidator::validate_url(&exchange.rest_api_url, "rest_api_url")?;
        }

        Ok(())
    }

    /// Exchange configuration by exchange
    pub fn exchange(&self, exchange: Exchange) -> Option<&ExchangeConfig> {
        self.exchanges.get(&exchange.to_string())
    }

    /// Maintenance margin overrides keyed by exchange
    pub fn mmr_overrides(&self) -> Result<HashMap<Exchange, f64>> {
        self.liquidation
            .maintenance_margin_overrides
            .iter()
            .map(|(name, mmr)| Ok((name.parse::<Exchange>()?, *mmr)))
            .collect()
    }
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            liquidation: LiquidationConfig::default(),
            funding: FundingConfig::default(),
            triangular: TriangularConfig::default(),
            signal: SignalConfig::default(),
            persistence: PersistenceConfig::default(),
            monitoring: MonitoringConfig::default(),
            exchanges: HashMap::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_total_parts: ConfigDefaults::TOTAL_PARTS,
            inter_part_delay_ms: ConfigDefaults::INTER_PART_DELAY_MS,
            max_hedge_retries: ConfigDefaults::MAX_HEDGE_RETRIES,
            max_close_retries: ConfigDefaults::MAX_CLOSE_RETRIES,
            retry_backoff_ms: ConfigDefaults::RETRY_BACKOFF_MS,
            call_timeout_ms: ConfigDefaults::CALL_TIMEOUT_MS,
            monitor_interval_ms: ConfigDefaults::MONITOR_INTERVAL_MS,
            min_order_quantity: 0.001,
            quantity_step: 0.001,
            max_leverage: 50,
            stop_distance_pct: 0.05,
            stop_liquidation_buffer: 0.8,
            max_in_flight_requests: 8,
            event_buffer: 64,
        }
    }
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            danger_threshold: ConfigDefaults::DANGER_THRESHOLD,
            maintenance_margin_overrides: HashMap::new(),
        }
    }
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: ConfigDefaults::FUNDING_POLL_INTERVAL_SECS,
            history_overlap_hours: 8,
        }
    }
}

impl Default for TriangularConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exchange: "binance".to_string(),
            scan_interval_ms: 1000,
            opportunity_ttl_ms: 3000,
            maker_fee: ConfigDefaults::MAKER_FEE,
            taker_fee: ConfigDefaults::TAKER_FEE,
            min_profit_percent: 0.0,
            start_amount: 100.0,
            cycles: Vec::new(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: "default".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            primary_exchange: "bybit".to_string(),
            hedge_exchange: "binance".to_string(),
            min_price_spread_bps: ConfigDefaults::MIN_SPREAD_BPS,
            min_funding_spread: 0.0005,
            quantity: 0.01,
            leverage: 3,
            total_parts: None,
            poll_interval_ms: 5000,
            cooldown_secs: 300,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            directory: PathBuf::from("data/positions"),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_listen_addr: "0.0.0.0:9000".to_string(),
            enable_trade_logging: true,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_api_url: String::new(),
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            testnet_rest_api_url: None,
            connection_timeout_secs: ConfigDefaults::CONNECTION_TIMEOUT_SECS,
            recv_window_ms: 5000,
            maker_fee: ConfigDefaults::MAKER_FEE,
            taker_fee: ConfigDefaults::TAKER_FEE,
        }
    }
}

impl ExchangeConfig {
    /// REST base URL honouring the testnet switch
    pub fn base_url(&self) -> &str {
        if self.testnet {
            self.testnet_rest_api_url.as_deref().unwrap_or(&self.rest_api_url)
        } else {
            &self.rest_api_url
        }
    }
}
