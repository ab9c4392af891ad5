//! Exchange connector traits and common types

use super::Exchange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl OrderSide {
    /// The other side
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Market order (taker)
    #[default]
    Market,
    /// Limit order (maker)
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Position side of a perpetual leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    /// Long position
    Long,
    /// Short position
    Short,
}

impl PositionSide {
    /// Order side that grows this position
    pub fn opening_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position
    pub fn closing_side(self) -> OrderSide {
        self.opening_side().opposite()
    }

    /// The other side
    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// +1 for long, -1 for short
    pub fn direction(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Order request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Trading symbol
    pub symbol: String,
    /// Order side
    pub side: OrderSide,
    /// Quantity in base units
    pub quantity: f64,
    /// Order type
    pub order_type: OrderType,
    /// Limit price
    pub price: Option<f64>,
    /// Only reduce an existing position
    pub reduce_only: bool,
    /// Client order ID (optional)
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
            client_order_id: None,
        }
    }

    /// Mark the order reduce-only
    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Attach a client order id
    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Result of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    /// Exchange order ID
    pub order_id: String,
    /// Filled quantity
    pub filled_quantity: f64,
    /// Average fill price
    pub average_price: f64,
    /// Fee paid, in quote currency
    pub fee: f64,
}

/// Exchange-side view of an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Symbol
    pub symbol: String,
    /// Position side
    pub side: PositionSide,
    /// Absolute position size
    pub size: f64,
    /// Exchange-reported average entry price
    pub entry_price: f64,
    /// Mark price
    pub mark_price: f64,
}

/// Outcome of `close_position`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CloseOutcome {
    /// A closing order was executed
    Closed(OrderFill),
    /// Nothing was open
    NoPosition,
}

/// Funding rate information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRateInfo {
    /// Current funding rate
    pub rate: f64,
    /// Next funding payment time
    pub next_payment_time: DateTime<Utc>,
    /// Funding interval in hours
    pub interval_hours: u32,
}

/// A settled funding payment on one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    /// Exchange transaction id (may be empty)
    pub id: String,
    /// Symbol
    pub symbol: String,
    /// Amount received (negative when paid)
    pub amount: f64,
    /// Rate applied, when reported
    pub rate: Option<f64>,
    /// Settlement time
    pub timestamp: DateTime<Utc>,
}

impl FundingPayment {
    /// Identity used for at-most-once application
    pub fn dedup_key(&self) -> String {
        if self.id.is_empty() {
            format!("{}:{}", self.symbol, self.timestamp.timestamp_millis())
        } else {
            self.id.clone()
        }
    }
}

/// Connector error taxonomy
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    /// Not enough depth to fill
    #[error("Insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    /// Quantity below the exchange minimum
    #[error("Quantity {quantity} for {symbol} below exchange minimum: {detail}")]
    MinimumQuantityViolation {
        /// Symbol
        symbol: String,
        /// Requested quantity
        quantity: f64,
        /// Exchange-provided detail
        detail: String,
    },

    /// Rate limit hit
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Exchange refused the request
    #[error("Exchange rejected request: {0}")]
    ExchangeRejected(String),

    /// No response in time; the outcome is unknown
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation name
        operation: String,
        /// Elapsed budget
        after_ms: u64,
    },

    /// Transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Response could not be understood or data is missing
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
}

impl ConnectorError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::RateLimited(_) | ConnectorError::Timeout { .. } | ConnectorError::Connection(_)
        )
    }

    /// The request may or may not have been executed
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, ConnectorError::Timeout { .. })
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::InsufficientLiquidity(_) => "insufficient_liquidity",
            ConnectorError::MinimumQuantityViolation { .. } => "minimum_quantity",
            ConnectorError::RateLimited(_) => "rate_limited",
            ConnectorError::ExchangeRejected(_) => "exchange_rejected",
            ConnectorError::Timeout { .. } => "timeout",
            ConnectorError::Connection(_) => "connection",
            ConnectorError::DataUnavailable(_) => "data_unavailable",
        }
    }
}

/// Result returned by connector calls
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Exchange connector trait
///
/// Every call except `get_position` and `close_position` may mutate a live
/// position and must be treated as non-idempotent.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Exchange this connector trades on
    fn exchange(&self) -> Exchange;

    /// Place an order
    async fn place_order(&self, order: &OrderRequest) -> ConnectorResult<OrderFill>;

    /// Current position for a symbol, `None` when flat
    async fn get_position(&self, symbol: &str) -> ConnectorResult<Option<PositionSnapshot>>;

    /// Set leverage
    async fn set_leverage(&self, symbol: &str, leverage: u32, side: Option<PositionSide>) -> ConnectorResult<()>;

    /// Attach take-profit / stop-loss to an open position
    async fn set_trading_stop(
        &self,
        symbol: &str,
        side: PositionSide,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> ConnectorResult<()>;

    /// Close whatever is open on a symbol
    async fn close_position(&self, symbol: &str) -> ConnectorResult<CloseOutcome>;

    /// Current funding rate
    async fn get_funding_rate(&self, symbol: &str) -> ConnectorResult<FundingRateInfo>;

    /// Funding payments settled since `since`
    async fn get_funding_history(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<FundingPayment>>;
}
