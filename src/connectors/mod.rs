//! Exchange connector implementations

pub mod traits;
pub mod binance;
pub mod bybit;
pub mod guarded;
pub mod paper;
mod rest;

pub use traits::*;
pub use binance::BinanceConnector;
pub use bybit::BybitConnector;
pub use guarded::GuardedConnector;
pub use paper::PaperConnector;

use crate::{config::ExchangeConfig, market_data::MarketDataProvider, ArbitrageError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Supported exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    /// Bybit
    Bybit,
    /// BingX
    BingX,
    /// Gate.io
    GateIo,
    /// MEXC
    Mexc,
    /// Bitget
    Bitget,
    /// Binance
    Binance,
    /// OKX
    Okx,
}

impl Exchange {
    /// Every supported exchange
    pub const ALL: [Exchange; 7] = [
        Exchange::Bybit,
        Exchange::BingX,
        Exchange::GateIo,
        Exchange::Mexc,
        Exchange::Bitget,
        Exchange::Binance,
        Exchange::Okx,
    ];
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Bybit => write!(f, "bybit"),
            Exchange::BingX => write!(f, "bingx"),
            Exchange::GateIo => write!(f, "gateio"),
            Exchange::Mexc => write!(f, "mexc"),
            Exchange::Bitget => write!(f, "bitget"),
            Exchange::Binance => write!(f, "binance"),
            Exchange::Okx => write!(f, "okx"),
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = ArbitrageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bybit" => Ok(Exchange::Bybit),
            "bingx" => Ok(Exchange::BingX),
            "gateio" | "gate.io" | "gate" => Ok(Exchange::GateIo),
            "mexc" => Ok(Exchange::Mexc),
            "bitget" => Ok(Exchange::Bitget),
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            _ => Err(ArbitrageError::Config(format!("Unknown exchange: {}", s))),
        }
    }
}

/// Trading and market-data views of one exchange adapter
#[derive(Clone)]
pub struct ExchangeHandles {
    /// Order and position calls
    pub connector: Arc<dyn ExchangeConnector>,
    /// Price and funding-rate reads
    pub market_data: Arc<dyn MarketDataProvider>,
}

/// Connector factory for creating exchange connectors
pub struct ConnectorFactory;

impl ConnectorFactory {
    /// Create the adapter for the specified exchange
    pub fn create(exchange: Exchange, config: &ExchangeConfig) -> Result<ExchangeHandles> {
        match exchange {
            Exchange::Bybit => {
                let connector = Arc::new(BybitConnector::new(config)?);
                Ok(ExchangeHandles {
                    connector: connector.clone(),
                    market_data: connector,
                })
            }
            Exchange::Binance => {
                let connector = Arc::new(BinanceConnector::new(config)?);
                Ok(ExchangeHandles {
                    connector: connector.clone(),
                    market_data: connector,
                })
            }
            other => Err(ArbitrageError::NotImplemented(format!(
                "No REST adapter shipped for {}; register an ExchangeConnector implementation directly",
                other
            ))
            .into()),
        }
    }

    /// Create a simulated exchange for dry runs
    pub fn paper(exchange: Exchange, fee_rate: f64) -> Arc<PaperConnector> {
        Arc::new(PaperConnector::new(exchange).with_fee_rate(fee_rate))
    }
}
