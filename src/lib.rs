//! Graduated-Entry Cross-Exchange Arbitrage
//!
//! Opens correlated LONG/SHORT perpetual positions across two exchanges in
//! incremental tranches, tracks fills, funding payments and liquidation
//! proximity while the hedge is active, and unwinds both legs safely on
//! take-profit, stop-loss, liquidation danger, manual close or fatal error.
//! A single-exchange triangular arbitrage detector and executor live alongside.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectors;
pub mod funding;
pub mod market_data;
pub mod notify;
pub mod position;
pub mod risk;
pub mod strategy;
pub mod trading;
pub mod utils;

// Re-export commonly used types
pub use config::ArbitrageConfig;
pub use connectors::{ConnectorError, Exchange, ExchangeConnector};
pub use position::{ArbitragePosition, PositionStatus};
pub use trading::{GraduatedEntryEngine, TriangularExecutor};

/// Result type used throughout the application
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the arbitrage system
#[derive(thiserror::Error, Debug)]
pub enum ArbitrageError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Data parsing error
    #[error("Data parsing error: {0}")]
    DataParsing(String),

    /// Not implemented error
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Request rejected before any order was placed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Trading error
    #[error("Trading error: {0}")]
    Trading(String),

    /// One leg of a hedge filled more than the other
    #[error("Leg imbalance: {0}")]
    LegImbalance(String),

    /// Persistence store error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Unknown position id
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// Illegal lifecycle transition
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
        assert!(!APP_NAME.is_empty());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ArbitrageError::InvalidTransition {
            from: "COMPLETED".to_string(),
            to: "ACTIVE".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid status transition from COMPLETED to ACTIVE");
    }
}
