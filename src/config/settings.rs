//! Helpers behind config loading: `${VAR}` expansion, field checks and defaults

use crate::{ArbitrageError, Result};
use std::env;

/// Expands `${VAR}` and `${VAR:-fallback}` references in raw config text.
/// API keys are usually injected this way.
pub struct EnvExpander;

impl EnvExpander {
    /// Substitute every reference; a missing variable without fallback is an error
    pub fn expand(input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find("${") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after.find('}').ok_or_else(|| {
                ArbitrageError::Config(format!("Unterminated ${{...}} reference near '{}'", &rest[open..]))
            })?;

            let reference = &after[..close];
            let (name, fallback) = match reference.split_once(":-") {
                Some((name, fallback)) => (name, Some(fallback)),
                None => (reference, None),
            };
            let value = match (env::var(name), fallback) {
                (Ok(value), _) => value,
                (Err(_), Some(fallback)) => fallback.to_string(),
                (Err(_), None) => {
                    return Err(ArbitrageError::Config(format!("Environment variable '{}' is not set", name)).into())
                }
            };
            // substituted text is never rescanned
            out.push_str(&value);
            rest = &after[close + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

/// Field checks shared by `ArbitrageConfig::validate`
pub struct ConfigValidator;

impl ConfigValidator {
    /// Exchange symbols are upper-case alphanumerics such as `BTCUSDT`
    pub fn validate_symbol(symbol: &str) -> Result<()> {
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(ArbitrageError::Config(format!("Invalid symbol '{}'", symbol)).into());
        }
        Ok(())
    }

    /// `value` within `[0, 1]`
    pub fn validate_percentage(value: f64, name: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ArbitrageError::Config(format!("{} must be within [0, 1], got {}", name, value)).into());
        }
        Ok(())
    }

    /// `value` within `(0, 1]`, e.g. a danger threshold
    pub fn validate_unit_interval(value: f64, name: &str) -> Result<()> {
        if !(value > 0.0 && value <= 1.0) {
            return Err(ArbitrageError::Config(format!("{} must be within (0, 1], got {}", name, value)).into());
        }
        Ok(())
    }

    /// Strictly positive and finite
    pub fn validate_positive(value: f64, name: &str) -> Result<()> {
        if value <= 0.0 || !value.is_finite() {
            return Err(ArbitrageError::Config(format!("{} must be positive, got {}", name, value)).into());
        }
        Ok(())
    }

    /// Zero or positive, finite
    pub fn validate_non_negative(value: f64, name: &str) -> Result<()> {
        if value < 0.0 || !value.is_finite() {
            return Err(ArbitrageError::Config(format!("{} cannot be negative, got {}", name, value)).into());
        }
        Ok(())
    }

    /// Counts, timeouts and intervals where zero would stall the engine
    pub fn validate_at_least_one(value: u64, name: &str) -> Result<()> {
        if value == 0 {
            return Err(ArbitrageError::Config(format!("{} must be at least 1", name)).into());
        }
        Ok(())
    }

    /// REST base URLs; only http(s) is spoken to exchanges
    pub fn validate_url(url: &str, name: &str) -> Result<()> {
        let parsed = url::Url::parse(url)
            .map_err(|e| ArbitrageError::Config(format!("{} is not a valid URL ({}): {}", name, url, e)))?;

        match parsed.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(ArbitrageError::Config(format!("{} uses unsupported scheme '{}'", name, scheme)).into()),
        }
    }
}

/// Defaults for every tunable the engine exposes
pub struct ConfigDefaults;

impl ConfigDefaults {
    /// HTTP connect timeout
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;
    /// Bound on a single connector call
    pub const CALL_TIMEOUT_MS: u64 = 8000;
    /// Tranches per position
    pub const TOTAL_PARTS: u32 = 3;
    /// Pause between tranches
    pub const INTER_PART_DELAY_MS: u64 = 2000;
    /// Hedge attempts after the first
    pub const MAX_HEDGE_RETRIES: u32 = 3;
    /// Close attempts after the first, per leg
    pub const MAX_CLOSE_RETRIES: u32 = 3;
    /// Base of the linear retry backoff
    pub const RETRY_BACKOFF_MS: u64 = 500;
    /// Active position monitoring tick
    pub const MONITOR_INTERVAL_MS: u64 = 5000;
    /// Funding history poll period
    pub const FUNDING_POLL_INTERVAL_SECS: u64 = 300;
    /// Liquidation proximity at which both legs are closed
    pub const DANGER_THRESHOLD: f64 = 0.9;
    /// Signal monitor spread trigger
    pub const MIN_SPREAD_BPS: f64 = 10.0;
    /// Default maker fee rate
    pub const MAKER_FEE: f64 = 0.001;
    /// Default taker fee rate
    pub const TAKER_FEE: f64 = 0.001;
}
