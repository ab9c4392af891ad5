//! Helpers shared by the REST adapters

use super::{ConnectorError, ConnectorResult};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sha2::Sha256;

/// Hex-encoded HMAC-SHA256 of `message`
pub(crate) fn hmac_sha256(secret: &str, message: &str) -> ConnectorResult<String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| ConnectorError::ExchangeRejected(format!("invalid API secret: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Render a quantity or price without float noise, e.g. 0.1 + 0.2 -> "0.3"
pub(crate) fn format_decimal(value: f64) -> String {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(8).normalize().to_string())
        .unwrap_or_else(|| value.to_string())
}

/// Parse an exchange number string; empty means zero
pub(crate) fn parse_number(field: &str, value: &str) -> ConnectorResult<f64> {
    if value.is_empty() {
        return Ok(0.0);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConnectorError::DataUnavailable(format!("invalid {} '{}'", field, value)))
}

/// Classify a transport failure
pub(crate) fn map_transport_error(error: reqwest::Error, operation: &str, timeout_ms: u64) -> ConnectorError {
    if error.is_timeout() {
        ConnectorError::Timeout {
            operation: operation.to_string(),
            after_ms: timeout_ms,
        }
    } else if error.is_decode() {
        ConnectorError::DataUnavailable(format!("Failed to parse {} response: {}", operation, error))
    } else {
        ConnectorError::Connection(format!("HTTP request failed: {}", error))
    }
}

/// URL-encoded query string in the given parameter order
pub(crate) fn query_string(params: &[(&str, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
        .finish()
}
