//! Metrics recording helpers
//!
//! Every helper is a no-op until a recorder is installed, so library code can
//! record unconditionally.

use crate::{connectors::Exchange, position::LegRole, ArbitrageError, Result};
use metrics::{gauge, histogram, increment_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Install the Prometheus exporter with an HTTP listener on `listen_addr`
pub fn install_exporter(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| ArbitrageError::Config(format!("Invalid metrics listen address '{}': {}", listen_addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ArbitrageError::Config(format!("Failed to install metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Latency and outcome of one connector call
pub fn record_connector_call(exchange: Exchange, operation: &'static str, elapsed: Duration, ok: bool) {
    histogram!(
        "connector_call_duration_seconds",
        elapsed.as_secs_f64(),
        "exchange" => exchange.to_string(),
        "operation" => operation
    );
    if !ok {
        increment_counter!(
            "connector_call_errors_total",
            "exchange" => exchange.to_string(),
            "operation" => operation
        );
    }
}

/// A funding history fetch failed, labelled by error kind
pub fn record_funding_fetch_failed(exchange: Exchange, kind: &'static str) {
    increment_counter!(
        "funding_fetch_errors_total",
        "exchange" => exchange.to_string(),
        "kind" => kind
    );
}

/// A tranche confirmed on both legs
pub fn record_tranche_filled(primary: Exchange, hedge: Exchange) {
    increment_counter!(
        "tranches_filled_total",
        "primary" => primary.to_string(),
        "hedge" => hedge.to_string()
    );
}

/// A hedge leg fell short of its primary
pub fn record_leg_imbalance(exchange: Exchange) {
    increment_counter!("leg_imbalance_total", "exchange" => exchange.to_string());
}

/// Both legs were closed because of liquidation danger
pub fn record_emergency_close() {
    increment_counter!("emergency_closes_total");
}

/// Latest proximity to liquidation for one leg
pub fn record_proximity(exchange: Exchange, role: LegRole, ratio: f64) {
    gauge!(
        "leg_liquidation_proximity_ratio",
        ratio,
        "exchange" => exchange.to_string(),
        "leg" => role.to_string()
    );
}

/// Funding applied to a leg
pub fn record_funding_applied(exchange: Exchange, amount: f64) {
    histogram!("funding_applied", amount, "exchange" => exchange.to_string());
}

/// A triangular opportunity passed the profit filter
pub fn record_triangular_opportunity(exchange: Exchange, profit_after_fees_percent: f64) {
    increment_counter!("triangular_opportunities_total", "exchange" => exchange.to_string());
    histogram!(
        "triangular_profit_after_fees_percent",
        profit_after_fees_percent,
        "exchange" => exchange.to_string()
    );
}

/// Positions currently registered with the engine
pub fn record_tracked_positions(count: usize) {
    gauge!("tracked_positions", count as f64);
}
