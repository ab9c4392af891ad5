//! Liquidation price and proximity estimates
//!
//! Isolated-margin approximation with a flat maintenance margin rate per
//! exchange. Real venues tier the rate by notional, so every estimate carries
//! a warning saying so.

use crate::{
    connectors::{Exchange, PositionSide},
    ArbitrageError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Flat maintenance margin rate used when none is configured
pub fn default_maintenance_margin_rate(exchange: Exchange) -> f64 {
    match exchange {
        Exchange::Bybit => 0.005,
        Exchange::BingX => 0.005,
        Exchange::GateIo => 0.005,
        Exchange::Mexc => 0.004,
        Exchange::Bitget => 0.004,
        Exchange::Binance => 0.004,
        Exchange::Okx => 0.004,
    }
}

/// Liquidation price estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEstimate {
    /// Estimated liquidation price
    pub liquidation_price: f64,
    /// Maintenance margin rate used
    pub mmr: f64,
    /// Caveats attached to the estimate
    pub warnings: Vec<String>,
}

/// Distance travelled toward liquidation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Proximity {
    /// 0 at entry (or better), 1 at the liquidation price
    pub proximity_ratio: f64,
    /// Ratio at or above the danger threshold
    pub is_in_danger: bool,
}

/// `liq = entry·(1 − 1/lev + mmr)` for longs, `entry·(1 + 1/lev − mmr)` for shorts
pub fn calculate_liquidation_price(
    entry_price: f64,
    leverage: u32,
    side: PositionSide,
    exchange: Exchange,
    maintenance_margin_rate: Option<f64>,
) -> Result<LiquidationEstimate> {
    if !entry_price.is_finite() || entry_price <= 0.0 {
        return Err(ArbitrageError::Validation(format!("entry price must be positive, got {}", entry_price)).into());
    }
    if leverage == 0 {
        return Err(ArbitrageError::Validation("leverage must be at least 1".to_string()).into());
    }

    let mmr = maintenance_margin_rate.unwrap_or_else(|| default_maintenance_margin_rate(exchange));
    let inverse_leverage = 1.0 / leverage as f64;
    let liquidation_price = match side {
        PositionSide::Long => entry_price * (1.0 - inverse_leverage + mmr),
        PositionSide::Short => entry_price * (1.0 + inverse_leverage - mmr),
    };

    let mut warnings = vec![format!(
        "{} maintenance margin rate {} is a flat approximation; exchange tiers by notional are not modelled",
        exchange, mmr
    )];
    if mmr >= inverse_leverage {
        warnings.push(format!(
            "maintenance margin rate {} is at or above initial margin {:.4} at {}x; the position is liquidatable at entry",
            mmr, inverse_leverage, leverage
        ));
    }

    Ok(LiquidationEstimate {
        liquidation_price: liquidation_price.max(0.0),
        mmr,
        warnings,
    })
}

/// Fraction of the entry→liquidation distance already travelled; moves away count as 0
pub fn calculate_proximity(
    liquidation_price: f64,
    entry_price: f64,
    current_price: f64,
    side: PositionSide,
    danger_threshold: f64,
) -> Proximity {
    let distance = (entry_price - liquidation_price).abs();
    if distance <= f64::EPSILON {
        // nothing between entry and liquidation
        return Proximity {
            proximity_ratio: f64::INFINITY,
            is_in_danger: true,
        };
    }

    let travelled = match side {
        PositionSide::Long => entry_price - current_price,
        PositionSide::Short => current_price - entry_price,
    };
    let proximity_ratio = (travelled / distance).max(0.0);
    Proximity {
        proximity_ratio,
        is_in_danger: proximity_ratio >= danger_threshold,
    }
}

/// Liquidation estimates with configured threshold and MMR overrides
#[derive(Debug, Clone)]
pub struct LiquidationCalculator {
    danger_threshold: f64,
    mmr_overrides: HashMap<Exchange, f64>,
}

impl LiquidationCalculator {
    /// Create a calculator
    pub fn new(danger_threshold: f64, mmr_overrides: HashMap<Exchange, f64>) -> Self {
        Self {
            danger_threshold,
            mmr_overrides,
        }
    }

    /// Danger threshold in use
    pub fn danger_threshold(&self) -> f64 {
        self.danger_threshold
    }

    /// Liquidation estimate using the configured rate for `exchange`
    pub fn liquidation_price(
        &self,
        entry_price: f64,
        leverage: u32,
        side: PositionSide,
        exchange: Exchange,
    ) -> Result<LiquidationEstimate> {
        calculate_liquidation_price(
            entry_price,
            leverage,
            side,
            exchange,
            self.mmr_overrides.get(&exchange).copied(),
        )
    }

    /// Proximity using the configured threshold
    pub fn proximity(&self, liquidation_price: f64, entry_price: f64, current_price: f64, side: PositionSide) -> Proximity {
        calculate_proximity(liquidation_price, entry_price, current_price, side, self.danger_threshold)
    }
}

impl Default for LiquidationCalculator {
    fn default() -> Self {
        Self::new(crate::config::ConfigDefaults::DANGER_THRESHOLD, HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_at_entry_is_safe() {
        let calc = LiquidationCalculator::default();
        let estimate = calc.liquidation_price(100.0, 3, PositionSide::Long, Exchange::Bybit).unwrap();
        let proximity = calc.proximity(estimate.liquidation_price, 100.0, 100.0, PositionSide::Long);
        assert_eq!(proximity.proximity_ratio, 0.0);
        assert!(!proximity.is_in_danger);
    }

    #[test]
    fn test_long_at_liquidation_is_in_danger() {
        let calc = LiquidationCalculator::default();
        let estimate = calc.liquidation_price(100.0, 3, PositionSide::Long, Exchange::Bybit).unwrap();
        let expected = 100.0 * (1.0 - 1.0 / 3.0 + 0.005);
        assert!((estimate.liquidation_price - expected).abs() < 1e-9);

        let proximity = calc.proximity(estimate.liquidation_price, 100.0, estimate.liquidation_price, PositionSide::Long);
        assert!((proximity.proximity_ratio - 1.0).abs() < 1e-9);
        assert!(proximity.is_in_danger);
    }

    #[test]
    fn test_short_formula_and_round_trip() {
        let estimate = calculate_liquidation_price(200.0, 10, PositionSide::Short, Exchange::Binance, None).unwrap();
        assert!((estimate.liquidation_price - 200.0 * (1.0 + 0.1 - 0.004)).abs() < 1e-9);
        assert_eq!(estimate.mmr, 0.004);

        let at_entry = calculate_proximity(estimate.liquidation_price, 200.0, 200.0, PositionSide::Short, 0.9);
        assert_eq!(at_entry.proximity_ratio, 0.0);
        assert!(!at_entry.is_in_danger);
    }

    #[test]
    fn test_favourable_move_clamps_to_zero() {
        let long = calculate_proximity(70.0, 100.0, 120.0, PositionSide::Long, 0.9);
        assert_eq!(long.proximity_ratio, 0.0);
        let short = calculate_proximity(130.0, 100.0, 80.0, PositionSide::Short, 0.9);
        assert_eq!(short.proximity_ratio, 0.0);
    }

    #[test]
    fn test_threshold_boundary() {
        // 90% of the way from 100 to 70
        let p = calculate_proximity(70.0, 100.0, 73.0, PositionSide::Long, 0.9);
        assert!((p.proximity_ratio - 0.9).abs() < 1e-9);
        let p = calculate_proximity(70.0, 100.0, 74.0, PositionSide::Long, 0.9);
        assert!(!p.is_in_danger);
    }

    #[test]
    fn test_warnings() {
        let estimate = calculate_liquidation_price(100.0, 3, PositionSide::Long, Exchange::Okx, None).unwrap();
        assert_eq!(estimate.warnings.len(), 1);
        assert!(estimate.warnings[0].contains("flat approximation"));

        let estimate = calculate_liquidation_price(100.0, 100, PositionSide::Long, Exchange::Okx, Some(0.02)).unwrap();
        assert_eq!(estimate.warnings.len(), 2);
    }

    #[test]
    fn test_overrides_apply_per_exchange() {
        let calc = LiquidationCalculator::new(0.8, HashMap::from([(Exchange::Bybit, 0.01)]));
        let estimate = calc.liquidation_price(100.0, 2, PositionSide::Long, Exchange::Bybit).unwrap();
        assert_eq!(estimate.mmr, 0.01);
        assert!((estimate.liquidation_price - 51.0).abs() < 1e-9);
        assert_eq!(calc.danger_threshold(), 0.8);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(calculate_liquidation_price(0.0, 3, PositionSide::Long, Exchange::Bybit, None).is_err());
        assert!(calculate_liquidation_price(100.0, 0, PositionSide::Long, Exchange::Bybit, None).is_err());
    }
}
