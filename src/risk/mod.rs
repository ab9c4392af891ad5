//! Risk estimates

pub mod liquidation;

pub use liquidation::{
    calculate_liquidation_price, calculate_proximity, LiquidationCalculator, LiquidationEstimate, Proximity,
};
