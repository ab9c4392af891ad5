//! Market-data interface consumed by the signal monitor and triangular detector

use crate::connectors::FundingRateInfo;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Source of prices and funding rates
///
/// `None` means the caller cannot act on the symbol. It is never a zero price.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Last traded or mark price
    async fn get_price(&self, symbol: &str) -> Option<f64>;

    /// Current funding rate
    async fn get_funding_rate(&self, symbol: &str) -> Option<FundingRateInfo>;
}

/// Push-fed cache that forgets entries older than `max_age`
pub struct PriceCache {
    prices: DashMap<String, (f64, Instant)>,
    funding: DashMap<String, (FundingRateInfo, Instant)>,
    max_age: Duration,
}

impl PriceCache {
    /// Create an empty cache
    pub fn new(max_age: Duration) -> Self {
        Self {
            prices: DashMap::new(),
            funding: DashMap::new(),
            max_age,
        }
    }

    /// Record a price; non-positive or non-finite prices are dropped
    pub fn update_price(&self, symbol: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            self.prices.remove(symbol);
            return;
        }
        self.prices.insert(symbol.to_string(), (price, Instant::now()));
    }

    /// Record a funding rate
    pub fn update_funding_rate(&self, symbol: &str, info: FundingRateInfo) {
        self.funding.insert(symbol.to_string(), (info, Instant::now()));
    }

    /// Number of fresh prices
    pub fn len(&self) -> usize {
        self.prices
            .iter()
            .filter(|entry| entry.value().1.elapsed() <= self.max_age)
            .count()
    }

    /// True when no fresh price is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MarketDataProvider for PriceCache {
    async fn get_price(&self, symbol: &str) -> Option<f64> {
        self.prices
            .get(symbol)
            .filter(|entry| entry.value().1.elapsed() <= self.max_age)
            .map(|entry| entry.value().0)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Option<FundingRateInfo> {
        self.funding
            .get(symbol)
            .filter(|entry| entry.value().1.elapsed() <= self.max_age)
            .map(|entry| entry.value().0.clone())
    }
}
