//! Triangular arbitrage opportunity detection
//!
//! A cycle is three pairs on one exchange linking three assets, e.g.
//! USDT -> BTC -> ETH -> USDT. Each scan re-prices every cycle in both
//! directions, resolving for every leg whether the held asset is the pair's
//! quote (BUY) or base (SELL).

use crate::{
    config::{CycleConfig, TriangularConfig},
    connectors::{Exchange, OrderSide, OrderType},
    market_data::MarketDataProvider,
    utils::metrics,
    ArbitrageError, Result,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Spot pair traded in a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingPair {
    /// Exchange symbol
    pub symbol: String,
    /// Base asset
    pub base_asset: String,
    /// Quote asset
    pub quote_asset: String,
    /// Order type used on this pair
    pub order_type: OrderType,
}

/// Three pairs closing a loop back to `start_asset`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangleCycle {
    /// Asset the cycle starts and ends in
    pub start_asset: String,
    /// Pairs in forward order
    pub pairs: [TradingPair; 3],
}

impl TriangleCycle {
    /// Build a cycle, checking that both directions route back to the start asset
    pub fn new(start_asset: impl Into<String>, pairs: [TradingPair; 3]) -> Result<Self> {
        let cycle = Self {
            start_asset: start_asset.into(),
            pairs,
        };
        for direction in [CycleDirection::Forward, CycleDirection::Reverse] {
            if cycle.route(direction).is_none() {
                return Err(ArbitrageError::Config(format!(
                    "cycle {} does not route back to {} in the {:?} direction",
                    cycle.key(),
                    cycle.start_asset,
                    direction
                ))
                .into());
            }
        }
        Ok(cycle)
    }

    /// Stable key, e.g. "USDT:BTCUSDT>ETHBTC>ETHUSDT"
    pub fn key(&self) -> String {
        format!(
            "{}:{}>{}>{}",
            self.start_asset, self.pairs[0].symbol, self.pairs[1].symbol, self.pairs[2].symbol
        )
    }

    fn ordered(&self, direction: CycleDirection) -> [&TradingPair; 3] {
        match direction {
            CycleDirection::Forward => [&self.pairs[0], &self.pairs[1], &self.pairs[2]],
            CycleDirection::Reverse => [&self.pairs[2], &self.pairs[1], &self.pairs[0]],
        }
    }

    /// Resolved sides and assets for one direction; `None` when the pairs do not chain
    pub fn route(&self, direction: CycleDirection) -> Option<[RouteStep; 3]> {
        let mut held = self.start_asset.clone();
        let mut steps = Vec::with_capacity(3);
        for pair in self.ordered(direction) {
            let side = resolve_side(pair, &held)?;
            let to_asset = match side {
                OrderSide::Buy => pair.base_asset.clone(),
                OrderSide::Sell => pair.quote_asset.clone(),
            };
            steps.push(RouteStep {
                pair: pair.clone(),
                side,
                from_asset: std::mem::replace(&mut held, to_asset.clone()),
                to_asset,
            });
        }
        if held != self.start_asset {
            return None;
        }
        steps.try_into().ok()
    }
}

impl TryFrom<&CycleConfig> for TriangleCycle {
    type Error = anyhow::Error;

    fn try_from(config: &CycleConfig) -> Result<Self> {
        let pairs: Vec<TradingPair> = config
            .pairs
            .iter()
            .map(|p| TradingPair {
                symbol: p.symbol.clone(),
                base_asset: p.base.clone(),
                quote_asset: p.quote.clone(),
                order_type: p.order_type,
            })
            .collect();
        let count = pairs.len();
        let pairs: [TradingPair; 3] = pairs.try_into().map_err(|_| {
            ArbitrageError::Config(format!(
                "cycle starting in {} needs exactly 3 pairs, got {}",
                config.start_asset, count
            ))
        })?;
        TriangleCycle::new(config.start_asset.clone(), pairs)
    }
}

/// Direction a cycle is traversed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleDirection {
    /// Pairs in configured order
    Forward,
    /// Pairs in reverse order
    Reverse,
}

/// One resolved leg of a route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStep {
    /// Pair traded
    pub pair: TradingPair,
    /// Side resolved from the held asset
    pub side: OrderSide,
    /// Asset given up
    pub from_asset: String,
    /// Asset received
    pub to_asset: String,
}

/// Side that converts `held` through `pair`: quote held buys base, base held sells for quote
pub fn resolve_side(pair: &TradingPair, held: &str) -> Option<OrderSide> {
    if held == pair.quote_asset {
        Some(OrderSide::Buy)
    } else if held == pair.base_asset {
        Some(OrderSide::Sell)
    } else {
        None
    }
}

/// Amount of the next asset received for `amount` of the held one, before fees
pub fn convert(amount: f64, side: OrderSide, price: f64) -> f64 {
    match side {
        OrderSide::Buy => amount / price,
        OrderSide::Sell => amount * price,
    }
}

/// Fee rates by order type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeSchedule {
    /// Maker rate
    pub maker: f64,
    /// Taker rate
    pub taker: f64,
}

impl FeeSchedule {
    /// Rate charged for `order_type`
    pub fn rate(&self, order_type: OrderType) -> f64 {
        match order_type {
            OrderType::Limit => self.maker,
            OrderType::Market => self.taker,
        }
    }
}

/// Leg of a detected opportunity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityLeg {
    /// Symbol
    pub symbol: String,
    /// Price used for the estimate
    pub price: f64,
    /// Resolved side
    pub side: OrderSide,
    /// Pair base asset
    pub base_asset: String,
    /// Pair quote asset
    pub quote_asset: String,
    /// Asset given up
    pub from_asset: String,
    /// Asset received
    pub to_asset: String,
    /// Order type (decides the fee rate)
    pub order_type: OrderType,
}

impl OpportunityLeg {
    fn from_step(step: RouteStep, price: f64) -> Self {
        Self {
            symbol: step.pair.symbol,
            price,
            side: step.side,
            base_asset: step.pair.base_asset,
            quote_asset: step.pair.quote_asset,
            from_asset: step.from_asset,
            to_asset: step.to_asset,
            order_type: step.pair.order_type,
        }
    }
}

/// Snapshot of a profitable cycle; decays after `expires_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangularOpportunity {
    /// Identifier
    pub id: String,
    /// Exchange
    pub exchange: Exchange,
    /// Cycle key
    pub cycle: String,
    /// Traversal direction
    pub direction: CycleDirection,
    /// Legs in execution order
    pub legs: [OpportunityLeg; 3],
    /// Asset the cycle starts and ends in
    pub start_asset: String,
    /// Intermediate asset between leg 1 and leg 3
    pub bridge_asset: String,
    /// Profit from prices alone, percent
    pub theoretical_profit_percent: f64,
    /// Profit after per-leg fees, percent
    pub profit_after_fees_percent: f64,
    /// Detection time
    pub detected_at: DateTime<Utc>,
    /// End of validity
    pub expires_at: DateTime<Utc>,
    /// Set once an executor consumed it
    pub was_executed: bool,
}

impl TriangularOpportunity {
    /// Not yet consumed, not expired and still profitable after fees
    pub fn is_executable(&self, now: DateTime<Utc>) -> bool {
        !self.was_executed && now < self.expires_at && self.profit_after_fees_percent > 0.0
    }
}

/// Theoretical and fee-adjusted result of one pass through a route
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleProfit {
    /// Percent gained from prices alone
    pub theoretical_percent: f64,
    /// Percent gained after fees
    pub after_fees_percent: f64,
}

/// Profit of a route at `prices` (one per leg, execution order)
pub fn cycle_profit(legs: &[OpportunityLeg; 3], prices: [f64; 3], fees: FeeSchedule) -> Option<CycleProfit> {
    let mut gross = 1.0;
    let mut net = 1.0;
    for (leg, price) in legs.iter().zip(prices) {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        gross = convert(gross, leg.side, price);
        net = convert(net, leg.side, price) * (1.0 - fees.rate(leg.order_type));
    }
    Some(CycleProfit {
        theoretical_percent: (gross - 1.0) * 100.0,
        after_fees_percent: (net - 1.0) * 100.0,
    })
}

/// Scans a fixed cycle universe for profitable loops
pub struct TriangularDetector {
    exchange: Exchange,
    universe: IndexMap<String, TriangleCycle>,
    market_data: Arc<dyn MarketDataProvider>,
    fees: FeeSchedule,
    min_profit_percent: f64,
    ttl: ChronoDuration,
    scan_interval: Duration,
}

impl TriangularDetector {
    /// Build a detector from configuration
    pub fn from_config(config: &TriangularConfig, market_data: Arc<dyn MarketDataProvider>) -> Result<Self> {
        let exchange: Exchange = config.exchange.parse()?;
        let mut detector = Self::new(
            exchange,
            market_data,
            FeeSchedule {
                maker: config.maker_fee,
                taker: config.taker_fee,
            },
            config.min_profit_percent,
            Duration::from_millis(config.opportunity_ttl_ms),
        );
        detector.scan_interval = Duration::from_millis(config.scan_interval_ms.max(1));
        for cycle in &config.cycles {
            detector.add_cycle(TriangleCycle::try_from(cycle)?);
        }
        Ok(detector)
    }

    /// Create a detector with an empty universe
    pub fn new(
        exchange: Exchange,
        market_data: Arc<dyn MarketDataProvider>,
        fees: FeeSchedule,
        min_profit_percent: f64,
        ttl: Duration,
    ) -> Self {
        Self {
            exchange,
            universe: IndexMap::new(),
            market_data,
            fees,
            min_profit_percent: min_profit_percent.max(0.0),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(3)),
            scan_interval: Duration::from_secs(1),
        }
    }

    /// Add a cycle; replaces one with the same key
    pub fn add_cycle(&mut self, cycle: TriangleCycle) {
        self.universe.insert(cycle.key(), cycle);
    }

    /// Cycles in insertion order
    pub fn cycles(&self) -> impl Iterator<Item = &TriangleCycle> {
        self.universe.values()
    }

    /// Exchange scanned
    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Fee schedule applied
    pub fn fees(&self) -> FeeSchedule {
        self.fees
    }

    async fn evaluate(&self, cycle: &TriangleCycle, direction: CycleDirection, now: DateTime<Utc>) -> Option<TriangularOpportunity> {
        let steps = cycle.route(direction)?;
        let mut prices = [0.0; 3];
        for (slot, step) in prices.iter_mut().zip(steps.iter()) {
            // a missing price means the cycle cannot be acted on
            *slot = self.market_data.get_price(&step.pair.symbol).await?;
        }

        let mut index = 0;
        let legs = steps.map(|step| {
            let leg = OpportunityLeg::from_step(step, prices[index]);
            index += 1;
            leg
        });
        let profit = cycle_profit(&legs, prices, self.fees)?;
        debug!(
            cycle = %cycle.key(),
            direction = ?direction,
            theoretical = profit.theoretical_percent,
            after_fees = profit.after_fees_percent,
            "Cycle evaluated"
        );
        if profit.after_fees_percent <= self.min_profit_percent {
            return None;
        }

        let bridge_asset = legs[0].to_asset.clone();
        Some(TriangularOpportunity {
            id: uuid::Uuid::new_v4().to_string(),
            exchange: self.exchange,
            cycle: cycle.key(),
            direction,
            start_asset: cycle.start_asset.clone(),
            bridge_asset,
            legs,
            theoretical_profit_percent: profit.theoretical_percent,
            profit_after_fees_percent: profit.after_fees_percent,
            detected_at: now,
            expires_at: now + self.ttl,
            was_executed: false,
        })
    }

    /// Evaluate every cycle in both directions once
    pub async fn scan(&self) -> Vec<TriangularOpportunity> {
        let now = Utc::now();
        let mut found = Vec::new();
        for cycle in self.universe.values() {
            for direction in [CycleDirection::Forward, CycleDirection::Reverse] {
                if let Some(opportunity) = self.evaluate(cycle, direction, now).await {
                    metrics::record_triangular_opportunity(self.exchange, opportunity.profit_after_fees_percent);
                    info!(
                        cycle = %opportunity.cycle,
                        direction = ?direction,
                        profit_after_fees = opportunity.profit_after_fees_percent,
                        "Triangular opportunity detected"
                    );
                    found.push(opportunity);
                }
            }
        }
        found
    }

    /// Rescan on the configured interval until `shutdown` flips or the receiver goes away
    pub async fn run(&self, sink: mpsc::Sender<TriangularOpportunity>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.scan_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(exchange = %self.exchange, cycles = self.universe.len(), "Triangular detector started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            for opportunity in self.scan().await {
                if sink.send(opportunity).await.is_err() {
                    warn!("Opportunity receiver dropped, stopping detector");
                    return;
                }
            }
        }
        info!(exchange = %self.exchange, "Triangular detector stopped");
    }
}
