//! Cross-exchange entry signals
//!
//! Compares two exchanges' prices and funding rates for a fixed symbol list and
//! hands an entry request to a [`PositionLauncher`] when a spread crosses its
//! threshold. Launches are guarded per symbol by an open-position check and a
//! cooldown.

use crate::{
    config::SignalConfig,
    connectors::{Exchange, PositionSide},
    market_data::MarketDataProvider,
    position::OpenPositionRequest,
    Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Starts hedged positions on behalf of the signal monitor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionLauncher: Send + Sync {
    /// Whether `user_id` already holds a non-terminal position on `symbol`
    async fn has_open_position(&self, user_id: &str, symbol: &str) -> bool;

    /// Create and start a position; returns its id
    async fn launch(&self, request: OpenPositionRequest) -> Result<String>;
}

/// What triggered a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Funding-rate difference between the exchanges
    FundingSpread,
    /// Price difference between the exchanges
    PriceSpread,
}

/// Entry signal for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Symbol
    pub symbol: String,
    /// Trigger
    pub kind: SignalKind,
    /// Exchange to hold the long leg
    pub long_exchange: Exchange,
    /// Exchange to hold the short leg
    pub short_exchange: Exchange,
    /// Observed spread (bps for price, absolute rate difference for funding)
    pub spread: f64,
}

/// One side of the monitored exchange pair
#[derive(Clone)]
pub struct MonitoredExchange {
    /// Exchange
    pub exchange: Exchange,
    /// Its market data
    pub market_data: Arc<dyn MarketDataProvider>,
}

/// Price spread in basis points of the cheaper price
pub fn price_spread_bps(a: f64, b: f64) -> f64 {
    let cheap = a.min(b);
    if cheap <= 0.0 {
        return 0.0;
    }
    (a.max(b) - cheap) / cheap * 10_000.0
}

/// Watches spreads and launches hedged positions
pub struct SignalMonitor {
    config: SignalConfig,
    primary: MonitoredExchange,
    hedge: MonitoredExchange,
    launcher: Arc<dyn PositionLauncher>,
    last_launch: DashMap<String, Instant>,
}

impl SignalMonitor {
    /// Create a monitor; `primary` holds the primary leg of every launched position
    pub fn new(
        config: SignalConfig,
        primary: MonitoredExchange,
        hedge: MonitoredExchange,
        launcher: Arc<dyn PositionLauncher>,
    ) -> Self {
        Self {
            config,
            primary,
            hedge,
            launcher,
            last_launch: DashMap::new(),
        }
    }

    /// Evaluate one symbol; `None` when a price is missing or no threshold is crossed
    ///
    /// A funding signal takes precedence over a price signal. A threshold of zero
    /// or less disables that signal.
    pub async fn evaluate(&self, symbol: &str) -> Option<Signal> {
        let (primary_price, hedge_price) = tokio::join!(
            self.primary.market_data.get_price(symbol),
            self.hedge.market_data.get_price(symbol)
        );
        let (primary_price, hedge_price) = match (primary_price, hedge_price) {
            (Some(p), Some(h)) if p > 0.0 && h > 0.0 => (p, h),
            _ => {
                debug!(symbol, "Price missing on one exchange, skipping");
                return None;
            }
        };

        if self.config.min_funding_spread > 0.0 {
            let (primary_funding, hedge_funding) = tokio::join!(
                self.primary.market_data.get_funding_rate(symbol),
                self.hedge.market_data.get_funding_rate(symbol)
            );
            if let (Some(p), Some(h)) = (primary_funding, hedge_funding) {
                let spread = (p.rate - h.rate).abs();
                if spread >= self.config.min_funding_spread {
                    // shorts collect positive funding: short where it is higher
                    let (long_exchange, short_exchange) = if p.rate > h.rate {
                        (self.hedge.exchange, self.primary.exchange)
                    } else {
                        (self.primary.exchange, self.hedge.exchange)
                    };
                    return Some(Signal {
                        symbol: symbol.to_string(),
                        kind: SignalKind::FundingSpread,
                        long_exchange,
                        short_exchange,
                        spread,
                    });
                }
            }
        }

        if self.config.min_price_spread_bps > 0.0 {
            let spread = price_spread_bps(primary_price, hedge_price);
            if spread >= self.config.min_price_spread_bps {
                let (long_exchange, short_exchange) = if primary_price < hedge_price {
                    (self.primary.exchange, self.hedge.exchange)
                } else {
                    (self.hedge.exchange, self.primary.exchange)
                };
                return Some(Signal {
                    symbol: symbol.to_string(),
                    kind: SignalKind::PriceSpread,
                    long_exchange,
                    short_exchange,
                    spread,
                });
            }
        }
        None
    }

    /// Entry request for `signal`
    pub fn build_request(&self, signal: &Signal) -> OpenPositionRequest {
        let primary_side = if signal.long_exchange == self.primary.exchange {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        OpenPositionRequest {
            user_id: self.config.user_id.clone(),
            symbol: signal.symbol.clone(),
            primary_exchange: self.primary.exchange,
            hedge_exchange: self.hedge.exchange,
            primary_side,
            quantity: self.config.quantity,
            leverage: self.config.leverage,
            total_parts: self.config.total_parts,
            inter_part_delay_ms: None,
        }
    }

    fn cooling_down(&self, symbol: &str) -> bool {
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        self.last_launch
            .get(symbol)
            .map_or(false, |last| last.elapsed() < cooldown)
    }

    /// Evaluate every symbol once and launch where signalled; returns the launched ids
    pub async fn tick(&self) -> Vec<String> {
        let mut launched = Vec::new();
        for symbol in &self.config.symbols {
            if self.cooling_down(symbol) {
                continue;
            }
            let Some(signal) = self.evaluate(symbol).await else {
                continue;
            };
            if self.launcher.has_open_position(&self.config.user_id, symbol).await {
                debug!(symbol = %symbol, "Signal ignored, position already open");
                continue;
            }

            info!(
                symbol = %symbol,
                kind = ?signal.kind,
                long = %signal.long_exchange,
                short = %signal.short_exchange,
                spread = signal.spread,
                "Entry signal"
            );
            self.last_launch.insert(symbol.clone(), Instant::now());
            match self.launcher.launch(self.build_request(&signal)).await {
                Ok(position_id) => {
                    info!(symbol = %symbol, position_id = %position_id, "Position launched");
                    launched.push(position_id);
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Position launch rejected"),
            }
        }
        launched
    }

    /// Tick on the configured interval until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            primary = %self.primary.exchange,
            hedge = %self.hedge.exchange,
            symbols = self.config.symbols.len(),
            "Signal monitor started"
        );

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
            self.tick().await;
        }
        info!("Signal monitor stopped");
    }
}
