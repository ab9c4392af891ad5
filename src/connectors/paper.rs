//! Simulated exchange used by dry runs and tests

use super::{
    CloseOutcome, ConnectorError, ConnectorResult, Exchange, ExchangeConnector, FundingPayment,
    FundingRateInfo, OrderFill, OrderRequest, OrderSide, PositionSide, PositionSnapshot,
};
use crate::market_data::MarketDataProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Scripted order failure: let `pass` opening orders through, then fail `fail` of them
#[derive(Debug, Clone)]
struct OrderFault {
    pass: usize,
    fail: usize,
    error: ConnectorError,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, f64>,
    funding_rates: HashMap<String, FundingRateInfo>,
    /// Signed position size (positive long)
    positions: HashMap<String, f64>,
    entry_prices: HashMap<String, f64>,
    leverage: HashMap<String, u32>,
    trading_stops: HashMap<String, (Option<f64>, Option<f64>)>,
    funding_history: HashMap<String, Vec<FundingPayment>>,
    funding_history_error: Option<ConnectorError>,
    order_fault: Option<OrderFault>,
    close_failures: usize,
    position_query_error: Option<ConnectorError>,
    fill_ratio: Option<f64>,
    order_delay: Option<Duration>,
    orders: Vec<OrderRequest>,
    next_order_id: u64,
}

/// In-process exchange with deterministic fills and fault injection
///
/// Orders fill at the configured price (plus optional random slippage) and the
/// position book is updated before any simulated response delay, so a caller
/// that gives up on a slow response still leaves a real fill behind.
pub struct PaperConnector {
    exchange: Exchange,
    fee_rate: f64,
    min_quantity: f64,
    max_slippage_bps: f64,
    state: Mutex<PaperState>,
}

impl PaperConnector {
    /// Create an empty simulated exchange
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            fee_rate: 0.0,
            min_quantity: 0.0,
            max_slippage_bps: 0.0,
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Taker fee charged on every fill
    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Smallest accepted order quantity
    pub fn with_min_quantity(mut self, min_quantity: f64) -> Self {
        self.min_quantity = min_quantity;
        self
    }

    /// Random adverse slippage up to `bps` basis points
    pub fn with_max_slippage_bps(mut self, bps: f64) -> Self {
        self.max_slippage_bps = bps;
        self
    }

    /// Set the last/mark price for a symbol
    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().await.prices.insert(symbol.to_string(), price);
    }

    /// Remove a symbol's price, making it unavailable
    pub async fn clear_price(&self, symbol: &str) {
        self.state.lock().await.prices.remove(symbol);
    }

    /// Set the current funding rate for a symbol
    pub async fn set_funding_rate(&self, symbol: &str, rate: f64, interval_hours: u32) {
        let info = FundingRateInfo {
            rate,
            next_payment_time: Utc::now() + chrono::Duration::hours(interval_hours as i64),
            interval_hours,
        };
        self.state.lock().await.funding_rates.insert(symbol.to_string(), info);
    }

    /// Seed an exchange-side position
    pub async fn set_position(&self, symbol: &str, signed_size: f64, entry_price: f64) {
        let mut state = self.state.lock().await;
        state.positions.insert(symbol.to_string(), signed_size);
        state.entry_prices.insert(symbol.to_string(), entry_price);
    }

    /// Record a settled funding payment
    pub async fn push_funding_payment(&self, payment: FundingPayment) {
        self.state
            .lock()
            .await
            .funding_history
            .entry(payment.symbol.clone())
            .or_default()
            .push(payment);
    }

    /// Make funding history queries fail until cleared
    pub async fn fail_funding_history(&self, error: Option<ConnectorError>) {
        self.state.lock().await.funding_history_error = error;
    }

    /// After `pass` more opening orders succeed, fail the next `fail` opening orders
    pub async fn fail_orders(&self, pass: usize, fail: usize, error: ConnectorError) {
        self.state.lock().await.order_fault = Some(OrderFault { pass, fail, error });
    }

    /// Fail the next `count` close calls
    pub async fn fail_next_closes(&self, count: usize) {
        self.state.lock().await.close_failures = count;
    }

    /// Make position queries fail until cleared
    pub async fn fail_position_queries(&self, error: Option<ConnectorError>) {
        self.state.lock().await.position_query_error = error;
    }

    /// Fill only this fraction of opening orders
    pub async fn set_fill_ratio(&self, ratio: Option<f64>) {
        self.state.lock().await.fill_ratio = ratio;
    }

    /// Delay every order response after the fill is booked
    pub async fn set_order_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.order_delay = delay;
    }

    /// Signed position size
    pub async fn position_size(&self, symbol: &str) -> f64 {
        self.state.lock().await.positions.get(symbol).copied().unwrap_or(0.0)
    }

    /// Every order accepted so far
    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.state.lock().await.orders.clone()
    }

    /// Leverage last set on a symbol
    pub async fn leverage(&self, symbol: &str) -> Option<u32> {
        self.state.lock().await.leverage.get(symbol).copied()
    }

    /// TP/SL last attached to a symbol
    pub async fn trading_stop(&self, symbol: &str) -> Option<(Option<f64>, Option<f64>)> {
        self.state.lock().await.trading_stops.get(symbol).copied()
    }

    fn fill_price(&self, price: f64, side: OrderSide) -> f64 {
        if self.max_slippage_bps <= 0.0 {
            return price;
        }
        let slip = rand::thread_rng().gen_range(0.0..=self.max_slippage_bps) / 10_000.0;
        match side {
            OrderSide::Buy => price * (1.0 + slip),
            OrderSide::Sell => price * (1.0 - slip),
        }
    }

    /// Book a fill against the position ledger
    fn book(state: &mut PaperState, symbol: &str, side: OrderSide, quantity: f64, price: f64) {
        let current = state.positions.get(symbol).copied().unwrap_or(0.0);
        let delta = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let next = current + delta;
        let entry = state.entry_prices.get(symbol).copied().unwrap_or(0.0);

        let next_entry = if current == 0.0 || current.signum() != next.signum() {
            price
        } else if next.abs() > current.abs() {
            (entry * current.abs() + price * quantity) / next.abs()
        } else {
            entry
        };

        if next.abs() < 1e-12 {
            state.positions.remove(symbol);
            state.entry_prices.remove(symbol);
        } else {
            state.positions.insert(symbol.to_string(), next);
            state.entry_prices.insert(symbol.to_string(), next_entry);
        }
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn place_order(&self, order: &OrderRequest) -> ConnectorResult<OrderFill> {
        let (fill, delay) = {
            let mut state = self.state.lock().await;

            if !order.reduce_only {
                if let Some(fault) = state.order_fault.as_mut() {
                    if fault.pass > 0 {
                        fault.pass -= 1;
                    } else if fault.fail > 0 {
                        fault.fail -= 1;
                        let error = fault.error.clone();
                        if fault.fail == 0 {
                            state.order_fault = None;
                        }
                        return Err(error);
                    }
                }
            }

            if order.quantity <= 0.0 || order.quantity < self.min_quantity {
                return Err(ConnectorError::MinimumQuantityViolation {
                    symbol: order.symbol.clone(),
                    quantity: order.quantity,
                    detail: format!("minimum {}", self.min_quantity),
                });
            }

            let price = state
                .prices
                .get(&order.symbol)
                .copied()
                .ok_or_else(|| ConnectorError::DataUnavailable(format!("no price for {}", order.symbol)))?;

            let mut quantity = order.quantity;
            if order.reduce_only {
                let current = state.positions.get(&order.symbol).copied().unwrap_or(0.0);
                let reducible = match order.side {
                    OrderSide::Buy if current < 0.0 => -current,
                    OrderSide::Sell if current > 0.0 => current,
                    _ => 0.0,
                };
                if reducible <= 0.0 {
                    return Err(ConnectorError::ExchangeRejected(
                        "reduce-only order would increase position".to_string(),
                    ));
                }
                quantity = quantity.min(reducible);
            } else if let Some(ratio) = state.fill_ratio {
                quantity *= ratio.clamp(0.0, 1.0);
            }

            let average_price = self.fill_price(price, order.side);
            Self::book(&mut state, &order.symbol, order.side, quantity, average_price);

            state.next_order_id += 1;
            state.orders.push(order.clone());
            let fill = OrderFill {
                order_id: format!("{}-{}", self.exchange, state.next_order_id),
                filled_quantity: quantity,
                average_price,
                fee: quantity * average_price * self.fee_rate,
            };
            debug!(exchange = %self.exchange, symbol = %order.symbol, side = %order.side, quantity, "Paper fill");
            (fill, state.order_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(fill)
    }

    async fn get_position(&self, symbol: &str) -> ConnectorResult<Option<PositionSnapshot>> {
        let state = self.state.lock().await;
        if let Some(error) = &state.position_query_error {
            return Err(error.clone());
        }
        let Some(size) = state.positions.get(symbol).copied() else {
            return Ok(None);
        };
        let entry_price = state.entry_prices.get(symbol).copied().unwrap_or(0.0);
        Ok(Some(PositionSnapshot {
            symbol: symbol.to_string(),
            side: if size > 0.0 { PositionSide::Long } else { PositionSide::Short },
            size: size.abs(),
            entry_price,
            mark_price: state.prices.get(symbol).copied().unwrap_or(entry_price),
        }))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, _side: Option<PositionSide>) -> ConnectorResult<()> {
        if leverage == 0 {
            return Err(ConnectorError::ExchangeRejected("leverage must be at least 1".to_string()));
        }
        self.state.lock().await.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn set_trading_stop(
        &self,
        symbol: &str,
        _side: PositionSide,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> ConnectorResult<()> {
        let mut state = self.state.lock().await;
        if !state.positions.contains_key(symbol) {
            return Err(ConnectorError::ExchangeRejected(format!("no open position on {}", symbol)));
        }
        state.trading_stops.insert(symbol.to_string(), (take_profit, stop_loss));
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> ConnectorResult<CloseOutcome> {
        let size = {
            let mut state = self.state.lock().await;
            if state.close_failures > 0 {
                state.close_failures -= 1;
                return Err(ConnectorError::Connection("simulated close failure".to_string()));
            }
            match state.positions.get(symbol).copied() {
                Some(size) => size,
                None => return Ok(CloseOutcome::NoPosition),
            }
        };

        let side = if size > 0.0 { OrderSide::Sell } else { OrderSide::Buy };
        let order = OrderRequest::market(symbol, side, size.abs()).reduce_only();
        let fill = self.place_order(&order).await?;
        self.state.lock().await.trading_stops.remove(symbol);
        Ok(CloseOutcome::Closed(fill))
    }

    async fn get_funding_rate(&self, symbol: &str) -> ConnectorResult<FundingRateInfo> {
        self.state
            .lock()
            .await
            .funding_rates
            .get(symbol)
            .cloned()
            .ok_or_else(|| ConnectorError::DataUnavailable(format!("no funding rate for {}", symbol)))
    }

    async fn get_funding_history(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<FundingPayment>> {
        let state = self.state.lock().await;
        if let Some(error) = &state.funding_history_error {
            return Err(error.clone());
        }
        Ok(state
            .funding_history
            .get(symbol)
            .map(|payments| {
                payments
                    .iter()
                    .filter(|p| since.map_or(true, |since| p.timestamp >= since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl MarketDataProvider for PaperConnector {
    async fn get_price(&self, symbol: &str) -> Option<f64> {
        self.state.lock().await.prices.get(symbol).copied()
    }

    async fn get_funding_rate(&self, symbol: &str) -> Option<FundingRateInfo> {
        self.state.lock().await.funding_rates.get(symbol).cloned()
    }
}
