//! Timeout and rate-budget wrapper shared by every position trading on an exchange

use super::{
    CloseOutcome, ConnectorError, ConnectorResult, Exchange, ExchangeConnector, FundingPayment,
    FundingRateInfo, OrderFill, OrderRequest, PositionSide, PositionSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::warn;

/// Connector decorator bounding every call by a timeout and a shared in-flight budget
///
/// Waiting for a permit is not part of the timeout: a request that never left the
/// process must not be reported as an unknown outcome.
#[derive(Clone)]
pub struct GuardedConnector {
    inner: Arc<dyn ExchangeConnector>,
    call_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl GuardedConnector {
    /// Wrap a connector with its own permit pool
    pub fn new(inner: Arc<dyn ExchangeConnector>, call_timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            inner,
            call_timeout,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Wrap a connector sharing an existing permit pool
    pub fn with_permits(inner: Arc<dyn ExchangeConnector>, call_timeout: Duration, permits: Arc<Semaphore>) -> Self {
        Self { inner, call_timeout, permits }
    }

    /// Configured per-call timeout
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> ConnectorResult<T>
    where
        F: Future<Output = ConnectorResult<T>> + Send,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ConnectorError::Connection("request budget closed".to_string()))?;

        let started = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    exchange = %self.inner.exchange(),
                    operation,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Connector call timed out"
                );
                Err(ConnectorError::Timeout {
                    operation: operation.to_string(),
                    after_ms: self.call_timeout.as_millis() as u64,
                })
            }
        };

        crate::utils::metrics::record_connector_call(
            self.inner.exchange(),
            operation,
            started.elapsed(),
            result.is_ok(),
        );
        result
    }
}

#[async_trait]
impl ExchangeConnector for GuardedConnector {
    fn exchange(&self) -> Exchange {
        self.inner.exchange()
    }

    async fn place_order(&self, order: &OrderRequest) -> ConnectorResult<OrderFill> {
        self.guarded("place_order", self.inner.place_order(order)).await
    }

    async fn get_position(&self, symbol: &str) -> ConnectorResult<Option<PositionSnapshot>> {
        self.guarded("get_position", self.inner.get_position(symbol)).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, side: Option<PositionSide>) -> ConnectorResult<()> {
        self.guarded("set_leverage", self.inner.set_leverage(symbol, leverage, side)).await
    }

    async fn set_trading_stop(
        &self,
        symbol: &str,
        side: PositionSide,
        take_profit: Option<f64>,
        stop_loss: Option<f64>,
    ) -> ConnectorResult<()> {
        self.guarded(
            "set_trading_stop",
            self.inner.set_trading_stop(symbol, side, take_profit, stop_loss),
        )
        .await
    }

    async fn close_position(&self, symbol: &str) -> ConnectorResult<CloseOutcome> {
        self.guarded("close_position", self.inner.close_position(symbol)).await
    }

    async fn get_funding_rate(&self, symbol: &str) -> ConnectorResult<FundingRateInfo> {
        self.guarded("get_funding_rate", self.inner.get_funding_rate(symbol)).await
    }

    async fn get_funding_history(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<FundingPayment>> {
        self.guarded("get_funding_history", self.inner.get_funding_history(symbol, since))
            .await
    }
}
