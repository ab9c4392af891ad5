//! Integration tests for graduated-entry arbitrage

mod test_bybit_adapter;
mod test_graduated_entry;
mod test_recovery;
mod test_triangular;

use graduated_arbitrage::{
    config::ArbitrageConfig,
    connectors::{Exchange, ExchangeConnector, PaperConnector, PositionSide},
    notify::{ChannelNotifier, Notification, Notifier},
    position::{InMemoryPositionStore, OpenPositionRequest, PositionStore},
    trading::GraduatedEntryEngine,
};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const SYMBOL: &str = "BTCUSDT";

/// Test utilities for integration tests
pub struct TestUtils;

/// Engine wired to two paper exchanges
pub struct TestRig {
    pub engine: Arc<GraduatedEntryEngine>,
    pub primary: Arc<PaperConnector>,
    pub hedge: Arc<PaperConnector>,
    pub store: Arc<dyn PositionStore>,
    pub notifications: mpsc::Receiver<Notification>,
}

impl TestUtils {
    /// Fast engine settings: no inter-tranche delay, millisecond backoff
    pub fn create_test_config() -> ArbitrageConfig {
        let mut config = ArbitrageConfig::default();
        config.engine.inter_part_delay_ms = 0;
        config.engine.retry_backoff_ms = 1;
        config.engine.max_hedge_retries = 2;
        config.engine.max_close_retries = 2;
        config.engine.call_timeout_ms = 1_000;
        config.engine.monitor_interval_ms = 20;
        config.engine.min_order_quantity = 0.01;
        config.engine.quantity_step = 0.01;
        config.funding.poll_interval_secs = 3_600;
        config
    }

    /// Long primary on Bybit, short hedge on Binance
    pub fn create_request(quantity: f64, parts: u32) -> OpenPositionRequest {
        OpenPositionRequest {
            user_id: "user-1".to_string(),
            symbol: SYMBOL.to_string(),
            primary_exchange: Exchange::Bybit,
            hedge_exchange: Exchange::Binance,
            primary_side: PositionSide::Long,
            quantity,
            leverage: 3,
            total_parts: Some(parts),
            inter_part_delay_ms: None,
        }
    }

    /// Both exchanges priced at `price`
    pub async fn create_paper_exchanges(price: f64) -> (Arc<PaperConnector>, Arc<PaperConnector>) {
        let primary = Arc::new(PaperConnector::new(Exchange::Bybit));
        let hedge = Arc::new(PaperConnector::new(Exchange::Binance));
        primary.set_price(SYMBOL, price).await;
        hedge.set_price(SYMBOL, price).await;
        (primary, hedge)
    }

    pub async fn create_rig_with(config: ArbitrageConfig, store: Arc<dyn PositionStore>) -> TestRig {
        let (primary, hedge) = Self::create_paper_exchanges(100.0).await;
        let (notifier, notifications) = ChannelNotifier::new(64);
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        let connectors: Vec<Arc<dyn ExchangeConnector>> = vec![primary.clone(), hedge.clone()];
        let engine = GraduatedEntryEngine::new(&config, connectors, Arc::clone(&store), notifier).unwrap();
        TestRig {
            engine: Arc::new(engine),
            primary,
            hedge,
            store,
            notifications,
        }
    }

    pub async fn create_rig() -> TestRig {
        Self::create_rig_with(Self::create_test_config(), Arc::new(InMemoryPositionStore::new())).await
    }

    /// Wait for a condition with timeout
    pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout_ms: u64, check_interval_ms: u64) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_millis(timeout_ms);
        let interval = std::time::Duration::from_millis(check_interval_ms);

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            tokio::time::sleep(interval).await;
        }

        false
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
