//! Triangular detection followed by execution on a paper exchange

use super::approx;
use graduated_arbitrage::{
    connectors::{ConnectorError, Exchange, OrderSide, OrderType, PaperConnector},
    notify::{ChannelNotifier, NotificationKind, Notifier},
    strategy::triangular::{CycleDirection, FeeSchedule, TradingPair, TriangleCycle, TriangularDetector},
    trading::{spawn_pipeline, TriangularExecutor, TriangularRunStats, TriangularStatus},
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const START_AMOUNT: f64 = 1_000.0;

fn pair(symbol: &str, base: &str, quote: &str) -> TradingPair {
    TradingPair {
        symbol: symbol.to_string(),
        base_asset: base.to_string(),
        quote_asset: quote.to_string(),
        order_type: OrderType::Market,
    }
}

/// USDT -> BTC -> ETH -> USDT pays ~1% at these prices
async fn setup() -> Result<(Arc<PaperConnector>, TriangularDetector)> {
    let paper = Arc::new(PaperConnector::new(Exchange::Binance));
    paper.set_price("BTCUSDT", 50_000.0).await;
    paper.set_price("ETHBTC", 0.0594).await;
    paper.set_price("ETHUSDT", 3_000.0).await;

    let cycle = TriangleCycle::new(
        "USDT",
        [
            pair("BTCUSDT", "BTC", "USDT"),
            pair("ETHBTC", "ETH", "BTC"),
            pair("ETHUSDT", "ETH", "USDT"),
        ],
    )?;
    let mut detector = TriangularDetector::new(
        Exchange::Binance,
        paper.clone(),
        FeeSchedule { maker: 0.0, taker: 0.0 },
        0.1,
        Duration::from_secs(5),
    );
    detector.add_cycle(cycle);
    Ok((paper, detector))
}

fn executor(paper: &Arc<PaperConnector>, notifier: Arc<dyn Notifier>) -> TriangularExecutor {
    TriangularExecutor::new(
        paper.clone(),
        paper.clone(),
        FeeSchedule { maker: 0.0, taker: 0.0 },
        notifier,
        "user-1",
    )
}

#[tokio::test]
async fn test_detected_cycle_executes_all_three_legs() -> Result<()> {
    let (paper, detector) = setup().await?;
    let (notifier, mut notifications) = ChannelNotifier::new(8);
    let executor = executor(&paper, Arc::new(notifier));

    let mut opportunity = detector.scan().await.into_iter().next().expect("opportunity");
    assert_eq!(opportunity.direction, CycleDirection::Forward);

    let position = executor.execute(&mut opportunity, START_AMOUNT).await?;
    assert_eq!(position.status, TriangularStatus::Completed);
    assert_eq!(position.current_leg, 3);
    assert!(opportunity.was_executed);

    let sides: Vec<OrderSide> = [&position.leg1, &position.leg2, &position.leg3]
        .iter()
        .map(|leg| leg.side)
        .collect();
    assert_eq!(sides, vec![OrderSide::Buy, OrderSide::Buy, OrderSide::Sell]);
    assert!(approx(position.leg1.filled_qty, 0.02));
    // each leg is sized from what the previous one delivered
    assert!(approx(position.leg2.quantity, 0.02 / 0.0594));
    assert!(approx(position.leg3.quantity, position.leg2.filled_qty));

    let final_amount = position.final_amount.unwrap();
    assert!((final_amount - 1_010.101).abs() < 1e-2, "{}", final_amount);
    assert!(position.realized_profit_percent().unwrap() > 1.0);
    assert_eq!(paper.orders().await.len(), 3);

    let delivered = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
        .await?
        .expect("notification");
    assert_eq!(delivered.kind, NotificationKind::TriangularExecuted);

    // an opportunity is consumed by its first execution
    assert!(executor.execute(&mut opportunity, START_AMOUNT).await.is_err());
    assert_eq!(paper.orders().await.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_decayed_opportunity_places_nothing() -> Result<()> {
    let (paper, detector) = setup().await?;
    let (notifier, _notifications) = ChannelNotifier::new(8);
    let executor = executor(&paper, Arc::new(notifier));

    let mut opportunity = detector.scan().await.into_iter().next().expect("opportunity");
    // ETH falls before execution and the loop now loses money
    paper.set_price("ETHUSDT", 2_900.0).await;

    let err = executor.execute(&mut opportunity, START_AMOUNT).await.unwrap_err();
    assert!(err.to_string().contains("no longer profitable"), "{}", err);
    assert!(!opportunity.was_executed);
    assert!(paper.orders().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_second_leg_failure_stops_the_sequence() -> Result<()> {
    let (paper, detector) = setup().await?;
    let (notifier, _notifications) = ChannelNotifier::new(8);
    let executor = executor(&paper, Arc::new(notifier));
    paper
        .fail_orders(1, 1, ConnectorError::InsufficientLiquidity("ETHBTC book empty".to_string()))
        .await;

    let mut opportunity = detector.scan().await.into_iter().next().expect("opportunity");
    let position = executor.execute(&mut opportunity, START_AMOUNT).await?;

    assert_eq!(position.status, TriangularStatus::Error);
    assert_eq!(position.current_leg, 2);
    assert!(position.leg1.order_id.is_some());
    assert!(position.leg2.order_id.is_none());
    assert_eq!(position.leg3.filled_qty, 0.0);
    assert!(position.final_amount.is_none());
    let message = position.error_message.unwrap();
    assert!(message.contains("leg 2 on ETHBTC failed"), "{}", message);
    assert!(message.contains("holding 0.02 BTC"), "{}", message);
    // the BTC bought on leg 1 is left as is
    assert!(approx(paper.position_size("BTCUSDT").await, 0.02));
    assert_eq!(paper.orders().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_expired_opportunity_is_rejected() -> Result<()> {
    let (paper, detector) = setup().await?;
    let (notifier, _notifications) = ChannelNotifier::new(8);
    let executor = executor(&paper, Arc::new(notifier));

    let mut opportunity = detector.scan().await.into_iter().next().expect("opportunity");
    opportunity.expires_at = chrono::Utc::now() - chrono::Duration::milliseconds(1);

    let err = executor.execute(&mut opportunity, START_AMOUNT).await.unwrap_err();
    assert!(err.to_string().contains("expired"), "{}", err);
    assert!(paper.orders().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_spawned_pipeline_executes_detected_cycles() -> Result<()> {
    let (paper, detector) = setup().await?;
    let (notifier, mut notifications) = ChannelNotifier::new(64);
    let executor = executor(&paper, Arc::new(notifier));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (detector_task, executor_task) = spawn_pipeline(detector, executor, START_AMOUNT, shutdown_rx);

    // the first scan runs immediately
    let delivered = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
        .await?
        .expect("notification");
    assert_eq!(delivered.kind, NotificationKind::TriangularExecuted);
    assert!((delivered.payload["final_amount"].as_f64().unwrap() - 1_010.101).abs() < 1e-2);

    shutdown_tx.send_replace(true);
    detector_task.await?;
    let stats = executor_task.await?;
    assert!(stats.completed >= 1, "{:?}", stats);
    assert_eq!(stats.failed, 0);
    assert!(!stats.halted);

    let orders = paper.orders().await;
    assert_eq!(orders.len(), 3 * stats.completed);
    assert_eq!(orders[0].symbol, "BTCUSDT");
    Ok(())
}

#[tokio::test]
async fn test_pipeline_halts_when_an_intermediate_asset_is_held() -> Result<()> {
    let (paper, detector) = setup().await?;
    let (notifier, _notifications) = ChannelNotifier::new(8);
    let executor = executor(&paper, Arc::new(notifier));
    paper
        .fail_orders(1, 1, ConnectorError::InsufficientLiquidity("ETHBTC book empty".to_string()))
        .await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (detector_task, executor_task) = spawn_pipeline(detector, executor, START_AMOUNT, shutdown_rx);
    let stats = tokio::time::timeout(Duration::from_secs(2), executor_task).await??;
    assert_eq!(
        stats,
        TriangularRunStats {
            completed: 0,
            failed: 1,
            skipped: 0,
            halted: true,
        }
    );

    // the detector notices the executor is gone on its next send
    tokio::time::timeout(Duration::from_secs(3), detector_task).await??;
    assert_eq!(paper.orders().await.len(), 1);
    Ok(())
}
