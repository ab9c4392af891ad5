//! Integration tests for the graduated-entry engine against paper exchanges

use super::{approx, TestRig, TestUtils, SYMBOL};
use graduated_arbitrage::{
    connectors::{ConnectorError, Exchange, ExchangeConnector},
    notify::{Notification, NotificationKind},
    position::{CloseReason, InMemoryPositionStore, LegRole, PositionStatus},
    trading::{GraduatedEntryEngine, PositionEvent},
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn wait_for_status(engine: &Arc<GraduatedEntryEngine>, position_id: &str, status: PositionStatus) -> bool {
    TestUtils::wait_for_condition(
        || {
            let engine = Arc::clone(engine);
            let position_id = position_id.to_string();
            async move {
                matches!(engine.position(&position_id).await, Ok(Some(p)) if p.status == status)
            }
        },
        3_000,
        5,
    )
    .await
}

async fn wait_for_terminal(engine: &Arc<GraduatedEntryEngine>, position_id: &str) -> bool {
    TestUtils::wait_for_condition(
        || {
            let engine = Arc::clone(engine);
            let position_id = position_id.to_string();
            async move { matches!(engine.position(&position_id).await, Ok(Some(p)) if p.is_terminal()) }
        },
        3_000,
        5,
    )
    .await
}

/// Drain notifications until every kind in `kinds` has arrived, in any order
async fn expect_notifications(rx: &mut mpsc::Receiver<Notification>, kinds: &[NotificationKind]) -> Vec<Notification> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut seen: Vec<Notification> = Vec::new();
    while !kinds.iter().all(|k| seen.iter().any(|n| n.kind == *k)) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(n)) => seen.push(n),
            _ => panic!("expected {:?}, delivered {:?}", kinds, seen.iter().map(|n| n.kind).collect::<Vec<_>>()),
        }
    }
    seen
}

fn drain(rx: &mut mpsc::Receiver<PositionEvent>) -> Vec<PositionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn open_active(rig: &TestRig, quantity: f64, parts: u32) -> Result<String> {
    let position_id = rig.engine.start_position(TestUtils::create_request(quantity, parts)).await?;
    assert!(wait_for_status(&rig.engine, &position_id, PositionStatus::Active).await);
    Ok(position_id)
}

#[tokio::test]
async fn test_full_open_reaches_active() -> Result<()> {
    let mut rig = TestUtils::create_rig().await;
    let position_id = open_active(&rig, 0.3, 3).await?;

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.current_part, 3);
    assert!(approx(position.primary.filled_quantity, 0.3));
    assert!(approx(position.hedge.filled_quantity, 0.3));
    assert_eq!(position.primary.order_ids.len(), 3);
    assert!(position.primary.leverage_applied && position.hedge.leverage_applied);
    assert!(position.primary.trading_stop_applied && position.hedge.trading_stop_applied);

    assert!(approx(rig.primary.position_size(SYMBOL).await, 0.3));
    assert!(approx(rig.hedge.position_size(SYMBOL).await, -0.3));
    assert_eq!(rig.primary.leverage(SYMBOL).await, Some(3));
    assert_eq!(rig.hedge.leverage(SYMBOL).await, Some(3));

    // 5% band, mirrored between the long and the short leg
    let (tp, sl) = rig.primary.trading_stop(SYMBOL).await.unwrap();
    assert!(approx(tp.unwrap(), 105.0) && approx(sl.unwrap(), 95.0));
    let (tp, sl) = rig.hedge.trading_stop(SYMBOL).await.unwrap();
    assert!(approx(tp.unwrap(), 95.0) && approx(sl.unwrap(), 105.0));

    let delivered = expect_notifications(&mut rig.notifications, &[NotificationKind::PositionOpened]).await;
    let opened = delivered.iter().find(|n| n.kind == NotificationKind::PositionOpened).unwrap();
    assert_eq!(opened.payload["position_id"], position_id.as_str());
    assert!(rig.engine.has_open_position("user-1", SYMBOL).await);

    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_opening_publishes_events_in_order() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let handle = rig.engine.create_position(&TestUtils::create_request(0.2, 2)).await?;
    let (_, mut events) = rig.engine.subscribe(handle.position_id())?;

    assert_eq!(rig.engine.open_position(&handle).await?, PositionStatus::Active);

    let events = drain(&mut events);
    let id = handle.position_id().to_string();
    assert_eq!(
        events,
        vec![
            PositionEvent::StatusChanged {
                position_id: id.clone(),
                from: PositionStatus::Pending,
                to: PositionStatus::Opening,
            },
            PositionEvent::TrancheFilled {
                position_id: id.clone(),
                part: 1,
                primary_quantity: 0.1,
                hedge_quantity: 0.1,
            },
            PositionEvent::TrancheFilled {
                position_id: id.clone(),
                part: 2,
                primary_quantity: 0.1,
                hedge_quantity: 0.1,
            },
            PositionEvent::StatusChanged {
                position_id: id,
                from: PositionStatus::Opening,
                to: PositionStatus::Active,
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_hedge_failure_reduces_primary_to_hedge_quantity() -> Result<()> {
    let mut rig = TestUtils::create_rig().await;
    rig.hedge
        .fail_orders(1, 100, ConnectorError::ExchangeRejected("risk limit exceeded".to_string()))
        .await;

    let handle = rig.engine.create_position(&TestUtils::create_request(1.0, 3)).await?;
    assert_eq!(rig.engine.open_position(&handle).await?, PositionStatus::Error);

    let position = handle.snapshot().await;
    assert!(approx(position.primary.filled_quantity, 0.33));
    assert!(approx(position.hedge.filled_quantity, 0.33));
    assert_eq!(position.current_part, 1);
    assert!(position.requires_manual_intervention);
    let message = position.error_message.clone().unwrap();
    assert!(message.contains("tranche 2/3"), "{}", message);
    assert!(message.contains("reduced"), "{}", message);

    assert!(approx(rig.primary.position_size(SYMBOL).await, 0.33));
    assert!(approx(rig.hedge.position_size(SYMBOL).await, -0.33));
    // the reduction is the only reduce-only order on the primary
    let reductions: Vec<_> = rig.primary.orders().await.into_iter().filter(|o| o.reduce_only).collect();
    assert_eq!(reductions.len(), 1);
    assert!(approx(reductions[0].quantity, 0.33));

    expect_notifications(
        &mut rig.notifications,
        &[NotificationKind::LegImbalance, NotificationKind::PositionError],
    )
    .await;

    // exposure was taken, so the position cannot be deleted
    assert!(rig.engine.delete_position(handle.position_id()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_primary_failure_on_first_tranche_fails_cleanly() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    rig.primary
        .fail_orders(0, 1, ConnectorError::InsufficientLiquidity("book empty".to_string()))
        .await;

    let handle = rig.engine.create_position(&TestUtils::create_request(0.3, 3)).await?;
    assert_eq!(rig.engine.open_position(&handle).await?, PositionStatus::Error);

    let position = handle.snapshot().await;
    assert!(position.error_message.unwrap().contains("tranche 1/3"));
    assert!(!position.requires_manual_intervention);
    assert!(rig.hedge.orders().await.is_empty());

    let position_id = handle.position_id().to_string();
    rig.engine.delete_position(&position_id).await?;
    assert!(rig.engine.position(&position_id).await?.is_none());
    assert!(rig.store.load_position(&position_id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_primary_failure_after_exposure_unwinds_both_legs() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    rig.primary
        .fail_orders(1, 1, ConnectorError::InsufficientLiquidity("book empty".to_string()))
        .await;

    let handle = rig.engine.create_position(&TestUtils::create_request(0.3, 3)).await?;
    assert_eq!(rig.engine.open_position(&handle).await?, PositionStatus::Error);

    let position = handle.snapshot().await;
    let message = position.error_message.clone().unwrap();
    assert!(message.contains("tranche 2/3"), "{}", message);
    assert!(message.contains("both legs unwound"), "{}", message);
    assert_eq!(position.close_reason, Some(CloseReason::OpenAborted));
    assert!(!position.requires_manual_intervention);
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);
    assert!(!position.is_deletable());
    Ok(())
}

#[tokio::test]
async fn test_hedge_timeout_is_reconciled_not_resent() -> Result<()> {
    let mut config = TestUtils::create_test_config();
    config.engine.call_timeout_ms = 50;
    let rig = TestUtils::create_rig_with(
        config,
        Arc::new(InMemoryPositionStore::new()),
    )
    .await;
    rig.hedge.set_order_delay(Some(Duration::from_millis(200))).await;

    let handle = rig.engine.create_position(&TestUtils::create_request(0.1, 1)).await?;
    let status = rig.engine.open_position(&handle).await?;
    rig.hedge.set_order_delay(None).await;
    assert_eq!(status, PositionStatus::Active);

    let position = handle.snapshot().await;
    assert!(approx(position.hedge.filled_quantity, 0.1));
    assert!(position.hedge.order_ids.iter().any(|id| id.starts_with("reconciled-")));
    // the slow order filled; nothing else was sent
    assert_eq!(rig.hedge.orders().await.len(), 1);
    assert!(approx(rig.hedge.position_size(SYMBOL).await, -0.1));
    Ok(())
}

#[tokio::test]
async fn test_manual_close_completes() -> Result<()> {
    let mut rig = TestUtils::create_rig().await;
    let position_id = open_active(&rig, 0.3, 3).await?;

    let status = rig.engine.close_position(&position_id, CloseReason::Manual).await?;
    assert_eq!(status, PositionStatus::Completed);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.close_reason, Some(CloseReason::Manual));
    assert!(!position.emergency_closed);
    assert!(approx(position.primary.closed_quantity, 0.3));
    assert!(approx(position.primary.exit_price.unwrap(), 100.0));
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);
    assert!(!rig.engine.has_open_position("user-1", SYMBOL).await);

    expect_notifications(&mut rig.notifications, &[NotificationKind::PositionClosed]).await;

    // closing a terminal position is a no-op
    assert_eq!(
        rig.engine.close_position(&position_id, CloseReason::Manual).await?,
        PositionStatus::Completed
    );
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_take_profit_closes_both_legs() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let position_id = open_active(&rig, 0.3, 1).await?;

    rig.primary.set_price(SYMBOL, 106.0).await;
    rig.hedge.set_price(SYMBOL, 106.0).await;
    assert!(wait_for_status(&rig.engine, &position_id, PositionStatus::Completed).await);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.close_reason, Some(CloseReason::TakeProfit));
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_zero_width_band_leaves_stops_unset() -> Result<()> {
    let mut config = TestUtils::create_test_config();
    config.engine.stop_liquidation_buffer = 0.0;
    let rig = TestUtils::create_rig_with(config, Arc::new(InMemoryPositionStore::new())).await;
    let position_id = open_active(&rig, 0.3, 1).await?;

    // several monitor ticks at the entry price must not close anything
    tokio::time::sleep(Duration::from_millis(150)).await;
    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.status, PositionStatus::Active);
    assert!(position.primary.take_profit.is_none() && position.primary.stop_loss.is_none());
    assert!(position.hedge.take_profit.is_none() && position.hedge.stop_loss.is_none());
    assert!(rig.primary.trading_stop(SYMBOL).await.is_none());
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_liquidation_danger_triggers_emergency_close() -> Result<()> {
    let mut rig = TestUtils::create_rig().await;
    let position_id = open_active(&rig, 0.3, 1).await?;
    let (_, mut events) = rig.engine.subscribe(&position_id)?;

    // long at 100 with 3x liquidates near 67.2; 68 is past the 0.9 threshold
    rig.primary.set_price(SYMBOL, 68.0).await;
    assert!(wait_for_status(&rig.engine, &position_id, PositionStatus::Completed).await);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.close_reason, Some(CloseReason::LiquidationDanger));
    assert!(position.emergency_closed);
    assert!(position.primary.proximity_ratio >= 0.9);
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, PositionEvent::LiquidationWarning { leg, .. } if *leg == LegRole::Primary)));
    assert!(events.iter().any(|e| matches!(
        e,
        PositionEvent::Closed { reason: Some(CloseReason::LiquidationDanger), .. }
    )));

    expect_notifications(
        &mut rig.notifications,
        &[NotificationKind::LiquidationWarning, NotificationKind::EmergencyClose],
    )
    .await;
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_leg_closes_the_other() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let position_id = open_active(&rig, 0.3, 1).await?;

    // hedge liquidated or closed out-of-band
    rig.hedge.close_position(SYMBOL).await?;
    assert!(wait_for_status(&rig.engine, &position_id, PositionStatus::Completed).await);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.close_reason, Some(CloseReason::LegMissing));
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_failure_requires_manual_intervention() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let position_id = open_active(&rig, 0.3, 1).await?;
    rig.primary.fail_next_closes(10).await;

    let status = rig.engine.close_position(&position_id, CloseReason::Manual).await?;
    assert_eq!(status, PositionStatus::Error);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert!(position.requires_manual_intervention);
    let message = position.error_message.unwrap();
    assert!(message.contains("close of primary leg on bybit failed after 3 attempts"), "{}", message);
    assert!(message.contains("manual intervention required"), "{}", message);
    assert!(approx(rig.primary.position_size(SYMBOL).await, 0.3));
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_request_is_honoured_between_tranches() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let mut request = TestUtils::create_request(0.3, 3);
    request.inter_part_delay_ms = Some(500);
    let position_id = rig.engine.start_position(request).await?;

    let engine = Arc::clone(&rig.engine);
    let id = position_id.clone();
    let first_tranche = TestUtils::wait_for_condition(
        || {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { matches!(engine.position(&id).await, Ok(Some(p)) if p.current_part >= 1) }
        },
        2_000,
        5,
    )
    .await;
    assert!(first_tranche);

    let status = rig.engine.close_position(&position_id, CloseReason::Manual).await?;
    assert_eq!(status, PositionStatus::Opening);
    assert!(wait_for_terminal(&rig.engine, &position_id).await);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert_eq!(position.status, PositionStatus::Completed);
    assert_eq!(position.current_part, 1);
    assert_eq!(position.close_reason, Some(CloseReason::Manual));
    assert_eq!(rig.primary.orders().await.iter().filter(|o| !o.reduce_only).count(), 1);
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_close_before_opening_fails_without_orders() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let handle = rig.engine.create_position(&TestUtils::create_request(0.3, 3)).await?;

    let status = rig.engine.close_position(handle.position_id(), CloseReason::Manual).await?;
    assert_eq!(status, PositionStatus::Error);
    assert!(handle.snapshot().await.is_deletable());
    assert!(rig.primary.orders().await.is_empty());

    // a failed position is never opened
    assert!(rig.engine.open_position(&handle).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_funding_is_applied_while_monitoring() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let settled_at = chrono::Utc::now() + chrono::Duration::seconds(1);
    for (paper, id, amount) in [(&rig.primary, "bybit-f1", -0.5), (&rig.hedge, "binance-f1", 0.7)] {
        paper
            .push_funding_payment(graduated_arbitrage::connectors::FundingPayment {
                id: id.to_string(),
                symbol: SYMBOL.to_string(),
                amount,
                rate: Some(0.0001),
                timestamp: settled_at,
            })
            .await;
    }

    let position_id = open_active(&rig, 0.3, 1).await?;
    let engine = Arc::clone(&rig.engine);
    let id = position_id.clone();
    let applied = TestUtils::wait_for_condition(
        || {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move {
                matches!(engine.position(&id).await, Ok(Some(p)) if p.primary.applied_funding_ids.len() == 1
                    && p.hedge.applied_funding_ids.len() == 1)
            }
        },
        2_000,
        5,
    )
    .await;
    assert!(applied);

    let position = rig.engine.position(&position_id).await?.unwrap();
    assert!(approx(position.primary.funding_earned_total, -0.5));
    assert!(approx(position.hedge.funding_earned_total, 0.7));
    assert!(approx(position.total_funding(), 0.2));
    assert!(position.last_funding_update.is_some());
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_request_creates_nothing() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let mut request = TestUtils::create_request(0.3, 3);
    request.hedge_exchange = Exchange::Bybit;

    assert!(rig.engine.start_position(request).await.is_err());
    assert!(rig.engine.positions().await.is_empty());
    assert!(rig.store.load_all_positions().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_subscriptions() -> Result<()> {
    let rig = TestUtils::create_rig().await;
    let handle = rig.engine.create_position(&TestUtils::create_request(0.3, 3)).await?;
    let position_id = handle.position_id();

    let (first, _rx1) = rig.engine.subscribe(position_id)?;
    let (second, _rx2) = rig.engine.subscribe(position_id)?;
    assert_ne!(first, second);
    assert_eq!(handle.subscribers().len(), 2);

    assert!(rig.engine.unsubscribe(position_id, first));
    assert!(!rig.engine.unsubscribe(position_id, first));
    assert!(!rig.engine.unsubscribe("missing", second));
    assert!(rig.engine.subscribe("missing").is_err());
    Ok(())
}
