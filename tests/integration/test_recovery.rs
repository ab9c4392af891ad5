//! Restart recovery from the JSON position store

use super::{approx, TestUtils, SYMBOL};
use graduated_arbitrage::{
    position::{
        ArbitragePosition, CloseReason, JsonFilePositionStore, PositionStatus, PositionStore,
    },
    trading::RecoveryReport,
    Result,
};
use std::sync::Arc;

fn persisted(status: PositionStatus, primary_filled: f64, hedge_filled: f64) -> ArbitragePosition {
    let mut position = ArbitragePosition::new(&TestUtils::create_request(0.4, 2), 2, 0);
    if status != PositionStatus::Pending {
        position.transition(PositionStatus::Opening).unwrap();
    }
    if primary_filled > 0.0 {
        position.primary.apply_fill(primary_filled, 100.0, 0.0, "bybit-1");
    }
    if hedge_filled > 0.0 {
        position.hedge.apply_fill(hedge_filled, 100.0, 0.0, "binance-1");
    }
    if status == PositionStatus::Active {
        position.current_part = 2;
        position.transition(PositionStatus::Active).unwrap();
    }
    position
}

#[tokio::test]
async fn test_orphaned_opening_is_reconciled_and_unwound() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn PositionStore> = Arc::new(JsonFilePositionStore::new(dir.path()));
    // the process died after the second primary order filled but before it was recorded
    let orphan = persisted(PositionStatus::Opening, 0.2, 0.2);
    store.save_position(&orphan).await?;

    let rig = TestUtils::create_rig_with(TestUtils::create_test_config(), Arc::clone(&store)).await;
    rig.primary.set_position(SYMBOL, 0.3, 100.0).await;
    rig.hedge.set_position(SYMBOL, -0.2, 100.0).await;

    let report = rig.engine.recover().await?;
    assert_eq!(
        report,
        RecoveryReport {
            resumed: 0,
            unwound: 1,
            failed: 0
        }
    );

    let recovered = store.load_position(&orphan.position_id).await?.unwrap();
    assert_eq!(recovered.status, PositionStatus::Completed);
    assert_eq!(recovered.close_reason, Some(CloseReason::Recovery));
    assert!(approx(recovered.primary.filled_quantity, 0.3));
    assert!(approx(recovered.primary.closed_quantity, 0.3));
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    assert_eq!(rig.hedge.position_size(SYMBOL).await, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_active_position_resumes_monitoring() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn PositionStore> = Arc::new(JsonFilePositionStore::new(dir.path()));
    let active = persisted(PositionStatus::Active, 0.4, 0.4);
    store.save_position(&active).await?;

    let rig = TestUtils::create_rig_with(TestUtils::create_test_config(), Arc::clone(&store)).await;
    rig.primary.set_position(SYMBOL, 0.4, 100.0).await;
    rig.hedge.set_position(SYMBOL, -0.4, 100.0).await;

    let report = rig.engine.recover().await?;
    assert_eq!(report.resumed, 1);
    assert!(rig.engine.has_open_position("user-1", SYMBOL).await);

    // a second pass leaves already-registered positions alone
    assert_eq!(rig.engine.recover().await?, RecoveryReport::default());

    // the resumed monitor still reacts to liquidation danger
    rig.primary.set_price(SYMBOL, 68.0).await;
    let engine = Arc::clone(&rig.engine);
    let id = active.position_id.clone();
    let closed = TestUtils::wait_for_condition(
        || {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            async move { matches!(engine.position(&id).await, Ok(Some(p)) if p.status == PositionStatus::Completed) }
        },
        3_000,
        5,
    )
    .await;
    assert!(closed);

    let stored = store.load_position(&active.position_id).await?.unwrap();
    assert!(stored.emergency_closed);
    assert_eq!(rig.primary.position_size(SYMBOL).await, 0.0);
    rig.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pending_position_fails_on_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn PositionStore> = Arc::new(JsonFilePositionStore::new(dir.path()));
    let pending = persisted(PositionStatus::Pending, 0.0, 0.0);
    store.save_position(&pending).await?;

    let rig = TestUtils::create_rig_with(TestUtils::create_test_config(), Arc::clone(&store)).await;
    let report = rig.engine.recover().await?;
    assert_eq!(report.failed, 1);

    let stored = store.load_position(&pending.position_id).await?.unwrap();
    assert_eq!(stored.status, PositionStatus::Error);
    assert!(rig.primary.orders().await.is_empty());

    rig.engine.delete_position(&pending.position_id).await?;
    assert!(store.load_all_positions().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_terminal_positions_are_not_recovered() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn PositionStore> = Arc::new(JsonFilePositionStore::new(dir.path()));
    let mut done = persisted(PositionStatus::Active, 0.4, 0.4);
    done.transition(PositionStatus::Closing)?;
    done.transition(PositionStatus::Completed)?;
    store.save_position(&done).await?;

    let rig = TestUtils::create_rig_with(TestUtils::create_test_config(), Arc::clone(&store)).await;
    assert_eq!(rig.engine.recover().await?, RecoveryReport::default());
    assert!(rig.engine.positions().await.is_empty());
    Ok(())
}
