//! Funding payment tracking for open hedges
//!
//! History is fetched with no lock held, then folded into the position under its
//! state lock. Each payment carries a dedup key (exchange transaction id, or
//! `symbol:timestamp`) that is remembered on the leg, so overlapping polls never
//! count a payment twice.

use crate::{
    connectors::{ConnectorError, ConnectorResult, Exchange, ExchangeConnector, FundingPayment},
    position::{ArbitragePosition, LegRole, PositionStore},
    utils::metrics,
    Result,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outcome of one funding poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FundingUpdate {
    /// Payments newly folded in
    pub payments_applied: usize,
    /// Sum of the newly applied amounts (positive = received)
    pub amount_applied: f64,
    /// Legs whose history could not be fetched this cycle
    pub warnings: Vec<String>,
    /// The connector errors behind `warnings`
    pub failures: Vec<FundingFailure>,
}

/// One leg's failed history fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FundingFailure {
    /// Leg
    pub role: LegRole,
    /// Exchange of that leg
    pub exchange: Exchange,
    /// Connector error as returned
    pub error: ConnectorError,
}

/// Fold `payments` into one leg, skipping anything already applied
///
/// Payments for another symbol or older than the position's first order are
/// ignored. Returns the amount newly applied.
pub fn apply_payments(position: &mut ArbitragePosition, role: LegRole, payments: &[FundingPayment]) -> f64 {
    let symbol = position.symbol.clone();
    let started_at = position.started_at;

    let mut fresh: Vec<&FundingPayment> = payments
        .iter()
        .filter(|p| p.symbol == symbol)
        .filter(|p| started_at.map_or(true, |started| p.timestamp >= started))
        .collect();
    fresh.sort_by_key(|p| p.timestamp);

    let leg = position.leg_mut(role);
    let mut applied = 0.0;
    for payment in fresh {
        if !leg.applied_funding_ids.insert(payment.dedup_key()) {
            continue;
        }
        leg.funding_earned_total += payment.amount;
        applied += payment.amount;
        if leg.last_funding_time.map_or(true, |last| payment.timestamp >= last) {
            leg.funding_paid = payment.amount;
            leg.last_funding_time = Some(payment.timestamp);
        }
    }

    position.recompute_pnl();
    applied
}

/// Polls both legs' funding history and applies new payments
pub struct FundingTracker {
    connectors: HashMap<Exchange, Arc<dyn ExchangeConnector>>,
    store: Arc<dyn PositionStore>,
    history_overlap: chrono::Duration,
}

impl FundingTracker {
    /// Create a tracker
    pub fn new(
        connectors: HashMap<Exchange, Arc<dyn ExchangeConnector>>,
        store: Arc<dyn PositionStore>,
        history_overlap: chrono::Duration,
    ) -> Self {
        Self {
            connectors,
            store,
            history_overlap,
        }
    }

    async fn fetch(
        &self,
        exchange: Exchange,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<FundingPayment>> {
        let connector = self
            .connectors
            .get(&exchange)
            .ok_or_else(|| ConnectorError::Connection(format!("no connector registered for {}", exchange)))?;
        connector.get_funding_history(symbol, since).await
    }

    /// Fetch and apply new funding payments for one position
    ///
    /// Exchange failures are reported in [`FundingUpdate::warnings`] and leave the
    /// affected leg untouched. Only a persistence failure is an error.
    pub async fn poll(&self, state: &Mutex<ArbitragePosition>) -> Result<FundingUpdate> {
        let (position_id, symbol, primary, hedge, since) = {
            let position = state.lock().await;
            if position.is_terminal() {
                return Ok(FundingUpdate::default());
            }
            let since = match position.last_funding_update {
                Some(last) => Some(last - self.history_overlap),
                None => position.started_at,
            };
            (
                position.position_id.clone(),
                position.symbol.clone(),
                position.primary.exchange,
                position.hedge.exchange,
                since,
            )
        };

        let polled_at = Utc::now();
        let (primary_history, hedge_history) = tokio::join!(
            self.fetch(primary, &symbol, since),
            self.fetch(hedge, &symbol, since)
        );

        let mut update = FundingUpdate::default();
        let mut fetched = Vec::with_capacity(2);
        for (role, exchange, history) in [
            (LegRole::Primary, primary, primary_history),
            (LegRole::Hedge, hedge, hedge_history),
        ] {
            match history {
                Ok(payments) => fetched.push((role, exchange, payments)),
                Err(e) => {
                    warn!(
                        position_id = %position_id,
                        leg = %role,
                        exchange = %exchange,
                        error_kind = e.kind(),
                        transient = e.is_transient(),
                        error = %e,
                        "Funding history unavailable, retrying next cycle"
                    );
                    metrics::record_funding_fetch_failed(exchange, e.kind());
                    update
                        .warnings
                        .push(format!("{} leg on {}: funding history unavailable: {}", role, exchange, e));
                    update.failures.push(FundingFailure {
                        role,
                        exchange,
                        error: e,
                    });
                }
            }
        }

        let mut position = state.lock().await;
        if position.is_terminal() {
            return Ok(update);
        }

        for (role, exchange, payments) in &fetched {
            let before = position.leg(*role).applied_funding_ids.len();
            let amount = apply_payments(&mut position, *role, payments);
            let count = position.leg(*role).applied_funding_ids.len() - before;
            if count > 0 {
                debug!(position_id = %position_id, leg = %role, count, amount, "Funding applied");
                metrics::record_funding_applied(*exchange, amount);
            }
            update.payments_applied += count;
            update.amount_applied += amount;
        }

        if update.warnings.is_empty() {
            position.last_funding_update = Some(polled_at);
        }
        if update.payments_applied > 0 || update.warnings.is_empty() {
            self.store.save_position(&position).await?;
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{PaperConnector, PositionSide};
    use crate::position::{InMemoryPositionStore, OpenPositionRequest, PositionStatus};

    fn active_position() -> ArbitragePosition {
        let request = OpenPositionRequest {
            user_id: "user-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            primary_exchange: Exchange::Bybit,
            hedge_exchange: Exchange::Binance,
            primary_side: PositionSide::Short,
            quantity: 1.0,
            leverage: 3,
            total_parts: Some(1),
            inter_part_delay_ms: None,
        };
        let mut position = ArbitragePosition::new(&request, 1, 0);
        position.transition(PositionStatus::Opening).unwrap();
        position.started_at = Some(Utc::now() - chrono::Duration::hours(1));
        position.primary.apply_fill(1.0, 100.0, 0.0, "p-1");
        position.hedge.apply_fill(1.0, 100.0, 0.0, "h-1");
        position.transition(PositionStatus::Active).unwrap();
        position
    }

    fn payment(id: &str, amount: f64, minutes_ago: i64) -> FundingPayment {
        FundingPayment {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            amount,
            rate: Some(0.0001),
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    fn tracker(
        primary: Arc<PaperConnector>,
        hedge: Arc<PaperConnector>,
        store: Arc<dyn PositionStore>,
    ) -> FundingTracker {
        let mut connectors: HashMap<Exchange, Arc<dyn ExchangeConnector>> = HashMap::new();
        connectors.insert(Exchange::Bybit, primary);
        connectors.insert(Exchange::Binance, hedge);
        FundingTracker::new(connectors, store, chrono::Duration::hours(8))
    }

    #[test]
    fn test_apply_payments_is_idempotent() {
        let mut position = active_position();
        let payments = vec![payment("tx-1", 0.5, 30), payment("tx-2", -0.2, 10)];

        let applied = apply_payments(&mut position, LegRole::Primary, &payments);
        assert!((applied - 0.3).abs() < 1e-12);
        assert_eq!(position.primary.funding_paid, -0.2);
        assert!((position.primary.funding_earned_total - 0.3).abs() < 1e-12);

        assert_eq!(apply_payments(&mut position, LegRole::Primary, &payments), 0.0);
        assert!((position.primary.funding_earned_total - 0.3).abs() < 1e-12);
        assert!((position.net_profit - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_payments_before_start_are_ignored() {
        let mut position = active_position();
        let stale = payment("tx-old", 5.0, 600);
        assert_eq!(apply_payments(&mut position, LegRole::Hedge, &[stale]), 0.0);
        assert!(position.hedge.applied_funding_ids.is_empty());
    }

    #[test]
    fn test_payments_without_id_dedup_by_timestamp() {
        let mut position = active_position();
        let unnamed = payment("", 0.1, 5);
        apply_payments(&mut position, LegRole::Hedge, &[unnamed.clone()]);
        apply_payments(&mut position, LegRole::Hedge, &[unnamed]);
        assert!((position.hedge.funding_earned_total - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_concurrent_polls_apply_once() {
        let primary = Arc::new(PaperConnector::new(Exchange::Bybit));
        let hedge = Arc::new(PaperConnector::new(Exchange::Binance));
        primary.push_funding_payment(payment("bybit-77", 1.25, 5)).await;

        let store: Arc<dyn PositionStore> = Arc::new(InMemoryPositionStore::new());
        let tracker = tracker(primary, hedge, Arc::clone(&store));
        let state = Mutex::new(active_position());

        let (a, b) = tokio::join!(tracker.poll(&state), tracker.poll(&state));
        assert_eq!(a.unwrap().payments_applied + b.unwrap().payments_applied, 1);

        let position = state.lock().await;
        assert!((position.primary.funding_earned_total - 1.25).abs() < 1e-12);
        assert!(position.last_funding_update.is_some());

        let saved = store.load_position(&position.position_id).await.unwrap().unwrap();
        assert!((saved.primary.funding_earned_total - 1.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unavailable_history_is_soft() {
        let primary = Arc::new(PaperConnector::new(Exchange::Bybit));
        let hedge = Arc::new(PaperConnector::new(Exchange::Binance));
        primary.push_funding_payment(payment("bybit-1", 0.4, 5)).await;
        hedge.push_funding_payment(payment("binance-1", -0.3, 5)).await;
        hedge
            .fail_funding_history(Some(ConnectorError::Connection("reset".to_string())))
            .await;

        let store: Arc<dyn PositionStore> = Arc::new(InMemoryPositionStore::new());
        let tracker = tracker(primary, Arc::clone(&hedge), store);
        let state = Mutex::new(active_position());

        let update = tracker.poll(&state).await.unwrap();
        assert_eq!(update.payments_applied, 1);
        assert_eq!(update.warnings.len(), 1);
        assert_eq!(
            update.failures,
            vec![FundingFailure {
                role: LegRole::Hedge,
                exchange: Exchange::Binance,
                error: ConnectorError::Connection("reset".to_string()),
            }]
        );
        assert_eq!(update.failures[0].error.kind(), "connection");
        assert!(update.failures[0].error.is_transient());
        {
            let position = state.lock().await;
            assert_eq!(position.status, PositionStatus::Active);
            assert_eq!(position.hedge.funding_earned_total, 0.0);
            assert!(position.last_funding_update.is_none());
        }

        hedge.fail_funding_history(None).await;
        let update = tracker.poll(&state).await.unwrap();
        assert_eq!(update.payments_applied, 1);
        assert!(update.warnings.is_empty() && update.failures.is_empty());
        let position = state.lock().await;
        assert!((position.total_funding() - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_missing_connector_keeps_error_kind() {
        let primary = Arc::new(PaperConnector::new(Exchange::Bybit));
        let mut connectors: HashMap<Exchange, Arc<dyn ExchangeConnector>> = HashMap::new();
        connectors.insert(Exchange::Bybit, primary);
        let tracker = FundingTracker::new(
            connectors,
            Arc::new(InMemoryPositionStore::new()),
            chrono::Duration::hours(8),
        );
        let state = Mutex::new(active_position());

        let update = tracker.poll(&state).await.unwrap();
        assert_eq!(update.failures.len(), 1);
        assert_eq!(update.failures[0].role, LegRole::Hedge);
        assert!(matches!(update.failures[0].error, ConnectorError::Connection(_)));
    }

    #[tokio::test]
    async fn test_terminal_positions_are_skipped() {
        let primary = Arc::new(PaperConnector::new(Exchange::Bybit));
        primary.push_funding_payment(payment("bybit-1", 0.4, 5)).await;
        let store: Arc<dyn PositionStore> = Arc::new(InMemoryPositionStore::new());
        let tracker = tracker(primary, Arc::new(PaperConnector::new(Exchange::Binance)), store);

        let mut position = active_position();
        position.fail("closed elsewhere").unwrap();
        let state = Mutex::new(position);
        assert_eq!(tracker.poll(&state).await.unwrap(), FundingUpdate::default());
    }
}
