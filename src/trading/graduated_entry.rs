//! Graduated-entry hedge engine
//!
//! Opens both legs of a cross-exchange hedge tranche by tranche, monitors the
//! hedge while it is active and unwinds both legs on a trigger. Each position is
//! driven by one task. Its state sits behind a per-position mutex that is never
//! held across an exchange call, and every change is persisted before the next
//! dependent exchange call is made.

use super::events::{PositionEvent, Subscribers};
use crate::{
    config::{ArbitrageConfig, EngineConfig},
    connectors::{CloseOutcome, ConnectorError, ConnectorResult, Exchange, ExchangeConnector, GuardedConnector, OrderRequest, PositionSide},
    funding::FundingTracker,
    log_leg, log_position, log_risk,
    notify::{self, NotificationKind, Notifier},
    position::{
        split_tranches, ArbitragePosition, CloseReason, Leg, LegRole, OpenPositionRequest, PositionStatus, PositionStore,
        QUANTITY_EPSILON,
    },
    risk::LiquidationCalculator,
    strategy::PositionLauncher,
    utils::metrics,
    ArbitrageError, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const ROLES: [LegRole; 2] = [LegRole::Primary, LegRole::Hedge];

/// Live state of one position owned by the engine
pub struct PositionHandle {
    position_id: String,
    state: Mutex<ArbitragePosition>,
    close_requested: AtomicBool,
    close_signal: Notify,
    unwinding: AtomicBool,
    order_seq: AtomicU64,
    shutdown: watch::Sender<bool>,
    subscribers: Subscribers,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PositionHandle {
    fn new(position: ArbitragePosition) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            position_id: position.position_id.clone(),
            state: Mutex::new(position),
            close_requested: AtomicBool::new(false),
            close_signal: Notify::new(),
            unwinding: AtomicBool::new(false),
            order_seq: AtomicU64::new(0),
            shutdown,
            subscribers: Subscribers::default(),
            task: Mutex::new(None),
        }
    }

    /// Position id
    pub fn position_id(&self) -> &str {
        &self.position_id
    }

    /// State lock
    pub fn state(&self) -> &Mutex<ArbitragePosition> {
        &self.state
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> ArbitragePosition {
        self.state.lock().await.clone()
    }

    /// A close was requested and not yet honoured
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Event subscribers of this position
    pub fn subscribers(&self) -> &Subscribers {
        &self.subscribers
    }

    fn next_client_order_id(&self, role: LegRole) -> String {
        let seq = self.order_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let prefix: String = self.position_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(12).collect();
        let tag = match role {
            LegRole::Primary => 'p',
            LegRole::Hedge => 'h',
        };
        format!("{}-{}{}", prefix, tag, seq)
    }
}

/// What a position task starts with
#[derive(Debug, Clone, Copy)]
enum Stage {
    Open,
    Monitor,
}

/// Result of a restart recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// ACTIVE positions whose monitoring resumed
    pub resumed: usize,
    /// Orphaned OPENING/CLOSING positions unwound on both legs
    pub unwound: usize,
    /// Positions that ended in ERROR
    pub failed: usize,
}

/// Symmetric TP/SL distance (fraction of entry) applied to both legs
///
/// Starts from `stop_distance_pct` and never uses more than `liquidation_buffer`
/// of either leg's distance to its liquidation price. `None` when the result
/// is not a positive width: zero-width stops would trigger at entry.
pub fn synchronized_band(stop_distance_pct: f64, liquidation_buffer: f64, legs: &[&Leg]) -> Option<f64> {
    let band = legs
        .iter()
        .filter_map(|leg| {
            let liquidation = leg.liquidation_price?;
            (leg.entry_price > 0.0)
                .then(|| (leg.entry_price - liquidation).abs() / leg.entry_price * liquidation_buffer)
        })
        .fold(stop_distance_pct, f64::min);
    (band > 0.0 && band.is_finite()).then_some(band)
}

/// Take-profit and stop-loss for one leg at `band` from its entry
pub fn stop_levels(side: PositionSide, entry_price: f64, band: f64) -> (f64, f64) {
    match side {
        PositionSide::Long => (entry_price * (1.0 + band), entry_price * (1.0 - band)),
        PositionSide::Short => (entry_price * (1.0 - band), entry_price * (1.0 + band)),
    }
}

fn stop_touched(leg: &Leg) -> Option<CloseReason> {
    let price = leg.current_price;
    if price <= 0.0 || leg.open_quantity() <= QUANTITY_EPSILON {
        return None;
    }
    let (tp_hit, sl_hit) = match leg.side {
        PositionSide::Long => (
            leg.take_profit.map_or(false, |tp| price >= tp),
            leg.stop_loss.map_or(false, |sl| price <= sl),
        ),
        PositionSide::Short => (
            leg.take_profit.map_or(false, |tp| price <= tp),
            leg.stop_loss.map_or(false, |sl| price >= sl),
        ),
    };
    if tp_hit {
        Some(CloseReason::TakeProfit)
    } else if sl_hit {
        Some(CloseReason::StopLoss)
    } else {
        None
    }
}

/// Close trigger for an ACTIVE position, in priority order
///
/// Liquidation danger, then TP/SL on either leg, then a leg missing on its
/// exchange, then a manual request.
pub fn evaluate_close_trigger(position: &ArbitragePosition, leg_missing: bool, close_requested: bool) -> Option<CloseReason> {
    if position.primary.in_danger || position.hedge.in_danger {
        return Some(CloseReason::LiquidationDanger);
    }
    if let Some(reason) = stop_touched(&position.primary).or_else(|| stop_touched(&position.hedge)) {
        return Some(reason);
    }
    if leg_missing {
        return Some(CloseReason::LegMissing);
    }
    close_requested.then_some(CloseReason::Manual)
}

/// Opens, monitors and unwinds hedged positions
pub struct GraduatedEntryEngine {
    config: EngineConfig,
    funding_poll_interval: Duration,
    connectors: HashMap<Exchange, Arc<dyn ExchangeConnector>>,
    store: Arc<dyn PositionStore>,
    notifier: Arc<dyn Notifier>,
    calculator: LiquidationCalculator,
    funding: FundingTracker,
    positions: DashMap<String, Arc<PositionHandle>>,
}

impl GraduatedEntryEngine {
    /// Create an engine; each connector is wrapped with the configured timeout
    /// and an in-flight budget shared by every position on that exchange
    pub fn new(
        config: &ArbitrageConfig,
        connectors: Vec<Arc<dyn ExchangeConnector>>,
        store: Arc<dyn PositionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let call_timeout = Duration::from_millis(config.engine.call_timeout_ms);
        let guarded: HashMap<Exchange, Arc<dyn ExchangeConnector>> = connectors
            .into_iter()
            .map(|connector| {
                let exchange = connector.exchange();
                let guarded: Arc<dyn ExchangeConnector> = Arc::new(GuardedConnector::new(
                    connector,
                    call_timeout,
                    config.engine.max_in_flight_requests,
                ));
                (exchange, guarded)
            })
            .collect();

        let calculator = LiquidationCalculator::new(config.liquidation.danger_threshold, config.mmr_overrides()?);
        let funding = FundingTracker::new(
            guarded.clone(),
            Arc::clone(&store),
            chrono::Duration::hours(config.funding.history_overlap_hours),
        );

        Ok(Self {
            config: config.engine.clone(),
            funding_poll_interval: Duration::from_secs(config.funding.poll_interval_secs),
            connectors: guarded,
            store,
            notifier,
            calculator,
            funding,
            positions: DashMap::new(),
        })
    }

    /// Override the funding poll interval
    pub fn with_funding_poll_interval(mut self, interval: Duration) -> Self {
        self.funding_poll_interval = interval;
        self
    }

    fn connector(&self, exchange: Exchange) -> ConnectorResult<Arc<dyn ExchangeConnector>> {
        self.connectors
            .get(&exchange)
            .cloned()
            .ok_or_else(|| ConnectorError::Connection(format!("no connector registered for {}", exchange)))
    }

    fn handle(&self, position_id: &str) -> Result<Arc<PositionHandle>> {
        self.positions
            .get(position_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ArbitrageError::PositionNotFound(position_id.to_string()).into())
    }

    fn handles(&self) -> Vec<Arc<PositionHandle>> {
        self.positions.iter().map(|h| Arc::clone(h.value())).collect()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(1u64 << attempt.min(6)))
    }

    /// Reject a request before anything is created; returns the tranche plan
    pub fn validate_request(&self, request: &OpenPositionRequest) -> Result<Vec<f64>> {
        let invalid = |message: String| -> anyhow::Error { ArbitrageError::Validation(message).into() };

        if request.user_id.trim().is_empty() {
            return Err(invalid("user id cannot be empty".to_string()));
        }
        if request.symbol.is_empty() || !request.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid(format!("invalid symbol '{}'", request.symbol)));
        }
        if request.primary_exchange == request.hedge_exchange {
            return Err(invalid(format!(
                "primary and hedge legs must be on different exchanges, both are {}",
                request.primary_exchange
            )));
        }
        for exchange in [request.primary_exchange, request.hedge_exchange] {
            if !self.connectors.contains_key(&exchange) {
                return Err(invalid(format!("no connector registered for {}", exchange)));
            }
        }
        if !request.quantity.is_finite() || request.quantity <= 0.0 {
            return Err(invalid(format!("quantity must be positive, got {}", request.quantity)));
        }
        if request.quantity < self.config.min_order_quantity {
            return Err(invalid(format!(
                "quantity {} below minimum order quantity {}",
                request.quantity, self.config.min_order_quantity
            )));
        }
        if request.leverage == 0 || request.leverage > self.config.max_leverage {
            return Err(invalid(format!(
                "leverage {} outside allowed range 1..={}",
                request.leverage, self.config.max_leverage
            )));
        }

        let parts = request.total_parts.unwrap_or(self.config.default_total_parts);
        let tranches = split_tranches(request.quantity, parts, self.config.quantity_step)?;
        if let Some(smallest) = tranches.iter().copied().reduce(f64::min) {
            if smallest < self.config.min_order_quantity {
                return Err(invalid(format!(
                    "tranche {} below minimum order quantity {}; use fewer parts",
                    smallest, self.config.min_order_quantity
                )));
            }
        }
        Ok(tranches)
    }

    /// Validate and persist a new PENDING position
    pub async fn create_position(&self, request: &OpenPositionRequest) -> Result<Arc<PositionHandle>> {
        self.validate_request(request)?;

        let parts = request.total_parts.unwrap_or(self.config.default_total_parts);
        let delay = request.inter_part_delay_ms.unwrap_or(self.config.inter_part_delay_ms);
        let position = ArbitragePosition::new(request, parts, delay);
        self.store.save_position(&position).await?;
        log_position!(info, position, user_id = %position.user_id, quantity = request.quantity, "Position created");

        let handle = Arc::new(PositionHandle::new(position));
        self.positions.insert(handle.position_id.clone(), Arc::clone(&handle));
        metrics::record_tracked_positions(self.positions.len());
        Ok(handle)
    }

    /// Create a position and drive it (open, then monitor) on its own task
    pub async fn start_position(self: &Arc<Self>, request: OpenPositionRequest) -> Result<String> {
        let handle = self.create_position(&request).await?;
        let position_id = handle.position_id.clone();
        self.spawn(handle, Stage::Open).await;
        Ok(position_id)
    }

    async fn spawn(self: &Arc<Self>, handle: Arc<PositionHandle>, stage: Stage) {
        let engine = Arc::clone(self);
        let task_handle = Arc::clone(&handle);
        let task = tokio::spawn(async move { engine.drive(task_handle, stage).await });
        *handle.task.lock().await = Some(task);
    }

    async fn drive(self: Arc<Self>, handle: Arc<PositionHandle>, stage: Stage) {
        let result = match stage {
            Stage::Open => match self.open_position(&handle).await {
                Ok(PositionStatus::Active) => self.monitor(&handle).await,
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
            Stage::Monitor => self.monitor(&handle).await,
        };
        if let Err(e) = result {
            error!(position_id = %handle.position_id, error = %e, "Position task failed");
        }
    }

    async fn set_status(
        &self,
        handle: &PositionHandle,
        position: &mut ArbitragePosition,
        next: PositionStatus,
    ) -> Result<()> {
        let from = position.status;
        position.transition(next)?;
        self.store.save_position(position).await?;
        log_position!(info, position, from = %from, "Status changed");
        handle.subscribers.publish(PositionEvent::StatusChanged {
            position_id: position.position_id.clone(),
            from,
            to: next,
        });
        Ok(())
    }

    async fn fail_locked(
        &self,
        handle: &PositionHandle,
        position: &mut ArbitragePosition,
        message: String,
    ) -> Result<PositionStatus> {
        let from = position.status;
        position.fail(message.clone())?;
        position.recompute_pnl();
        self.store.save_position(position).await?;
        log_position!(
            error,
            position,
            error = %message,
            manual_intervention = position.requires_manual_intervention,
            "Position failed"
        );

        handle.subscribers.publish(PositionEvent::StatusChanged {
            position_id: position.position_id.clone(),
            from,
            to: PositionStatus::Error,
        });
        handle.subscribers.publish(PositionEvent::Error {
            position_id: position.position_id.clone(),
            message: message.clone(),
        });
        notify::dispatch(
            &self.notifier,
            &position.user_id,
            NotificationKind::PositionError,
            json!({
                "position_id": position.position_id,
                "symbol": position.symbol,
                "message": message,
                "requires_manual_intervention": position.requires_manual_intervention,
            }),
        );
        Ok(PositionStatus::Error)
    }

    async fn fail(&self, handle: &PositionHandle, message: String) -> Result<PositionStatus> {
        let mut position = handle.state.lock().await;
        self.fail_locked(handle, &mut position, message).await
    }

    /// Place an opening order on one leg and fold the fill in
    ///
    /// The outer error is a persistence failure; the inner one is the exchange outcome.
    async fn place_leg(&self, handle: &PositionHandle, role: LegRole, quantity: f64) -> Result<ConnectorResult<f64>> {
        let (exchange, symbol, side) = {
            let position = handle.state.lock().await;
            let leg = position.leg(role);
            (leg.exchange, position.symbol.clone(), leg.side)
        };
        let connector = match self.connector(exchange) {
            Ok(connector) => connector,
            Err(e) => return Ok(Err(e)),
        };

        let order = OrderRequest::market(symbol, side.opening_side(), quantity)
            .with_client_order_id(handle.next_client_order_id(role));
        let fill = match connector.place_order(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                log_leg!(warn, handle.position_id, role, exchange, order.side, quantity, 0.0, error = %e, "Leg order failed");
                return Ok(Err(e));
            }
        };

        let mut position = handle.state.lock().await;
        let accepted = position
            .leg_mut(role)
            .apply_fill(fill.filled_quantity, fill.average_price, fill.fee, &fill.order_id);
        position.recompute_pnl();
        self.store.save_position(&position).await?;
        log_leg!(
            info,
            handle.position_id,
            role,
            exchange,
            order.side,
            accepted,
            fill.average_price,
            order_id = %fill.order_id,
            requested = quantity,
            "Leg filled"
        );
        Ok(Ok(accepted))
    }

    /// Align a leg's open quantity with what its exchange reports
    ///
    /// Returns the signed adjustment applied to the local fill.
    async fn reconcile_leg(&self, handle: &PositionHandle, role: LegRole) -> Result<ConnectorResult<f64>> {
        let (exchange, symbol, side) = {
            let position = handle.state.lock().await;
            let leg = position.leg(role);
            (leg.exchange, position.symbol.clone(), leg.side)
        };
        let snapshot = match self.connector(exchange) {
            Ok(connector) => match connector.get_position(&symbol).await {
                Ok(snapshot) => snapshot,
                Err(e) => return Ok(Err(e)),
            },
            Err(e) => return Ok(Err(e)),
        };
        let (exchange_size, exchange_entry, mark) = match &snapshot {
            Some(s) if s.side == side => (s.size, s.entry_price, s.mark_price),
            Some(s) => (0.0, 0.0, s.mark_price),
            None => (0.0, 0.0, 0.0),
        };

        let mut position = handle.state.lock().await;
        let leg = position.leg_mut(role);
        let local = leg.open_quantity();
        let diff = exchange_size - local;
        if diff.abs() <= QUANTITY_EPSILON {
            return Ok(Ok(0.0));
        }

        let order_id = format!("reconciled-{}-{}", exchange, leg.order_ids.len() + 1);
        let applied = if diff > 0.0 {
            // price implied by the exchange's average entry
            let implied = (exchange_entry * exchange_size - leg.entry_price * local) / diff;
            let price = if implied.is_finite() && implied > 0.0 { implied } else { mark.max(leg.entry_price) };
            leg.apply_fill(diff, price, 0.0, &order_id)
        } else {
            let price = if mark > 0.0 { mark } else { leg.current_price };
            -leg.reduce_fill(-diff, price, 0.0, &order_id)
        };
        warn!(
            position_id = %handle.position_id,
            leg = %role,
            exchange = %exchange,
            local,
            exchange_size,
            applied,
            "Leg reconciled against exchange position"
        );
        position.recompute_pnl();
        self.store.save_position(&position).await?;
        Ok(Ok(applied))
    }

    async fn apply_leverage(&self, handle: &PositionHandle) -> Result<ConnectorResult<()>> {
        for role in ROLES {
            let (exchange, symbol, side, leverage, applied) = {
                let position = handle.state.lock().await;
                let leg = position.leg(role);
                (leg.exchange, position.symbol.clone(), leg.side, leg.leverage, leg.leverage_applied)
            };
            if applied {
                continue;
            }
            let connector = match self.connector(exchange) {
                Ok(connector) => connector,
                Err(e) => return Ok(Err(e)),
            };

            let mut outcome = Ok(());
            for attempt in 0..=self.config.max_hedge_retries {
                if attempt > 0 {
                    tokio::time::sleep(self.backoff(attempt - 1)).await;
                }
                outcome = connector.set_leverage(&symbol, leverage, Some(side)).await;
                match &outcome {
                    Ok(()) => break,
                    Err(e) if e.is_transient() => {
                        warn!(position_id = %handle.position_id, exchange = %exchange, attempt, error = %e, "Set leverage failed, retrying");
                    }
                    Err(_) => break,
                }
            }
            if let Err(e) = outcome {
                return Ok(Err(e));
            }

            let mut position = handle.state.lock().await;
            position.leg_mut(role).leverage_applied = true;
            self.store.save_position(&position).await?;
        }
        Ok(Ok(()))
    }

    /// Run the tranche loop on a PENDING position
    ///
    /// Trading failures are recorded on the position and reflected in the
    /// returned status; only persistence or lifecycle errors are returned as `Err`.
    pub async fn open_position(&self, handle: &PositionHandle) -> Result<PositionStatus> {
        let (tranches, delay) = {
            let mut position = handle.state.lock().await;
            if position.status != PositionStatus::Pending {
                return Err(ArbitrageError::Trading(format!(
                    "position {} is {}, only PENDING positions can be opened",
                    position.position_id, position.status
                ))
                .into());
            }
            let tranches = split_tranches(
                position.primary.planned_quantity,
                position.total_parts,
                self.config.quantity_step,
            )?;
            self.set_status(handle, &mut position, PositionStatus::Opening).await?;
            (tranches, Duration::from_millis(position.inter_part_delay_ms))
        };

        if let Err(e) = self.apply_leverage(handle).await? {
            return self
                .fail(handle, format!("leverage could not be set before opening: {}", e))
                .await;
        }

        let total = tranches.len() as u32;
        for (index, planned) in tranches.iter().enumerate() {
            let part = index as u32 + 1;
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = handle.close_signal.notified() => {}
                }
            }
            if handle.close_requested() {
                return self.close_during_opening(handle).await;
            }

            let quantity = {
                let position = handle.state.lock().await;
                if part == total {
                    position.primary.remaining()
                } else {
                    planned.min(position.primary.remaining())
                }
            };
            if quantity <= QUANTITY_EPSILON {
                continue;
            }

            // primary first; the hedge is sized to what the primary actually filled
            let primary_filled = match self.place_leg(handle, LegRole::Primary, quantity).await? {
                Ok(filled) if filled > QUANTITY_EPSILON => filled,
                Ok(_) => {
                    return self
                        .primary_failed(handle, part, total, "order filled nothing".to_string(), false)
                        .await
                }
                Err(e) if e.is_unknown_outcome() => match self.reconcile_with_retries(handle, LegRole::Primary).await? {
                    Ok(found) if found > QUANTITY_EPSILON => found,
                    Ok(_) => {
                        return self
                            .primary_failed(handle, part, total, format!("{}; no fill found on the exchange", e), false)
                            .await
                    }
                    Err(re) => {
                        return self
                            .primary_failed(
                                handle,
                                part,
                                total,
                                format!("{}; fill state unknown, reconciliation failed: {}", e, re),
                                true,
                            )
                            .await
                    }
                },
                Err(e) => return self.primary_failed(handle, part, total, e.to_string(), false).await,
            };

            let (hedge_filled, hedge_error) = self.hedge_tranche(handle, primary_filled).await?;
            if primary_filled - hedge_filled > QUANTITY_EPSILON {
                return self.correct_imbalance(handle, part, total, hedge_error).await;
            }

            {
                let mut position = handle.state.lock().await;
                position.current_part = part;
                position.primary.parts_filled += 1;
                position.hedge.parts_filled += 1;
                position.recompute_pnl();
                self.store.save_position(&position).await?;
                log_position!(
                    info,
                    position,
                    primary_quantity = primary_filled,
                    hedge_quantity = hedge_filled,
                    "Tranche confirmed on both legs"
                );
                handle.subscribers.publish(PositionEvent::TrancheFilled {
                    position_id: position.position_id.clone(),
                    part,
                    primary_quantity: primary_filled,
                    hedge_quantity: hedge_filled,
                });
                metrics::record_tranche_filled(position.primary.exchange, position.hedge.exchange);
            }
        }

        if handle.close_requested() {
            return self.close_during_opening(handle).await;
        }
        if let Err(e) = self.apply_leverage(handle).await? {
            warn!(position_id = %handle.position_id, error = %e, "Leverage not confirmed on both legs");
        }
        self.apply_trading_stops(handle).await?;

        let mut position = handle.state.lock().await;
        self.set_status(handle, &mut position, PositionStatus::Active).await?;
        notify::dispatch(
            &self.notifier,
            &position.user_id,
            NotificationKind::PositionOpened,
            json!({
                "position_id": position.position_id,
                "symbol": position.symbol,
                "primary_exchange": position.primary.exchange,
                "hedge_exchange": position.hedge.exchange,
                "quantity": position.primary.filled_quantity,
                "primary_entry": position.primary.entry_price,
                "hedge_entry": position.hedge.entry_price,
            }),
        );
        Ok(PositionStatus::Active)
    }

    async fn reconcile_with_retries(&self, handle: &PositionHandle, role: LegRole) -> Result<ConnectorResult<f64>> {
        let mut outcome = Ok(0.0);
        for attempt in 0..=self.config.max_hedge_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }
            outcome = self.reconcile_leg(handle, role).await?;
            if outcome.is_ok() {
                break;
            }
        }
        Ok(outcome)
    }

    /// Fill `target` on the hedge with bounded retries
    ///
    /// A timed-out order is reconciled against the exchange before anything is
    /// re-sent. Returns the quantity filled and the last failure.
    async fn hedge_tranche(&self, handle: &PositionHandle, target: f64) -> Result<(f64, Option<ConnectorError>)> {
        let mut filled = 0.0;
        let mut last_error = None;
        let mut unknown_outcome = false;

        for attempt in 0..=self.config.max_hedge_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }
            if unknown_outcome {
                match self.reconcile_leg(handle, LegRole::Hedge).await? {
                    Ok(found) => {
                        filled += found.max(0.0);
                        unknown_outcome = false;
                    }
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                }
                if target - filled <= QUANTITY_EPSILON {
                    break;
                }
            }

            let remaining = target - filled;
            match self.place_leg(handle, LegRole::Hedge, remaining).await? {
                Ok(accepted) => {
                    filled += accepted;
                    if target - filled <= QUANTITY_EPSILON {
                        break;
                    }
                    last_error = Some(ConnectorError::InsufficientLiquidity(format!(
                        "partial fill {} of {}",
                        accepted, remaining
                    )));
                }
                Err(e) => {
                    unknown_outcome = e.is_unknown_outcome();
                    last_error = Some(e);
                }
            }
        }

        if unknown_outcome {
            if let Ok(found) = self.reconcile_leg(handle, LegRole::Hedge).await? {
                filled += found.max(0.0);
            }
        }
        Ok((filled, last_error))
    }

    /// The primary leg of tranche `part` failed
    ///
    /// With nothing executed (and the fill state known) the position simply
    /// fails. Otherwise both legs are unwound before failing.
    async fn primary_failed(
        &self,
        handle: &PositionHandle,
        part: u32,
        total: u32,
        detail: String,
        state_unknown: bool,
    ) -> Result<PositionStatus> {
        let (exchange, exposed) = {
            let position = handle.state.lock().await;
            (
                position.primary.exchange,
                position.primary.filled_quantity > QUANTITY_EPSILON || position.hedge.filled_quantity > QUANTITY_EPSILON,
            )
        };
        let message = format!("primary leg on {} failed on tranche {}/{}: {}", exchange, part, total, detail);
        if exposed || state_unknown {
            self.unwind(handle, CloseReason::OpenAborted, Some(message)).await
        } else {
            self.fail(handle, message).await
        }
    }

    /// Hedge retries are exhausted: cut the primary back to the hedge quantity and fail
    async fn correct_imbalance(
        &self,
        handle: &PositionHandle,
        part: u32,
        total: u32,
        hedge_error: Option<ConnectorError>,
    ) -> Result<PositionStatus> {
        let (user_id, symbol, primary_exchange, primary_side, hedge_exchange, excess) = {
            let position = handle.state.lock().await;
            (
                position.user_id.clone(),
                position.symbol.clone(),
                position.primary.exchange,
                position.primary.side,
                position.hedge.exchange,
                position.imbalance(),
            )
        };
        error!(
            position_id = %handle.position_id,
            primary = %primary_exchange,
            hedge = %hedge_exchange,
            excess,
            "Leg imbalance, reducing primary leg"
        );
        metrics::record_leg_imbalance(hedge_exchange);
        notify::dispatch(
            &self.notifier,
            &user_id,
            NotificationKind::LegImbalance,
            json!({ "position_id": handle.position_id, "symbol": symbol, "excess": excess }),
        );

        let mut reduction_error: Option<ConnectorError> = None;
        match self.connector(primary_exchange) {
            Ok(connector) => {
                for attempt in 0..=self.config.max_close_retries {
                    if attempt > 0 {
                        tokio::time::sleep(self.backoff(attempt - 1)).await;
                    }
                    let remaining = handle.state.lock().await.imbalance();
                    if remaining <= QUANTITY_EPSILON {
                        break;
                    }
                    let order = OrderRequest::market(symbol.clone(), primary_side.closing_side(), remaining)
                        .reduce_only()
                        .with_client_order_id(handle.next_client_order_id(LegRole::Primary));
                    match connector.place_order(&order).await {
                        Ok(fill) => {
                            let mut position = handle.state.lock().await;
                            let reduced = position.primary.reduce_fill(
                                fill.filled_quantity,
                                fill.average_price,
                                fill.fee,
                                &fill.order_id,
                            );
                            position.recompute_pnl();
                            self.store.save_position(&position).await?;
                            log_leg!(
                                warn,
                                handle.position_id,
                                LegRole::Primary,
                                primary_exchange,
                                order.side,
                                reduced,
                                fill.average_price,
                                order_id = %fill.order_id,
                                "Primary leg reduced to match hedge"
                            );
                            reduction_error = None;
                        }
                        Err(e) => {
                            if e.is_unknown_outcome() {
                                if let Err(re) = self.reconcile_leg(handle, LegRole::Primary).await? {
                                    warn!(position_id = %handle.position_id, error = %re, "Primary reconciliation failed");
                                }
                            }
                            reduction_error = Some(e);
                        }
                    }
                }
            }
            Err(e) => reduction_error = Some(e),
        }

        let mut position = handle.state.lock().await;
        let residual = position.imbalance();
        let hedge_failure = hedge_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        let mut message = format!(
            "hedge leg on {} failed on tranche {}/{} after {} attempts: {}",
            hedge_exchange,
            part,
            total,
            self.config.max_hedge_retries + 1,
            hedge_failure
        );
        if residual <= QUANTITY_EPSILON {
            message.push_str(&format!(
                "; primary leg on {} reduced by {} to match hedge quantity {}",
                primary_exchange, excess, position.hedge.filled_quantity
            ));
        } else {
            let cause = reduction_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
            message.push_str(&format!(
                "; primary leg on {} still exceeds hedge by {} after reduction failed: {}",
                primary_exchange, residual, cause
            ));
        }
        if position.hedge.filled_quantity > QUANTITY_EPSILON || residual > QUANTITY_EPSILON {
            position.requires_manual_intervention = true;
            message.push_str(&format!(
                "; {} remains open on {} and {}, manual intervention required",
                position.hedge.filled_quantity, primary_exchange, hedge_exchange
            ));
        }
        self.fail_locked(handle, &mut position, message).await
    }

    async fn close_during_opening(&self, handle: &PositionHandle) -> Result<PositionStatus> {
        let executed = {
            let position = handle.state.lock().await;
            position.primary.filled_quantity > QUANTITY_EPSILON || position.hedge.filled_quantity > QUANTITY_EPSILON
        };
        if executed {
            info!(position_id = %handle.position_id, "Honouring close request between tranches");
            self.unwind(handle, CloseReason::Manual, None).await
        } else {
            let mut position = handle.state.lock().await;
            position.close_reason = Some(CloseReason::Manual);
            self.fail_locked(handle, &mut position, "closed before any order was filled".to_string())
                .await
        }
    }

    async fn apply_trading_stops(&self, handle: &PositionHandle) -> Result<()> {
        let targets = {
            let mut position = handle.state.lock().await;
            for role in ROLES {
                let leg = position.leg_mut(role);
                if leg.entry_price <= 0.0 {
                    continue;
                }
                match self.calculator.liquidation_price(leg.entry_price, leg.leverage, leg.side, leg.exchange) {
                    Ok(estimate) => leg.liquidation_price = Some(estimate.liquidation_price),
                    Err(e) => warn!(leg = %role, error = %e, "Liquidation estimate unavailable"),
                }
            }

            let Some(band) = synchronized_band(
                self.config.stop_distance_pct,
                self.config.stop_liquidation_buffer,
                &[&position.primary, &position.hedge],
            ) else {
                log_position!(
                    warn,
                    position,
                    stop_distance_pct = self.config.stop_distance_pct,
                    buffer = self.config.stop_liquidation_buffer,
                    "No usable TP/SL band; stops left unset"
                );
                self.store.save_position(&position).await?;
                return Ok(());
            };
            for role in ROLES {
                let leg = position.leg_mut(role);
                if leg.entry_price > 0.0 {
                    let (tp, sl) = stop_levels(leg.side, leg.entry_price, band);
                    leg.take_profit = Some(tp);
                    leg.stop_loss = Some(sl);
                }
            }

            // combined P&L when the common price moves by the band in either direction
            let pnl_at = |direction: f64| -> f64 {
                [&position.primary, &position.hedge]
                    .iter()
                    .map(|leg| leg.entry_price * band * direction * leg.open_quantity() * leg.side.direction())
                    .sum()
            };
            log_position!(
                info,
                position,
                band,
                pnl_up = pnl_at(1.0),
                pnl_down = pnl_at(-1.0),
                "Synchronized TP/SL computed"
            );
            self.store.save_position(&position).await?;

            ROLES
                .iter()
                .map(|&role| {
                    let leg = position.leg(role);
                    (role, leg.exchange, leg.side, leg.take_profit, leg.stop_loss)
                })
                .collect::<Vec<_>>()
        };

        let symbol = handle.state.lock().await.symbol.clone();
        for (role, exchange, side, tp, sl) in targets {
            let result = match self.connector(exchange) {
                Ok(connector) => connector.set_trading_stop(&symbol, side, tp, sl).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    let mut position = handle.state.lock().await;
                    position.leg_mut(role).trading_stop_applied = true;
                    self.store.save_position(&position).await?;
                }
                Err(e) => {
                    // the monitor still enforces the levels
                    warn!(position_id = %handle.position_id, leg = %role, exchange = %exchange, error = %e, "Exchange TP/SL not set");
                }
            }
        }
        Ok(())
    }

    /// Refresh prices and liquidation proximity and evaluate close triggers
    pub async fn monitor_tick(&self, handle: &PositionHandle) -> Result<Option<CloseReason>> {
        let (symbol, exchanges) = {
            let position = handle.state.lock().await;
            if position.status != PositionStatus::Active {
                return Ok(None);
            }
            (position.symbol.clone(), [position.primary.exchange, position.hedge.exchange])
        };

        let query = |exchange: Exchange| {
            let symbol = symbol.clone();
            async move {
                match self.connector(exchange) {
                    Ok(connector) => connector.get_position(&symbol).await,
                    Err(e) => Err(e),
                }
            }
        };
        let (primary, hedge) = tokio::join!(query(exchanges[0]), query(exchanges[1]));

        let mut position = handle.state.lock().await;
        if position.status != PositionStatus::Active {
            return Ok(None);
        }
        let mut leg_missing = false;
        for (role, observed) in [(LegRole::Primary, primary), (LegRole::Hedge, hedge)] {
            let leg = position.leg_mut(role);
            match observed {
                Ok(Some(snapshot)) if snapshot.side == leg.side && snapshot.size > QUANTITY_EPSILON => {
                    if snapshot.mark_price > 0.0 {
                        leg.current_price = snapshot.mark_price;
                    }
                }
                Ok(_) => {
                    warn!(position_id = %handle.position_id, leg = %role, exchange = %leg.exchange, "Leg missing on exchange");
                    leg_missing = true;
                    continue;
                }
                Err(e) => {
                    warn!(position_id = %handle.position_id, leg = %role, exchange = %leg.exchange, error = %e, "Leg refresh failed");
                    continue;
                }
            }

            if let Ok(estimate) = self.calculator.liquidation_price(leg.entry_price, leg.leverage, leg.side, leg.exchange) {
                leg.liquidation_price = Some(estimate.liquidation_price);
                let proximity = self
                    .calculator
                    .proximity(estimate.liquidation_price, leg.entry_price, leg.current_price, leg.side);
                let was_in_danger = leg.in_danger;
                leg.proximity_ratio = proximity.proximity_ratio;
                leg.in_danger = proximity.is_in_danger;
                metrics::record_proximity(leg.exchange, role, proximity.proximity_ratio);

                if proximity.is_in_danger && !was_in_danger {
                    log_risk!(
                        warn,
                        "liquidation_proximity",
                        proximity.proximity_ratio,
                        self.calculator.danger_threshold(),
                        position_id = %handle.position_id,
                        leg = %role,
                        exchange = %leg.exchange,
                        "Leg within danger threshold of liquidation"
                    );
                    handle.subscribers.publish(PositionEvent::LiquidationWarning {
                        position_id: handle.position_id.clone(),
                        leg: role,
                        proximity_ratio: proximity.proximity_ratio,
                    });
                }
            }
        }

        position.last_liquidation_check = Some(Utc::now());
        position.recompute_pnl();
        self.store.save_position(&position).await?;

        let trigger = evaluate_close_trigger(&position, leg_missing, handle.close_requested());
        if trigger == Some(CloseReason::LiquidationDanger) {
            notify::dispatch(
                &self.notifier,
                &position.user_id,
                NotificationKind::LiquidationWarning,
                json!({
                    "position_id": position.position_id,
                    "primary_proximity": position.primary.proximity_ratio,
                    "hedge_proximity": position.hedge.proximity_ratio,
                }),
            );
        }
        Ok(trigger)
    }

    async fn poll_funding(&self, handle: &PositionHandle) {
        match self.funding.poll(&handle.state).await {
            Ok(update) if update.payments_applied > 0 => {
                handle.subscribers.publish(PositionEvent::FundingApplied {
                    position_id: handle.position_id.clone(),
                    payments: update.payments_applied,
                    amount: update.amount_applied,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(position_id = %handle.position_id, error = %e, "Funding update not persisted"),
        }
    }

    async fn monitor(&self, handle: &Arc<PositionHandle>) -> Result<()> {
        enum Tick {
            Risk,
            Funding,
        }

        let mut shutdown = handle.shutdown.subscribe();
        let mut risk = tokio::time::interval(Duration::from_millis(self.config.monitor_interval_ms));
        risk.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut funding = tokio::time::interval(self.funding_poll_interval);
        funding.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(position_id = %handle.position_id, "Monitoring started");

        loop {
            if *shutdown.borrow() {
                info!(position_id = %handle.position_id, "Monitoring stopped");
                return Ok(());
            }
            // tick bodies run outside the select so a shutdown never cancels an exchange call
            let tick = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                _ = handle.close_signal.notified() => Tick::Risk,
                _ = risk.tick() => Tick::Risk,
                _ = funding.tick() => Tick::Funding,
            };

            match tick {
                Tick::Funding => self.poll_funding(handle).await,
                Tick::Risk => match self.monitor_tick(handle).await {
                    Ok(Some(reason)) => {
                        self.unwind(handle, reason, None).await?;
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(position_id = %handle.position_id, error = %e, "Monitor tick failed"),
                },
            }

            if handle.state.lock().await.is_terminal() {
                return Ok(());
            }
        }
    }

    /// Close one leg with bounded retries
    async fn close_leg(&self, handle: &PositionHandle, role: LegRole) -> Result<ConnectorResult<()>> {
        let (exchange, symbol) = {
            let position = handle.state.lock().await;
            (position.leg(role).exchange, position.symbol.clone())
        };
        let connector = match self.connector(exchange) {
            Ok(connector) => connector,
            Err(e) => return Ok(Err(e)),
        };

        let mut last_error = ConnectorError::Connection("close not attempted".to_string());
        for attempt in 0..=self.config.max_close_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }
            match connector.close_position(&symbol).await {
                Ok(outcome) => {
                    let mut position = handle.state.lock().await;
                    let leg = position.leg_mut(role);
                    match outcome {
                        CloseOutcome::Closed(fill) => {
                            leg.record_exit(fill.filled_quantity, fill.average_price, fill.fee, &fill.order_id);
                            log_leg!(
                                info,
                                handle.position_id,
                                role,
                                exchange,
                                leg.side.closing_side(),
                                fill.filled_quantity,
                                fill.average_price,
                                order_id = %fill.order_id,
                                "Leg closed"
                            );
                        }
                        CloseOutcome::NoPosition => {
                            if leg.open_quantity() > QUANTITY_EPSILON {
                                warn!(
                                    position_id = %handle.position_id,
                                    leg = %role,
                                    exchange = %exchange,
                                    open = leg.open_quantity(),
                                    "Exchange reports no position for an open leg"
                                );
                            }
                        }
                    }
                    leg.mark_flat();
                    position.recompute_pnl();
                    self.store.save_position(&position).await?;
                    return Ok(Ok(()));
                }
                Err(e) => {
                    warn!(position_id = %handle.position_id, leg = %role, exchange = %exchange, attempt, error = %e, "Close failed");
                    last_error = e;
                }
            }
        }
        Ok(Err(last_error))
    }

    /// Close both legs; any failure after retries ends in ERROR flagged for manual intervention
    ///
    /// `failure` describes why an opening is being aborted; the position then ends in
    /// ERROR even when both legs close.
    async fn unwind(&self, handle: &PositionHandle, reason: CloseReason, failure: Option<String>) -> Result<PositionStatus> {
        if handle.unwinding.swap(true, Ordering::SeqCst) {
            return Ok(handle.state.lock().await.status);
        }
        let result = self.unwind_inner(handle, reason, failure).await;
        handle.unwinding.store(false, Ordering::SeqCst);
        result
    }

    async fn unwind_inner(&self, handle: &PositionHandle, reason: CloseReason, failure: Option<String>) -> Result<PositionStatus> {
        let reason = {
            let mut position = handle.state.lock().await;
            match position.status {
                status if status.is_terminal() => return Ok(status),
                PositionStatus::Pending => {
                    let message = failure.unwrap_or_else(|| "closed before opening".to_string());
                    return self.fail_locked(handle, &mut position, message).await;
                }
                PositionStatus::Closing => {}
                _ => self.set_status(handle, &mut position, PositionStatus::Closing).await?,
            }
            let reason = *position.close_reason.get_or_insert(reason);
            if reason == CloseReason::LiquidationDanger {
                position.emergency_closed = true;
            }
            self.store.save_position(&position).await?;
            log_position!(info, position, reason = ?reason, "Closing both legs");
            reason
        };
        if reason == CloseReason::LiquidationDanger {
            error!(position_id = %handle.position_id, "Emergency close: liquidation danger");
            metrics::record_emergency_close();
        }

        let (primary, hedge) = tokio::join!(
            self.close_leg(handle, LegRole::Primary),
            self.close_leg(handle, LegRole::Hedge)
        );
        let (primary, hedge) = (primary?, hedge?);

        let mut position = handle.state.lock().await;
        position.recompute_pnl();

        if primary.is_ok() && hedge.is_ok() {
            if let Some(message) = failure {
                return self
                    .fail_locked(handle, &mut position, format!("{}; both legs unwound", message))
                    .await;
            }
            self.set_status(handle, &mut position, PositionStatus::Completed).await?;
            let kind = if position.emergency_closed {
                NotificationKind::EmergencyClose
            } else {
                NotificationKind::PositionClosed
            };
            notify::dispatch(
                &self.notifier,
                &position.user_id,
                kind,
                json!({
                    "position_id": position.position_id,
                    "symbol": position.symbol,
                    "reason": reason,
                    "gross_profit": position.gross_profit,
                    "net_profit": position.net_profit,
                }),
            );
            handle.subscribers.publish(PositionEvent::Closed {
                position_id: position.position_id.clone(),
                reason: position.close_reason,
                net_profit: position.net_profit,
            });
            return Ok(PositionStatus::Completed);
        }

        let mut parts: Vec<String> = failure.into_iter().collect();
        for (role, outcome) in [(LegRole::Primary, primary), (LegRole::Hedge, hedge)] {
            if let Err(e) = outcome {
                parts.push(format!(
                    "close of {} leg on {} failed after {} attempts: {}",
                    role,
                    position.leg(role).exchange,
                    self.config.max_close_retries + 1,
                    e
                ));
            }
        }
        parts.push("manual intervention required".to_string());
        position.requires_manual_intervention = true;
        self.fail_locked(handle, &mut position, parts.join("; ")).await
    }

    /// Ask a position to close
    ///
    /// During OPENING the request is honoured between tranches, once both legs
    /// of the in-flight tranche are confirmed.
    pub fn request_close(&self, position_id: &str) -> Result<()> {
        let handle = self.handle(position_id)?;
        handle.close_requested.store(true, Ordering::SeqCst);
        handle.close_signal.notify_one();
        info!(position_id, "Close requested");
        Ok(())
    }

    /// Close a position now when ACTIVE; a PENDING/OPENING position is flagged instead
    pub async fn close_position(&self, position_id: &str, reason: CloseReason) -> Result<PositionStatus> {
        let handle = self.handle(position_id)?;
        let status = handle.state.lock().await.status;
        let driven = handle.task.lock().await.is_some();
        match status {
            PositionStatus::Pending if !driven => {
                self.fail(&handle, "closed before opening".to_string()).await
            }
            PositionStatus::Pending | PositionStatus::Opening => {
                self.request_close(position_id)?;
                Ok(status)
            }
            PositionStatus::Active | PositionStatus::Closing => self.unwind(&handle, reason, None).await,
            terminal => Ok(terminal),
        }
    }

    /// Stop monitoring one position after its in-flight tick
    pub fn stop_monitoring(&self, position_id: &str) -> Result<()> {
        let handle = self.handle(position_id)?;
        handle.shutdown.send_replace(true);
        Ok(())
    }

    /// Stop every position task and wait for in-flight work to finish
    pub async fn shutdown(&self) {
        let handles = self.handles();
        for handle in &handles {
            handle.shutdown.send_replace(true);
        }
        for handle in handles {
            let task = handle.task.lock().await.take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(position_id = %handle.position_id, error = %e, "Position task ended abnormally");
                }
            }
        }
        info!("Engine stopped");
    }

    /// Resume persisted positions after a restart
    ///
    /// ACTIVE positions resume monitoring. OPENING/CLOSING positions are orphans:
    /// both legs are re-read from the exchanges and then unwound.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for position in self.store.load_active_positions().await? {
            if self.positions.contains_key(&position.position_id) {
                continue;
            }
            let status = position.status;
            let handle = Arc::new(PositionHandle::new(position));
            self.positions.insert(handle.position_id.clone(), Arc::clone(&handle));

            match status {
                PositionStatus::Pending => {
                    self.fail(&handle, "engine restarted before the opening sequence began".to_string())
                        .await?;
                    report.failed += 1;
                }
                PositionStatus::Active => {
                    info!(position_id = %handle.position_id, "Resuming monitoring");
                    self.spawn(handle, Stage::Monitor).await;
                    report.resumed += 1;
                }
                PositionStatus::Opening | PositionStatus::Closing => {
                    warn!(position_id = %handle.position_id, status = %status, "Orphaned position, reconciling with exchanges");
                    for role in ROLES {
                        if let Err(e) = self.reconcile_leg(&handle, role).await? {
                            warn!(position_id = %handle.position_id, leg = %role, error = %e, "Reconciliation failed, closing anyway");
                        }
                    }
                    match self.unwind(&handle, CloseReason::Recovery, None).await? {
                        PositionStatus::Completed => report.unwound += 1,
                        _ => report.failed += 1,
                    }
                }
                PositionStatus::Completed | PositionStatus::Error => {}
            }
        }
        metrics::record_tracked_positions(self.positions.len());
        info!(resumed = report.resumed, unwound = report.unwound, failed = report.failed, "Recovery finished");
        Ok(report)
    }

    /// Delete a never-executed ERROR position
    pub async fn delete_position(&self, position_id: &str) -> Result<()> {
        self.store.delete_position(position_id).await?;
        self.positions.remove(position_id);
        metrics::record_tracked_positions(self.positions.len());
        info!(position_id, "Position deleted");
        Ok(())
    }

    /// Current state of a position (registry first, then the store)
    pub async fn position(&self, position_id: &str) -> Result<Option<ArbitragePosition>> {
        match self.handle(position_id) {
            Ok(handle) => Ok(Some(handle.snapshot().await)),
            Err(_) => self.store.load_position(position_id).await,
        }
    }

    /// Every position registered with this engine, oldest first
    pub async fn positions(&self) -> Vec<ArbitragePosition> {
        let mut positions = Vec::new();
        for handle in self.handles() {
            positions.push(handle.snapshot().await);
        }
        positions.sort_by_key(|p| p.created_at);
        positions
    }

    /// Whether `user_id` already has a non-terminal position on `symbol`
    pub async fn has_open_position(&self, user_id: &str, symbol: &str) -> bool {
        for handle in self.handles() {
            let position = handle.state.lock().await;
            if !position.is_terminal() && position.user_id == user_id && position.symbol == symbol {
                return true;
            }
        }
        false
    }

    /// Stream a position's events
    pub fn subscribe(&self, position_id: &str) -> Result<(u64, mpsc::Receiver<PositionEvent>)> {
        let handle = self.handle(position_id)?;
        Ok(handle.subscribers.subscribe(self.config.event_buffer))
    }

    /// End a subscription; false when it was not registered
    pub fn unsubscribe(&self, position_id: &str, subscription_id: u64) -> bool {
        self.handle(position_id)
            .map(|handle| handle.subscribers.unsubscribe(subscription_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PositionLauncher for Arc<GraduatedEntryEngine> {
    async fn has_open_position(&self, user_id: &str, symbol: &str) -> bool {
        GraduatedEntryEngine::has_open_position(self, user_id, symbol).await
    }

    async fn launch(&self, request: OpenPositionRequest) -> Result<String> {
        GraduatedEntryEngine::start_position(self, request).await
    }
}
