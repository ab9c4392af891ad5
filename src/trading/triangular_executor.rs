//! Sequential execution of triangular opportunities
//!
//! Opportunities are snapshots: every execution re-prices the three symbols
//! first and refuses to place anything if the loop no longer pays. Legs then
//! run one after another, each sized from what the previous leg actually
//! delivered. A failed leg stops the sequence; partial exposure is recorded,
//! never unwound automatically.

use crate::{
    connectors::{ExchangeConnector, OrderFill, OrderRequest, OrderSide},
    market_data::MarketDataProvider,
    notify::{self, NotificationKind, Notifier},
    strategy::triangular::{cycle_profit, FeeSchedule, TriangularDetector, TriangularOpportunity},
    ArbitrageError, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Opportunities buffered between detector and executor
const OPPORTUNITY_BUFFER: usize = 16;

/// Triangular execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriangularStatus {
    /// Leg 1 in flight
    ExecutingLeg1,
    /// Leg 2 in flight
    ExecutingLeg2,
    /// Leg 3 in flight
    ExecutingLeg3,
    /// All three legs filled
    Completed,
    /// A leg failed; `current_leg` points at it
    Error,
}

impl TriangularStatus {
    fn executing(leg: u8) -> Self {
        match leg {
            1 => TriangularStatus::ExecutingLeg1,
            2 => TriangularStatus::ExecutingLeg2,
            _ => TriangularStatus::ExecutingLeg3,
        }
    }
}

/// One executed (or attempted) leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangularLeg {
    /// Symbol
    pub symbol: String,
    /// Side
    pub side: OrderSide,
    /// Quantity requested, in base units
    pub quantity: f64,
    /// Quantity filled, in base units
    pub filled_qty: f64,
    /// Average fill price
    pub avg_price: f64,
    /// Fee paid, in quote units
    pub fee: f64,
    /// Exchange order id once placed
    pub order_id: Option<String>,
}

/// Record of one triangular execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangularPosition {
    /// Identifier
    pub id: String,
    /// Opportunity executed
    pub opportunity_id: String,
    /// Start asset
    pub start_asset: String,
    /// Amount of the start asset committed
    pub start_amount: f64,
    /// First leg
    pub leg1: TriangularLeg,
    /// Second leg
    pub leg2: TriangularLeg,
    /// Third leg
    pub leg3: TriangularLeg,
    /// Leg being executed (1-based)
    pub current_leg: u8,
    /// Status
    pub status: TriangularStatus,
    /// Start asset held after leg 3
    pub final_amount: Option<f64>,
    /// Failure description
    pub error_message: Option<String>,
    /// Start time
    pub created_at: DateTime<Utc>,
    /// End time
    pub completed_at: Option<DateTime<Utc>>,
}

impl TriangularPosition {
    /// Leg by 1-based index
    pub fn leg(&self, index: u8) -> &TriangularLeg {
        match index {
            1 => &self.leg1,
            2 => &self.leg2,
            _ => &self.leg3,
        }
    }

    fn leg_mut(&mut self, index: u8) -> &mut TriangularLeg {
        match index {
            1 => &mut self.leg1,
            2 => &mut self.leg2,
            _ => &mut self.leg3,
        }
    }

    /// Realized result in the start asset, percent
    pub fn realized_profit_percent(&self) -> Option<f64> {
        let final_amount = self.final_amount?;
        (self.start_amount > 0.0).then(|| (final_amount / self.start_amount - 1.0) * 100.0)
    }
}

/// Amount of the next asset actually received from a fill (fees are charged in quote)
pub fn received_amount(side: OrderSide, fill: &OrderFill) -> f64 {
    match side {
        OrderSide::Buy if fill.average_price > 0.0 => fill.filled_quantity - fill.fee / fill.average_price,
        OrderSide::Buy => fill.filled_quantity,
        OrderSide::Sell => fill.filled_quantity * fill.average_price - fill.fee,
    }
    .max(0.0)
}

/// Outcome counters of one executor run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriangularRunStats {
    /// Cycles that completed all three legs
    pub completed: usize,
    /// Executions that stopped on a failed leg
    pub failed: usize,
    /// Opportunities rejected before any order (expired, decayed, consumed)
    pub skipped: usize,
    /// Stopped early because a failure left an intermediate asset held
    pub halted: bool,
}

/// Executes triangular opportunities on one exchange
pub struct TriangularExecutor {
    connector: Arc<dyn ExchangeConnector>,
    market_data: Arc<dyn MarketDataProvider>,
    fees: FeeSchedule,
    notifier: Arc<dyn Notifier>,
    user_id: String,
}

impl TriangularExecutor {
    /// Create an executor
    pub fn new(
        connector: Arc<dyn ExchangeConnector>,
        market_data: Arc<dyn MarketDataProvider>,
        fees: FeeSchedule,
        notifier: Arc<dyn Notifier>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            market_data,
            fees,
            notifier,
            user_id: user_id.into(),
        }
    }

    /// Re-validate and execute `opportunity` with `start_amount` of its start asset
    ///
    /// Returns `Err` when nothing was placed (stale, expired, already consumed or
    /// no longer profitable). Once leg 1 is placed the result is always `Ok`, with
    /// a failed leg reported through [`TriangularStatus::Error`].
    pub async fn execute(&self, opportunity: &mut TriangularOpportunity, start_amount: f64) -> Result<TriangularPosition> {
        if opportunity.was_executed {
            return Err(ArbitrageError::Trading(format!("opportunity {} was already executed", opportunity.id)).into());
        }
        if Utc::now() >= opportunity.expires_at {
            return Err(ArbitrageError::Trading(format!("opportunity {} expired", opportunity.id)).into());
        }
        if !start_amount.is_finite() || start_amount <= 0.0 {
            return Err(ArbitrageError::Validation(format!("start amount must be positive, got {}", start_amount)).into());
        }

        let mut prices = [0.0; 3];
        for (slot, leg) in prices.iter_mut().zip(opportunity.legs.iter()) {
            *slot = self.market_data.get_price(&leg.symbol).await.ok_or_else(|| {
                ArbitrageError::Trading(format!("no longer profitable: no current price for {}", leg.symbol))
            })?;
        }
        let profit = cycle_profit(&opportunity.legs, prices, self.fees)
            .ok_or_else(|| ArbitrageError::Trading("no longer profitable: invalid current prices".to_string()))?;
        if profit.after_fees_percent <= 0.0 {
            info!(
                opportunity_id = %opportunity.id,
                detected = opportunity.profit_after_fees_percent,
                current = profit.after_fees_percent,
                "Opportunity decayed before execution"
            );
            return Err(ArbitrageError::Trading(format!(
                "no longer profitable: {:.4}% after fees at current prices",
                profit.after_fees_percent
            ))
            .into());
        }

        opportunity.was_executed = true;
        for (leg, price) in opportunity.legs.iter_mut().zip(prices) {
            leg.price = price;
        }
        opportunity.theoretical_profit_percent = profit.theoretical_percent;
        opportunity.profit_after_fees_percent = profit.after_fees_percent;

        let leg_template = |index: usize| TriangularLeg {
            symbol: opportunity.legs[index].symbol.clone(),
            side: opportunity.legs[index].side,
            quantity: 0.0,
            filled_qty: 0.0,
            avg_price: 0.0,
            fee: 0.0,
            order_id: None,
        };
        let mut position = TriangularPosition {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity_id: opportunity.id.clone(),
            start_asset: opportunity.start_asset.clone(),
            start_amount,
            leg1: leg_template(0),
            leg2: leg_template(1),
            leg3: leg_template(2),
            current_leg: 1,
            status: TriangularStatus::ExecutingLeg1,
            final_amount: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        let mut held = start_amount;
        for index in 1..=3u8 {
            let plan = &opportunity.legs[usize::from(index) - 1];
            position.current_leg = index;
            position.status = TriangularStatus::executing(index);

            let quantity = match plan.side {
                OrderSide::Buy => held / plan.price,
                OrderSide::Sell => held,
            };
            position.leg_mut(index).quantity = quantity;

            let order = OrderRequest::market(plan.symbol.clone(), plan.side, quantity)
                .with_client_order_id(format!("tri-{}-{}", &position.id[..8], index));
            match self.connector.place_order(&order).await {
                Ok(fill) => {
                    held = received_amount(plan.side, &fill);
                    let leg = position.leg_mut(index);
                    leg.filled_qty = fill.filled_quantity;
                    leg.avg_price = fill.average_price;
                    leg.fee = fill.fee;
                    leg.order_id = Some(fill.order_id.clone());
                    info!(
                        position_id = %position.id,
                        leg = index,
                        symbol = %plan.symbol,
                        side = %plan.side,
                        filled = fill.filled_quantity,
                        price = fill.average_price,
                        received = held,
                        asset = %plan.to_asset,
                        "Triangular leg filled"
                    );
                    if held <= 0.0 {
                        return Ok(self.fail(position, format!("leg {} on {} delivered nothing", index, plan.symbol)));
                    }
                }
                Err(e) => {
                    let holding = if index == 1 {
                        String::new()
                    } else {
                        format!("; holding {} {}", held, plan.from_asset)
                    };
                    return Ok(self.fail(position, format!("leg {} on {} failed: {}{}", index, plan.symbol, e, holding)));
                }
            }
        }

        position.status = TriangularStatus::Completed;
        position.final_amount = Some(held);
        position.completed_at = Some(Utc::now());
        info!(
            position_id = %position.id,
            start_amount,
            final_amount = held,
            realized_percent = position.realized_profit_percent().unwrap_or_default(),
            "Triangular cycle completed"
        );
        notify::dispatch(
            &self.notifier,
            &self.user_id,
            NotificationKind::TriangularExecuted,
            json!({
                "position_id": position.id,
                "opportunity_id": position.opportunity_id,
                "start_asset": position.start_asset,
                "start_amount": start_amount,
                "final_amount": held,
            }),
        );
        Ok(position)
    }

    /// Execute opportunities from `opportunities` one at a time with `start_amount` each
    ///
    /// Ends on shutdown, when the detector side closes, or after a failure past
    /// leg 1: the asset held then needs an operator before trading resumes.
    pub async fn run(
        &self,
        mut opportunities: mpsc::Receiver<TriangularOpportunity>,
        start_amount: f64,
        mut shutdown: watch::Receiver<bool>,
    ) -> TriangularRunStats {
        let mut stats = TriangularRunStats::default();
        info!(start_amount, "Triangular executor started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut opportunity = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = opportunities.recv() => match next {
                    Some(opportunity) => opportunity,
                    None => break,
                },
            };

            match self.execute(&mut opportunity, start_amount).await {
                Ok(position) if position.status == TriangularStatus::Completed => stats.completed += 1,
                Ok(position) => {
                    stats.failed += 1;
                    if position.current_leg > 1 {
                        error!(position_id = %position.id, "Intermediate asset held, triangular executor halted");
                        stats.halted = true;
                        break;
                    }
                }
                Err(e) => {
                    debug!(opportunity_id = %opportunity.id, reason = %e, "Opportunity skipped");
                    stats.skipped += 1;
                }
            }
        }

        info!(
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            halted = stats.halted,
            "Triangular executor stopped"
        );
        stats
    }

    fn fail(&self, mut position: TriangularPosition, message: String) -> TriangularPosition {
        if position.current_leg > 1 {
            warn!(position_id = %position.id, "Partial triangular execution left open");
        }
        error!(position_id = %position.id, leg = position.current_leg, error = %message, "Triangular execution failed");
        position.status = TriangularStatus::Error;
        position.error_message = Some(message);
        position.completed_at = Some(Utc::now());
        position
    }
}

/// Spawn the detector and an executor consuming what it finds
///
/// Both tasks stop when `shutdown` flips; the executor also stops once the
/// detector is gone, and the detector once the executor is.
pub fn spawn_pipeline(
    detector: TriangularDetector,
    executor: TriangularExecutor,
    start_amount: f64,
    shutdown: watch::Receiver<bool>,
) -> (JoinHandle<()>, JoinHandle<TriangularRunStats>) {
    let (sink, opportunities) = mpsc::channel(OPPORTUNITY_BUFFER);
    let detector_shutdown = shutdown.clone();
    let detector_task = tokio::spawn(async move { detector.run(sink, detector_shutdown).await });
    let executor_task = tokio::spawn(async move { executor.run(opportunities, start_amount, shutdown).await });
    (detector_task, executor_task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_amount_nets_fees() {
        let buy = OrderFill {
            order_id: "1".to_string(),
            filled_quantity: 2.0,
            average_price: 100.0,
            fee: 0.2,
        };
        assert!((received_amount(OrderSide::Buy, &buy) - 1.998).abs() < 1e-12);
        assert!((received_amount(OrderSide::Sell, &buy) - 199.8).abs() < 1e-12);
    }

    #[test]
    fn test_status_per_leg() {
        assert_eq!(TriangularStatus::executing(1), TriangularStatus::ExecutingLeg1);
        assert_eq!(TriangularStatus::executing(3), TriangularStatus::ExecutingLeg3);
    }
}
