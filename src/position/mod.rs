//! Hedged position data model

pub mod store;

pub use store::{InMemoryPositionStore, JsonFilePositionStore, PositionStore};

use crate::{
    connectors::{Exchange, PositionSide},
    ArbitrageError, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Quantities closer than this are treated as equal
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Which side of the hedge a leg is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegRole {
    /// Leg placed first in every tranche
    Primary,
    /// Leg matched to the primary's fill
    Hedge,
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::Primary => write!(f, "primary"),
            LegRole::Hedge => write!(f, "hedge"),
        }
    }
}

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Created, no order placed yet
    Pending,
    /// Tranches being placed
    Opening,
    /// Fully hedged and monitored
    Active,
    /// Both legs being unwound
    Closing,
    /// Both legs closed
    Completed,
    /// Terminal failure; no further orders
    Error,
}

impl PositionStatus {
    /// Completed or Error
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionStatus::Completed | PositionStatus::Error)
    }

    /// Forward moves only; Error from any non-terminal state
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (Completed | Error, _) => false,
            (_, Error) => true,
            (Pending, Opening) | (Opening, Active) | (Active, Closing) | (Closing, Completed) => true,
            // manual close between tranches, or an aborted/orphaned opening being unwound
            (Opening, Closing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Opening => "OPENING",
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Completed => "COMPLETED",
            PositionStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Why a position left ACTIVE (or never reached it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Take-profit level touched
    TakeProfit,
    /// Stop-loss level touched
    StopLoss,
    /// A leg came within the danger threshold of liquidation
    LiquidationDanger,
    /// A leg disappeared on the exchange
    LegMissing,
    /// Requested by the user
    Manual,
    /// Opening could not be completed
    OpenAborted,
    /// Orphan unwound after a restart
    Recovery,
}

/// Parameters of a new hedged position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionRequest {
    /// Owner
    pub user_id: String,
    /// Perpetual symbol traded on both exchanges
    pub symbol: String,
    /// Exchange of the primary leg
    pub primary_exchange: Exchange,
    /// Exchange of the hedge leg
    pub hedge_exchange: Exchange,
    /// Side of the primary leg; the hedge takes the opposite side
    pub primary_side: PositionSide,
    /// Planned quantity per leg
    pub quantity: f64,
    /// Leverage applied on both legs
    pub leverage: u32,
    /// Number of tranches (engine default when `None`)
    pub total_parts: Option<u32>,
    /// Delay between tranches (engine default when `None`)
    pub inter_part_delay_ms: Option<u64>,
}

/// One exchange-side of a hedged position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    /// Primary or hedge
    pub role: LegRole,
    /// Exchange holding the leg
    pub exchange: Exchange,
    /// Long or short
    pub side: PositionSide,
    /// Leverage
    pub leverage: u32,
    /// Target quantity
    pub planned_quantity: f64,
    /// Quantity currently held from the opening sequence
    pub filled_quantity: f64,
    /// Quantity closed by the close sequence
    pub closed_quantity: f64,
    /// Volume-weighted average entry
    pub entry_price: f64,
    /// Last observed mark price
    pub current_price: f64,
    /// Volume-weighted average exit
    pub exit_price: Option<f64>,
    /// Estimated liquidation price
    pub liquidation_price: Option<f64>,
    /// Fraction of the entry-to-liquidation distance travelled
    pub proximity_ratio: f64,
    /// Proximity at or beyond the danger threshold
    pub in_danger: bool,
    /// Stop-loss level
    pub stop_loss: Option<f64>,
    /// Take-profit level
    pub take_profit: Option<f64>,
    /// Trading fees paid on this leg
    pub trading_fees_accrued: f64,
    /// Most recent funding payment
    pub funding_paid: f64,
    /// Sum of all funding payments applied
    pub funding_earned_total: f64,
    /// P&L realized by reductions and closes
    pub realized_pnl: f64,
    /// Exchange order ids, in execution order
    pub order_ids: Vec<String>,
    /// Tranches confirmed on this leg
    pub parts_filled: u32,
    /// Leverage confirmed on the exchange
    pub leverage_applied: bool,
    /// TP/SL confirmed on the exchange
    pub trading_stop_applied: bool,
    /// Timestamp of the newest applied funding payment
    pub last_funding_time: Option<DateTime<Utc>>,
    /// Funding payments already applied
    #[serde(default)]
    pub applied_funding_ids: BTreeSet<String>,
}

impl Leg {
    /// Unfilled leg
    pub fn new(role: LegRole, exchange: Exchange, side: PositionSide, leverage: u32, planned_quantity: f64) -> Self {
        Self {
            role,
            exchange,
            side,
            leverage,
            planned_quantity,
            filled_quantity: 0.0,
            closed_quantity: 0.0,
            entry_price: 0.0,
            current_price: 0.0,
            exit_price: None,
            liquidation_price: None,
            proximity_ratio: 0.0,
            in_danger: false,
            stop_loss: None,
            take_profit: None,
            trading_fees_accrued: 0.0,
            funding_paid: 0.0,
            funding_earned_total: 0.0,
            realized_pnl: 0.0,
            order_ids: Vec::new(),
            parts_filled: 0,
            leverage_applied: false,
            trading_stop_applied: false,
            last_funding_time: None,
            applied_funding_ids: BTreeSet::new(),
        }
    }

    /// Quantity still to be filled
    pub fn remaining(&self) -> f64 {
        (self.planned_quantity - self.filled_quantity).max(0.0)
    }

    /// Quantity still open on the exchange
    pub fn open_quantity(&self) -> f64 {
        (self.filled_quantity - self.closed_quantity).max(0.0)
    }

    /// Fold an opening fill in, never exceeding the planned quantity
    ///
    /// Returns the quantity accepted.
    pub fn apply_fill(&mut self, quantity: f64, price: f64, fee: f64, order_id: &str) -> f64 {
        let accepted = quantity.min(self.remaining()).max(0.0);
        if quantity - accepted > QUANTITY_EPSILON {
            warn!(
                leg = %self.role,
                exchange = %self.exchange,
                reported = quantity,
                accepted,
                "Fill exceeds planned quantity, clamping"
            );
        }

        let new_filled = (self.filled_quantity + accepted).min(self.planned_quantity);
        if new_filled > 0.0 {
            self.entry_price = (self.entry_price * self.filled_quantity + price * accepted) / new_filled;
        }
        self.filled_quantity = new_filled;
        self.trading_fees_accrued += fee;
        if self.current_price <= 0.0 {
            self.current_price = price;
        }
        self.order_ids.push(order_id.to_string());
        accepted
    }

    /// Remove exposure opened by this leg (emergency imbalance correction)
    pub fn reduce_fill(&mut self, quantity: f64, price: f64, fee: f64, order_id: &str) -> f64 {
        let reduced = quantity.min(self.open_quantity()).max(0.0);
        self.realized_pnl += (price - self.entry_price) * reduced * self.side.direction();
        self.filled_quantity -= reduced;
        self.trading_fees_accrued += fee;
        self.order_ids.push(order_id.to_string());
        reduced
    }

    /// Record a closing fill
    pub fn record_exit(&mut self, quantity: f64, price: f64, fee: f64, order_id: &str) {
        let closed = quantity.min(self.open_quantity()).max(0.0);
        if closed > 0.0 {
            let previous = self.closed_quantity;
            let exit = self.exit_price.unwrap_or(0.0);
            self.exit_price = Some((exit * previous + price * closed) / (previous + closed));
            self.realized_pnl += (price - self.entry_price) * closed * self.side.direction();
            self.closed_quantity += closed;
            self.current_price = price;
        }
        self.trading_fees_accrued += fee;
        self.order_ids.push(order_id.to_string());
    }

    /// Mark the leg flat without a fill (the exchange reports nothing open)
    pub fn mark_flat(&mut self) {
        self.closed_quantity = self.filled_quantity;
    }

    /// P&L of the still-open quantity at the current price
    pub fn unrealized_pnl(&self) -> f64 {
        if self.current_price <= 0.0 || self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) * self.open_quantity() * self.side.direction()
    }
}

/// A hedged two-exchange position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitragePosition {
    /// Stable identifier
    pub position_id: String,
    /// Symbol
    pub symbol: String,
    /// Owner
    pub user_id: String,
    /// Primary leg
    pub primary: Leg,
    /// Hedge leg
    pub hedge: Leg,
    /// Tranches planned
    pub total_parts: u32,
    /// Tranches confirmed on both legs
    pub current_part: u32,
    /// Delay between tranches
    pub inter_part_delay_ms: u64,
    /// Lifecycle status
    pub status: PositionStatus,
    /// Sum of both legs' price P&L
    pub gross_profit: f64,
    /// Gross minus fees plus funding
    pub net_profit: f64,
    /// Human-readable failure description
    pub error_message: Option<String>,
    /// A leg may still be open on an exchange
    pub requires_manual_intervention: bool,
    /// Why the position closed
    pub close_reason: Option<CloseReason>,
    /// Closed because of liquidation danger
    pub emergency_closed: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// First order time
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    pub completed_at: Option<DateTime<Utc>>,
    /// Last liquidation refresh
    pub last_liquidation_check: Option<DateTime<Utc>>,
    /// Last funding poll that reached both exchanges
    pub last_funding_update: Option<DateTime<Utc>>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl ArbitragePosition {
    /// New PENDING position
    pub fn new(request: &OpenPositionRequest, total_parts: u32, inter_part_delay_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            position_id: uuid::Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            user_id: request.user_id.clone(),
            primary: Leg::new(
                LegRole::Primary,
                request.primary_exchange,
                request.primary_side,
                request.leverage,
                request.quantity,
            ),
            hedge: Leg::new(
                LegRole::Hedge,
                request.hedge_exchange,
                request.primary_side.opposite(),
                request.leverage,
                request.quantity,
            ),
            total_parts,
            current_part: 0,
            inter_part_delay_ms,
            status: PositionStatus::Pending,
            gross_profit: 0.0,
            net_profit: 0.0,
            error_message: None,
            requires_manual_intervention: false,
            close_reason: None,
            emergency_closed: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_liquidation_check: None,
            last_funding_update: None,
            updated_at: now,
        }
    }

    /// Leg by role
    pub fn leg(&self, role: LegRole) -> &Leg {
        match role {
            LegRole::Primary => &self.primary,
            LegRole::Hedge => &self.hedge,
        }
    }

    /// Mutable leg by role
    pub fn leg_mut(&mut self, role: LegRole) -> &mut Leg {
        match role {
            LegRole::Primary => &mut self.primary,
            LegRole::Hedge => &mut self.hedge,
        }
    }

    /// Move to `next`, rejecting backwards moves and anything out of a terminal state
    pub fn transition(&mut self, next: PositionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ArbitrageError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        let now = Utc::now();
        if next == PositionStatus::Opening {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Enter ERROR with a description
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(PositionStatus::Error)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Fees across both legs
    pub fn total_fees(&self) -> f64 {
        self.primary.trading_fees_accrued + self.hedge.trading_fees_accrued
    }

    /// Funding across both legs
    pub fn total_funding(&self) -> f64 {
        self.primary.funding_earned_total + self.hedge.funding_earned_total
    }

    /// Primary filled minus hedge filled
    pub fn imbalance(&self) -> f64 {
        self.primary.filled_quantity - self.hedge.filled_quantity
    }

    /// Rederive gross and net P&L from leg state
    pub fn recompute_pnl(&mut self) {
        self.gross_profit = self.primary.realized_pnl
            + self.primary.unrealized_pnl()
            + self.hedge.realized_pnl
            + self.hedge.unrealized_pnl();
        self.net_profit = self.gross_profit - self.total_fees() + self.total_funding();
        self.updated_at = Utc::now();
    }

    /// Only never-executed ERROR positions may be deleted
    pub fn is_deletable(&self) -> bool {
        self.status == PositionStatus::Error
            && self.primary.filled_quantity == 0.0
            && self.hedge.filled_quantity == 0.0
            && self.primary.order_ids.is_empty()
            && self.hedge.order_ids.is_empty()
    }

    /// Completed or Error
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Split `total` into `parts` tranches rounded down to `step`; the last absorbs the remainder
pub fn split_tranches(total: f64, parts: u32, step: f64) -> Result<Vec<f64>> {
    if parts == 0 {
        return Err(ArbitrageError::Validation("total_parts must be at least 1".to_string()).into());
    }
    let to_decimal = |value: f64, name: &str| {
        Decimal::from_f64(value)
            .ok_or_else(|| ArbitrageError::Validation(format!("{} {} is not representable", name, value)))
    };
    let total_d = to_decimal(total, "quantity")?;
    let step_d = to_decimal(step, "quantity step")?;
    let parts_d = Decimal::from(parts);

    let mut tranche = total_d / parts_d;
    if step_d > Decimal::ZERO {
        tranche = (tranche / step_d).floor() * step_d;
    }
    if tranche <= Decimal::ZERO {
        return Err(ArbitrageError::Validation(format!(
            "quantity {} cannot be split into {} tranches of step {}",
            total, parts, step
        ))
        .into());
    }

    let last = total_d - tranche * Decimal::from(parts - 1);
    let mut tranches = Vec::with_capacity(parts as usize);
    for _ in 1..parts {
        tranches.push(tranche);
    }
    tranches.push(last);

    tranches
        .into_iter()
        .map(|d| {
            d.normalize()
                .to_f64()
                .ok_or_else(|| anyhow::Error::from(ArbitrageError::Validation("tranche quantity overflow".to_string())))
        })
        .collect()
}
