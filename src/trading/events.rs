//! Per-position event subscriptions

use crate::position::{CloseReason, LegRole, PositionStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Update streamed to a position's subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionEvent {
    /// Lifecycle status moved
    StatusChanged {
        /// Position
        position_id: String,
        /// Previous status
        from: PositionStatus,
        /// New status
        to: PositionStatus,
    },
    /// A tranche was confirmed on both legs
    TrancheFilled {
        /// Position
        position_id: String,
        /// 1-based tranche number
        part: u32,
        /// Primary quantity filled in this tranche
        primary_quantity: f64,
        /// Hedge quantity filled in this tranche
        hedge_quantity: f64,
    },
    /// New funding payments were applied
    FundingApplied {
        /// Position
        position_id: String,
        /// Payments applied
        payments: usize,
        /// Amount applied
        amount: f64,
    },
    /// A leg crossed the danger threshold
    LiquidationWarning {
        /// Position
        position_id: String,
        /// Leg in danger
        leg: LegRole,
        /// Fraction of the liquidation distance travelled
        proximity_ratio: f64,
    },
    /// Both legs are closed
    Closed {
        /// Position
        position_id: String,
        /// Close trigger
        reason: Option<CloseReason>,
        /// Final net P&L
        net_profit: f64,
    },
    /// The position entered ERROR
    Error {
        /// Position
        position_id: String,
        /// Failure description
        message: String,
    },
}

/// Subscriber set scoped to one position
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    senders: DashMap<u64, mpsc::Sender<PositionEvent>>,
}

impl Subscribers {
    /// Register a subscriber; events beyond `buffer` unread are dropped for it
    pub fn subscribe(&self, buffer: usize) -> (u64, mpsc::Receiver<PositionEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.senders.insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber; false when it was not registered
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.senders.remove(&id).is_some()
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// No live subscribers
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Deliver to every subscriber without waiting; closed receivers are dropped
    pub fn publish(&self, event: PositionEvent) {
        let mut closed = Vec::new();
        for entry in self.senders.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = *entry.key(), "Subscriber lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.senders.remove(&id);
        }
    }
}
