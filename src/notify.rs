//! Fire-and-forget user notifications

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Notification category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Position reached ACTIVE
    PositionOpened,
    /// Position closed normally
    PositionClosed,
    /// A leg is close to liquidation
    LiquidationWarning,
    /// Both legs were closed because of liquidation danger
    EmergencyClose,
    /// One leg filled more than the other
    LegImbalance,
    /// Position entered ERROR
    PositionError,
    /// A triangular cycle executed
    TriangularExecuted,
}

/// Delivery channel for user notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification
    async fn notify(&self, user_id: &str, kind: NotificationKind, payload: serde_json::Value) -> Result<()>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, kind: NotificationKind, payload: serde_json::Value) -> Result<()> {
        info!(user_id, ?kind, %payload, "Notification");
        Ok(())
    }
}

/// A delivered notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient
    pub user_id: String,
    /// Category
    pub kind: NotificationKind,
    /// Details
    pub payload: serde_json::Value,
}

/// Forwards notifications to an mpsc channel
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, user_id: &str, kind: NotificationKind, payload: serde_json::Value) -> Result<()> {
        self.tx
            .send(Notification {
                user_id: user_id.to_string(),
                kind,
                payload,
            })
            .await
            .map_err(|_| anyhow::anyhow!("notification channel closed"))
    }
}

/// Send a notification in the background; failures are only logged
pub fn dispatch(notifier: &Arc<dyn Notifier>, user_id: &str, kind: NotificationKind, payload: serde_json::Value) {
    let notifier = Arc::clone(notifier);
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&user_id, kind, payload).await {
            warn!(user_id = %user_id, ?kind, error = %e, "Failed to deliver notification");
        }
    });
}
