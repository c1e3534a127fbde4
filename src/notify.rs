//! Notification collaborator.
//!
//! Delivery is best effort: the core calls `notify` once per action and records
//! the outcome. Retries, if any, belong to the implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Errors from notification delivery. Never fatal to the caller.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),
}

/// Recipient role. Clinicians and patients receive different copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Clinician,
    Patient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub category: String,
    pub priority: NotificationPriority,
    pub data: Value,
}

pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        target_id: &str,
        role: TargetRole,
        notification: &Notification,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the tracing log. Always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(
        &self,
        target_id: &str,
        role: TargetRole,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            target_id,
            role = ?role,
            category = %notification.category,
            priority = ?notification.priority,
            title = %notification.title,
            "Notification dispatched"
        );
        Ok(())
    }
}

/// A notification addressed to one recipient, as delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingNotification {
    pub target_id: String,
    pub role: TargetRole,
    pub notification: Notification,
}

/// Hands notifications to an outer delivery layer over a bounded channel.
/// Fails when the channel is full or the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<OutgoingNotification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutgoingNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(
        &self,
        target_id: &str,
        role: TargetRole,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        let msg = OutgoingNotification {
            target_id: target_id.to_string(),
            role,
            notification: notification.clone(),
        };
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                NotifyError::NotificationDeliveryFailed("notification queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                NotifyError::NotificationDeliveryFailed("notification channel closed".into())
            }
        })
    }
}
