//! Status change notifications
//!
//! Successful writes publish a `StatusEvent` for downstream side-effect
//! processing (delivery, timelines, notifications). Publishing is
//! fire-and-enqueue: it never blocks the writer and never fails the write.

use tokio::sync::mpsc;

use crate::data::Status;
use crate::metrics::STATUS_EVENTS_TOTAL;

/// What happened to a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Create,
    Update,
    Delete,
}

impl StatusAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusAction::Create => "create",
            StatusAction::Update => "update",
            StatusAction::Delete => "delete",
        }
    }
}

/// A committed status change
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub action: StatusAction,
    pub status: Status,
}

/// Sending half of the bounded notification channel
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<StatusEvent>,
}

impl WorkQueue {
    /// Create a queue holding at most `capacity` pending events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Enqueue an event without waiting.
    ///
    /// Returns whether the event was accepted. A full or closed queue drops
    /// the event with a warning.
    pub fn publish(&self, action: StatusAction, status: Status) -> bool {
        let status_id = status.id.clone();
        let outcome = match self.sender.try_send(StatusEvent { action, status }) {
            Ok(()) => "queued",
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    action = action.as_str(),
                    status_id = %status_id,
                    "Status event queue full; event dropped"
                );
                "dropped"
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(
                    action = action.as_str(),
                    status_id = %status_id,
                    "Status event queue closed; event dropped"
                );
                "dropped"
            }
        };

        STATUS_EVENTS_TOTAL
            .with_label_values(&[action.as_str(), outcome])
            .inc();
        outcome == "queued"
    }
}
