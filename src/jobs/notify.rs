use serde::Serialize;
use tokio::sync::broadcast;

use super::{JobId, JobStatus};

/// Real-time status notification for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
}

/// Best-effort delivery of status events.
///
/// `publish` never fails and never blocks; events may be dropped. The
/// persisted job record stays authoritative.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: StatusEvent);
}

/// Fans events out to in-process subscribers
pub struct BroadcastNotifier {
    sender: broadcast::Sender<StatusEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn publish(&self, event: StatusEvent) {
        let job_id = event.job_id.clone();
        if self.sender.send(event).is_err() {
            tracing::trace!(job_id = %job_id, "No status subscribers, event dropped");
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn publish(&self, _event: StatusEvent) {}
}
