/// file: src/events.rs
/// description: connection lifecycle notifications, the only surface for transport failures
use crate::types::JobId;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connecting {
        job_id: JobId,
        url: String,
    },
    Connected {
        job_id: JobId,
        connection_id: uuid::Uuid,
    },
    Disconnected {
        job_id: JobId,
        reason: String,
    },
    Reconnecting {
        job_id: JobId,
        attempt: u32,
        delay: Duration,
    },
    ConnectionFailed {
        job_id: JobId,
        error: String,
    },
    /// The connection task has exited and will not retry on its own.
    Closed {
        job_id: JobId,
    },
}

impl LifecycleEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            LifecycleEvent::Connecting { job_id, .. }
            | LifecycleEvent::Connected { job_id, .. }
            | LifecycleEvent::Disconnected { job_id, .. }
            | LifecycleEvent::Reconnecting { job_id, .. }
            | LifecycleEvent::ConnectionFailed { job_id, .. }
            | LifecycleEvent::Closed { job_id } => job_id,
        }
    }
}

// Lifecycle traffic is a handful of events per connection; slow observers lag rather than block.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

pub type LifecycleSender = broadcast::Sender<LifecycleEvent>;
pub type LifecycleReceiver = broadcast::Receiver<LifecycleEvent>;

pub fn create_lifecycle_channel() -> LifecycleSender {
    let (tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
    tx
}
