//! Runtime event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Runtime event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Container created.
    ContainerCreated { id: String, timestamp: i64 },
    /// Container started.
    ContainerStarted { id: String, timestamp: i64 },
    /// Container stopped.
    ContainerStopped { id: String, timestamp: i64 },
    /// Container removed.
    ContainerRemoved { id: String, timestamp: i64 },
    /// Volume allocated.
    VolumeCreated { volume: String, timestamp: i64 },
    /// Container took a reference on a volume.
    VolumeMounted {
        volume: String,
        container: String,
        timestamp: i64,
    },
    /// Container released its reference on a volume.
    VolumeUnmounted {
        volume: String,
        container: String,
        timestamp: i64,
    },
    /// Volume record and backing storage deleted.
    VolumeDestroyed { volume: String, timestamp: i64 },
}

/// Event bus for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}

/// Current time as a unix timestamp, as carried by events.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
