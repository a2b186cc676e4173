//! Engine events for observers (UI shell, notifications, logs)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::BackupReason;

/// Types of engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BackupCompleted,
    BackupFailed,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    /// The local dataset was replaced
    DataChanged,
    /// A background check found a newer remote snapshot
    RemoteNewer,
}

/// An engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Snapshot file involved, if any
    pub file: Option<String>,
    pub reason: Option<BackupReason>,
    pub error: Option<String>,
    /// Whether the shell should surface this as a user notification
    pub notify: bool,
}

impl SyncEvent {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            file: None,
            reason: None,
            error: None,
            notify: false,
        }
    }

    pub fn backup_completed(file: &str, reason: BackupReason, notify: bool) -> Self {
        Self {
            file: Some(file.to_string()),
            reason: Some(reason),
            notify,
            ..Self::new(EventType::BackupCompleted)
        }
    }

    pub fn backup_failed(reason: BackupReason, error: String, notify: bool) -> Self {
        Self {
            reason: Some(reason),
            error: Some(error),
            notify,
            ..Self::new(EventType::BackupFailed)
        }
    }

    pub fn sync_started(file: &str) -> Self {
        Self {
            file: Some(file.to_string()),
            ..Self::new(EventType::SyncStarted)
        }
    }

    pub fn sync_completed(file: &str) -> Self {
        Self {
            file: Some(file.to_string()),
            notify: true,
            ..Self::new(EventType::SyncCompleted)
        }
    }

    pub fn sync_failed(file: &str, error: String) -> Self {
        Self {
            file: Some(file.to_string()),
            error: Some(error),
            notify: true,
            ..Self::new(EventType::SyncFailed)
        }
    }

    pub fn data_changed(file: &str) -> Self {
        Self {
            file: Some(file.to_string()),
            ..Self::new(EventType::DataChanged)
        }
    }

    pub fn remote_newer(file: &str) -> Self {
        Self {
            file: Some(file.to_string()),
            notify: true,
            ..Self::new(EventType::RemoteNewer)
        }
    }
}

/// Broadcast hub for [`SyncEvent`]s.
///
/// Publishing never fails; events are dropped when nobody listens.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
