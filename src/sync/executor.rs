//! Safe restore of a remote snapshot over local data
//!
//! `Idle -> SafetyBackupInFlight -> Downloading -> Applying -> Idle`, with
//! any failure passing through `Failed` back to `Idle`. Local data is only
//! written in `Applying`, after the safety snapshot and the download both
//! succeeded.

use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::backup::BackupOrchestrator;
use super::timestamp::TimestampCodec;
use super::webdav::TransportFactory;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::storage::{DatasetStore, SettingsStore};
use crate::types::{BackupReason, SnapshotPayload, SNAPSHOT_EXTENSION};

/// Where the executor is in a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    SafetyBackupInFlight,
    Downloading,
    Applying,
    Failed,
}

/// What asked for the sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The user picked a snapshot from the list
    Restore,
    /// The user accepted a newer-remote prompt
    RemoteNewer,
}

/// Details of a completed sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub file: String,
    pub trigger: SyncTrigger,
    /// Safety snapshot taken before the overwrite
    pub safety_backup: Option<String>,
    /// `lastModified` stamped on the restored dataset
    pub last_modified: i64,
    pub synced_at: String,
    pub nodes: usize,
}

/// Result of a sync request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another sync holds the single-flight slot
    AlreadySyncing,
}

/// Holds the single-flight slot; returns the executor to `Idle` when dropped
struct Flight<'a> {
    state: &'a Mutex<SyncState>,
}

impl Flight<'_> {
    fn enter(&self, next: SyncState) {
        *self.state.lock() = next;
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        *self.state.lock() = SyncState::Idle;
    }
}

/// Replaces local data with a remote snapshot, safety snapshot first
pub struct SyncExecutor {
    orchestrator: Arc<BackupOrchestrator>,
    settings: Arc<dyn SettingsStore>,
    dataset: Arc<dyn DatasetStore>,
    transports: Arc<dyn TransportFactory>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    codec: TimestampCodec,
    state: Mutex<SyncState>,
    last_error: Mutex<Option<String>>,
}

impl SyncExecutor {
    pub fn new(
        orchestrator: Arc<BackupOrchestrator>,
        settings: Arc<dyn SettingsStore>,
        dataset: Arc<dyn DatasetStore>,
        transports: Arc<dyn TransportFactory>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orchestrator,
            settings,
            dataset,
            transports,
            events,
            clock,
            codec: TimestampCodec::local(),
            state: Mutex::new(SyncState::Idle),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    pub fn is_syncing(&self) -> bool {
        self.state() != SyncState::Idle
    }

    /// Error of the most recent failed sync
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn try_begin(&self) -> Option<Flight<'_>> {
        let mut state = self.state.lock();
        if *state != SyncState::Idle {
            return None;
        }
        *state = SyncState::SafetyBackupInFlight;
        Some(Flight { state: &self.state })
    }

    /// Restore `name` over the local dataset
    pub async fn sync_from(&self, name: &str, trigger: SyncTrigger) -> Result<SyncOutcome> {
        if !name.ends_with(SNAPSHOT_EXTENSION) || name.contains('/') {
            return Err(SyncError::InvalidInput(format!(
                "'{}' is not a snapshot file name",
                name
            )));
        }

        let Some(flight) = self.try_begin() else {
            tracing::info!(file = %name, "Sync rejected: another sync is in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        };

        self.events.publish(SyncEvent::sync_started(name));
        match self.run(name, trigger, &flight).await {
            Ok(report) => {
                *self.last_error.lock() = None;
                self.events.publish(SyncEvent::sync_completed(name));
                tracing::info!(
                    file = %name,
                    trigger = ?trigger,
                    last_modified = report.last_modified,
                    nodes = report.nodes,
                    "Sync completed"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                flight.enter(SyncState::Failed);
                *self.last_error.lock() = Some(e.to_string());
                self.events.publish(SyncEvent::sync_failed(name, e.to_string()));
                tracing::warn!(file = %name, error = %e, "Sync aborted, local data untouched");
                Err(e)
            }
        }
    }

    async fn run(&self, name: &str, trigger: SyncTrigger, flight: &Flight<'_>) -> Result<SyncReport> {
        let settings = self.settings.load()?;
        if !settings.webdav.is_configured() {
            return Err(SyncError::Config("WebDAV URL is not configured".to_string()));
        }

        flight.enter(SyncState::SafetyBackupInFlight);
        let safety = self
            .orchestrator
            .backup_protecting(BackupReason::PreSyncSafety, Some(name))
            .await?;

        flight.enter(SyncState::Downloading);
        let transport = self.transports.connect(&settings.webdav)?;
        let payload = transport.download(name).await?;

        flight.enter(SyncState::Applying);
        let now = self.clock.now_ms();
        let mut candidate = payload.dataset()?;
        candidate.last_modified = self.restored_timestamp(name, &payload, candidate.last_modified, now);
        candidate.synced_from = Some(name.to_string());
        let synced_at = Utc
            .timestamp_millis_opt(now)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        candidate.synced_at = Some(synced_at.clone());

        self.dataset.replace(&candidate)?;
        // Observers are informed after the write; nothing is rolled back here
        self.events.publish(SyncEvent::data_changed(name));

        Ok(SyncReport {
            file: name.to_string(),
            trigger,
            safety_backup: safety.file().map(str::to_string),
            last_modified: candidate.last_modified,
            synced_at,
            nodes: candidate.node_count(),
        })
    }

    /// Filename timestamp, then `payload.ts`, then the dataset's own stamp,
    /// then now
    fn restored_timestamp(
        &self,
        name: &str,
        payload: &SnapshotPayload,
        existing: i64,
        now: i64,
    ) -> i64 {
        self.codec
            .decode_filename_at(name, now)
            .or(Some(payload.ts).filter(|ts| *ts > 0))
            .or(Some(existing).filter(|ts| *ts > 0))
            .unwrap_or(now)
    }
}
