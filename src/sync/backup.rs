//! Backup orchestration: snapshot naming, upload and retention

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::timestamp::TimestampCodec;
use super::webdav::{SnapshotTransport, TransportFactory};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::storage::{DatasetStore, SettingsStore};
use crate::types::{
    BackupReason, ClientSettings, LocalDataset, Settings, SnapshotFile, SnapshotPayload,
    SNAPSHOT_EXTENSION,
};

/// Why a backup request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No WebDAV URL (background reasons only)
    Unconfigured,
    /// Automatic backups are turned off
    Disabled,
    /// Nothing to back up; an empty upload would bury real history
    EmptyDataset,
}

/// Result of a backup request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BackupOutcome {
    Uploaded {
        file: String,
        /// Old snapshots deleted by retention
        pruned: Vec<String>,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl BackupOutcome {
    pub fn file(&self) -> Option<&str> {
        match self {
            BackupOutcome::Uploaded { file, .. } => Some(file),
            BackupOutcome::Skipped { .. } => None,
        }
    }
}

/// `{clientId}_{prefix}_{yyMMdd_HHmmss_sss}.json`
pub fn snapshot_name(
    client: &ClientSettings,
    reason: BackupReason,
    timestamp_ms: i64,
    codec: &TimestampCodec,
) -> String {
    format!(
        "{}_{}_{}{}",
        client.filename_token(),
        reason.prefix().as_str(),
        codec.encode(timestamp_ms),
        SNAPSHOT_EXTENSION
    )
}

/// Builds snapshots from the local dataset and keeps the remote history
/// within quota
pub struct BackupOrchestrator {
    settings: Arc<dyn SettingsStore>,
    dataset: Arc<dyn DatasetStore>,
    transports: Arc<dyn TransportFactory>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    codec: TimestampCodec,
}

impl BackupOrchestrator {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        dataset: Arc<dyn DatasetStore>,
        transports: Arc<dyn TransportFactory>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            dataset,
            transports,
            events,
            clock,
            codec: TimestampCodec::local(),
        }
    }

    pub fn codec(&self) -> &TimestampCodec {
        &self.codec
    }

    /// Back up the current local dataset.
    ///
    /// Background reasons skip silently when WebDAV is unconfigured or
    /// automatic backups are disabled; user and pre-sync backups fail with
    /// [`SyncError::Config`] instead. Every reason except
    /// [`BackupReason::PreSyncSafety`] skips an empty dataset before any
    /// network call.
    pub async fn backup(&self, reason: BackupReason) -> Result<BackupOutcome> {
        self.backup_protecting(reason, None).await
    }

    /// [`backup`](Self::backup), but rotation never deletes `keep`.
    ///
    /// Used by the sync workflow so the safety backup cannot rotate away the
    /// snapshot about to be downloaded.
    pub async fn backup_protecting(
        &self,
        reason: BackupReason,
        keep: Option<&str>,
    ) -> Result<BackupOutcome> {
        let settings = self.settings.load()?;

        if !settings.webdav.is_configured() {
            if reason.is_background() {
                tracing::debug!(%reason, "Backup skipped: WebDAV not configured");
                return Ok(BackupOutcome::Skipped {
                    reason: SkipReason::Unconfigured,
                });
            }
            return Err(SyncError::Config("WebDAV URL is not configured".to_string()));
        }

        if reason.is_background() && !settings.backup.enabled {
            tracing::debug!(%reason, "Backup skipped: automatic backups disabled");
            return Ok(BackupOutcome::Skipped {
                reason: SkipReason::Disabled,
            });
        }

        let dataset = self.dataset.load()?;
        if reason != BackupReason::PreSyncSafety && dataset.is_empty() {
            tracing::info!(%reason, "Backup skipped: local dataset is empty");
            return Ok(BackupOutcome::Skipped {
                reason: SkipReason::EmptyDataset,
            });
        }

        let notify = match reason {
            BackupReason::PreSyncSafety => false,
            BackupReason::User => true,
            BackupReason::Scheduled | BackupReason::MutationTriggered => settings.backup.notify,
        };

        match self.upload_and_rotate(&settings, &dataset, reason, keep).await {
            Ok(outcome) => {
                if let Some(file) = outcome.file() {
                    self.events
                        .publish(SyncEvent::backup_completed(file, reason, notify));
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(%reason, error = %e, "Backup failed");
                self.events
                    .publish(SyncEvent::backup_failed(reason, e.to_string(), notify));
                Err(e)
            }
        }
    }

    async fn upload_and_rotate(
        &self,
        settings: &Settings,
        dataset: &LocalDataset,
        reason: BackupReason,
        keep: Option<&str>,
    ) -> Result<BackupOutcome> {
        let transport = self.transports.connect(&settings.webdav)?;

        let ts = if dataset.last_modified > 0 {
            dataset.last_modified
        } else {
            self.clock.now_ms()
        };
        let file = snapshot_name(&settings.client, reason, ts, &self.codec);
        let payload = SnapshotPayload::new(dataset, ts)?;

        transport.upload(&file, &payload).await?;
        tracing::info!(
            %reason,
            file = %file,
            nodes = dataset.node_count(),
            "Backup uploaded"
        );

        let pruned = self.rotate(transport.as_ref(), settings, keep).await;
        Ok(BackupOutcome::Uploaded { file, pruned })
    }

    /// Delete the oldest snapshots of this client beyond `maxSnapshots`.
    ///
    /// Best-effort: listing or deletion failures are logged and skipped.
    /// `keep` is left out of the count and never deleted, so the quota can be
    /// exceeded by one until the next backup.
    async fn rotate(
        &self,
        transport: &dyn SnapshotTransport,
        settings: &Settings,
        keep: Option<&str>,
    ) -> Vec<String> {
        let max = settings.backup.max_snapshots;
        if max == 0 {
            return Vec::new();
        }

        let files = match transport.list().await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "Retention skipped: listing failed");
                return Vec::new();
            }
        };

        let namespace = format!("{}_", settings.client.filename_token());
        let mut own: Vec<SnapshotFile> = files
            .into_iter()
            .filter(|f| f.name.starts_with(&namespace) && Some(f.name.as_str()) != keep)
            .collect();
        if own.len() <= max {
            return Vec::new();
        }

        let now = self.clock.now_ms();
        own.sort_by_key(|f| {
            (
                f.lastmod_ms(),
                self.codec.decode_filename_at(&f.name, now).unwrap_or(0),
                f.name.clone(),
            )
        });

        let surplus = own.len() - max;
        let mut pruned = Vec::with_capacity(surplus);
        for file in own.into_iter().take(surplus) {
            match transport.remove(&file.name).await {
                Ok(()) => pruned.push(file.name),
                Err(e) => {
                    tracing::warn!(file = %file.name, error = %e, "Failed to delete rotated snapshot")
                }
            }
        }
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), max, "Rotated old snapshots");
        }
        pruned
    }
}
