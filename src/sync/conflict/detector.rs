//! Newer-remote detection
//!
//! Only the timestamp encoded in a snapshot's filename is trusted. Server
//! mtimes drift between servers and are rewritten by copies, so they never
//! decide which snapshot is newest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::Result;
use crate::sync::timestamp::TimestampCodec;
use crate::sync::webdav::TransportFactory;
use crate::types::{LocalDataset, Settings, SnapshotFile};

/// Remote must be strictly more than this far ahead to count as newer
pub const NEWER_THRESHOLD_MS: i64 = 2_000;

/// Outcome of comparing the newest remote snapshot with local data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCheck {
    pub has_newer_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<SnapshotFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_seconds: Option<f64>,
    /// Set when the newest snapshot's name carried no readable timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl RemoteCheck {
    fn nothing_newer() -> Self {
        Self::default()
    }
}

/// Compares the newest real remote snapshot against the local dataset
pub struct ConflictDetector {
    transports: Arc<dyn TransportFactory>,
    clock: Arc<dyn Clock>,
    codec: TimestampCodec,
    threshold_ms: i64,
}

impl ConflictDetector {
    pub fn new(transports: Arc<dyn TransportFactory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transports,
            clock,
            codec: TimestampCodec::local(),
            threshold_ms: NEWER_THRESHOLD_MS,
        }
    }

    /// Set the skew deadband
    pub fn with_threshold_ms(mut self, threshold_ms: i64) -> Self {
        self.threshold_ms = threshold_ms.max(0);
        self
    }

    /// Check whether the remote store holds newer data than `local`.
    ///
    /// Returns `Ok(None)` when WebDAV is not configured.
    pub async fn check_for_newer_remote(
        &self,
        local: &LocalDataset,
        settings: &Settings,
    ) -> Result<Option<RemoteCheck>> {
        if !settings.webdav.is_configured() {
            return Ok(None);
        }

        let transport = self.transports.connect(&settings.webdav)?;
        let files = transport.list().await?;
        let check = self.evaluate(&files, local.last_modified);

        if check.has_newer_data {
            tracing::info!(
                file = check.file.as_ref().map(|f| f.name.as_str()).unwrap_or_default(),
                diff_seconds = check.diff_seconds.unwrap_or_default(),
                "Remote snapshot is newer than local data"
            );
        }
        Ok(Some(check))
    }

    /// Pure comparison over an already fetched listing
    pub fn evaluate(&self, files: &[SnapshotFile], local_modified: i64) -> RemoteCheck {
        let now = self.clock.now_ms();

        let newest = files
            .iter()
            .filter(|f| !f.is_safety())
            .map(|f| (f, self.codec.decode_filename_at(&f.name, now)))
            .max_by_key(|(_, ts)| *ts);

        let (file, remote_time) = match newest {
            None => return RemoteCheck::nothing_newer(),
            Some((file, None)) => {
                tracing::warn!(file = %file.name, "Snapshot name has no decodable timestamp");
                return RemoteCheck {
                    file: Some(file.clone()),
                    local_time: Some(local_modified),
                    parse_error: Some(format!(
                        "cannot decode timestamp from '{}'",
                        file.name
                    )),
                    ..RemoteCheck::nothing_newer()
                };
            }
            Some((file, Some(ts))) => (file, ts),
        };

        let diff = remote_time - local_modified;
        RemoteCheck {
            has_newer_data: diff > self.threshold_ms,
            file: Some(file.clone()),
            local_time: Some(local_modified),
            remote_time: Some(remote_time),
            diff_seconds: Some(diff as f64 / 1000.0),
            parse_error: None,
        }
    }
}
