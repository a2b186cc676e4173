//! Core types for Marksync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File extension shared by every snapshot on the remote store
pub const SNAPSHOT_EXTENSION: &str = ".json";

/// Current snapshot payload version
pub const PAYLOAD_VERSION: u32 = 1;

/// Keys stripped from the dataset before it leaves the machine
pub const LOCAL_ONLY_KEYS: &[&str] = &["settings", "history", "visitHistory", "recentHistory"];

// =============================================================================
// Settings
// =============================================================================

/// User settings, re-read before every operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub webdav: WebDavSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Settings {
    /// Fresh settings for a first run, with a generated client identifier
    pub fn first_run() -> Self {
        Self {
            client: ClientSettings::generate(),
            ..Default::default()
        }
    }
}

/// WebDAV endpoint and credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebDavSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Same-origin relay endpoint; when set all requests go through it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
}

impl WebDavSettings {
    /// Whether enough is configured to talk to a server
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Collection URL guaranteed to end with a slash
    pub fn base_url(&self) -> String {
        let url = self.url.trim();
        if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{}/", url)
        }
    }
}

/// Backup policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_frequency_hours")]
    pub frequency_hours: f64,
    /// Retention quota per client namespace (0 = unlimited)
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Show notifications for background (scheduled/mutation) backups
    #[serde(default)]
    pub notify: bool,
    /// Interval for background remote checks; absent disables them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_check_minutes: Option<u64>,
}

fn default_frequency_hours() -> f64 {
    24.0
}

fn default_max_snapshots() -> usize {
    10
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency_hours: default_frequency_hours(),
            max_snapshots: default_max_snapshots(),
            notify: false,
            remote_check_minutes: None,
        }
    }
}

/// Identity of this installation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    #[serde(default)]
    pub identifier: String,
}

impl ClientSettings {
    /// Generate a short random identifier
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            identifier: id[..8].to_string(),
        }
    }

    /// Identifier made safe for use as the leading filename segment.
    ///
    /// Underscores separate filename fields, so they are replaced along with
    /// anything outside `[A-Za-z0-9-]`.
    pub fn filename_token(&self) -> String {
        let token: String = self
            .identifier
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if token.is_empty() {
            "client".to_string()
        } else {
            token
        }
    }
}

// =============================================================================
// Local dataset
// =============================================================================

/// A bookmark or folder node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkNode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Icon reference; `data:` URIs are inline images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BookmarkNode>,
    /// Fields owned by the bookmark model that this engine passes through
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BookmarkNode {
    fn strip_inline_icons(&mut self) {
        if self
            .icon
            .as_deref()
            .is_some_and(|icon| icon.trim_start().starts_with("data:"))
        {
            self.icon = None;
        }
        for child in &mut self.children {
            child.strip_inline_icons();
        }
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(BookmarkNode::count).sum::<usize>()
    }
}

/// The local bookmark tree plus its modification stamp
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDataset {
    #[serde(default)]
    pub bookmarks: Vec<BookmarkNode>,
    /// Epoch milliseconds of the last genuine mutation or restore
    #[serde(default)]
    pub last_modified: i64,
    /// Snapshot this dataset was restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_from: Option<String>,
    /// ISO-8601 time of the restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LocalDataset {
    /// No bookmark or folder anywhere in the tree
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    /// Total number of nodes in the tree
    pub fn node_count(&self) -> usize {
        self.bookmarks.iter().map(BookmarkNode::count).sum()
    }

    /// Record a local mutation
    pub fn touch(&mut self, now_ms: i64) {
        self.last_modified = now_ms;
    }

    /// Copy safe to upload: settings, history and inline icons removed
    pub fn sanitized(&self) -> Self {
        let mut clean = self.clone();
        for key in LOCAL_ONLY_KEYS {
            clean.extra.remove(*key);
        }
        for node in &mut clean.bookmarks {
            node.strip_inline_icons();
        }
        clean
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Body stored in each remote snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    #[serde(default = "default_payload_version")]
    pub version: u32,
    /// Epoch milliseconds when the payload was built
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

fn default_payload_version() -> u32 {
    PAYLOAD_VERSION
}

impl SnapshotPayload {
    /// Wrap a sanitized dataset
    pub fn new(dataset: &LocalDataset, ts: i64) -> crate::Result<Self> {
        Ok(Self {
            version: PAYLOAD_VERSION,
            ts,
            data: Some(serde_json::to_value(dataset.sanitized())?),
        })
    }

    /// Dataset carried by the payload, empty when absent
    pub fn dataset(&self) -> crate::Result<LocalDataset> {
        match &self.data {
            Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
            _ => Ok(LocalDataset::default()),
        }
    }
}

/// One entry of a remote collection listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub name: String,
    /// Server-reported mtime; not trusted for ordering across servers
    pub lastmod: Option<DateTime<Utc>>,
    pub size: u64,
}

impl SnapshotFile {
    /// Server mtime in epoch milliseconds (0 when missing)
    pub fn lastmod_ms(&self) -> i64 {
        self.lastmod.map(|t| t.timestamp_millis()).unwrap_or(0)
    }

    /// Whether this is a pre-restore safety snapshot
    pub fn is_safety(&self) -> bool {
        self.name.contains(SnapshotPrefix::SyncBackup.as_str())
    }
}

/// Why a backup was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupReason {
    Scheduled,
    User,
    MutationTriggered,
    PreSyncSafety,
}

impl BackupReason {
    pub fn prefix(&self) -> SnapshotPrefix {
        match self {
            BackupReason::Scheduled => SnapshotPrefix::Schedule,
            BackupReason::User => SnapshotPrefix::User,
            BackupReason::MutationTriggered => SnapshotPrefix::Handle,
            BackupReason::PreSyncSafety => SnapshotPrefix::SyncBackup,
        }
    }

    /// Triggered without the user asking for it
    pub fn is_background(&self) -> bool {
        matches!(
            self,
            BackupReason::Scheduled | BackupReason::MutationTriggered
        )
    }
}

impl std::fmt::Display for BackupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupReason::Scheduled => "scheduled",
            BackupReason::User => "user",
            BackupReason::MutationTriggered => "mutation-triggered",
            BackupReason::PreSyncSafety => "pre-sync-safety",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BackupReason {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" | "schedule" => Ok(BackupReason::Scheduled),
            "user" | "manual" => Ok(BackupReason::User),
            "mutation-triggered" | "mutation" | "handle" => Ok(BackupReason::MutationTriggered),
            "pre-sync-safety" | "safety" => Ok(BackupReason::PreSyncSafety),
            other => Err(crate::SyncError::InvalidInput(format!(
                "unknown backup reason: {}",
                other
            ))),
        }
    }
}

/// Purpose segment of a snapshot filename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotPrefix {
    Schedule,
    User,
    Handle,
    SyncBackup,
}

impl SnapshotPrefix {
    pub const ALL: [SnapshotPrefix; 4] = [
        SnapshotPrefix::Schedule,
        SnapshotPrefix::User,
        SnapshotPrefix::Handle,
        SnapshotPrefix::SyncBackup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotPrefix::Schedule => "snapshot_schedule",
            SnapshotPrefix::User => "snapshot_user",
            SnapshotPrefix::Handle => "snapshot_handle",
            SnapshotPrefix::SyncBackup => "sync_backup",
        }
    }

    /// Find the prefix embedded in a snapshot filename
    pub fn detect(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| name.contains(p.as_str()))
    }
}

/// Outcome of a reachability/writability probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_write: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            can_write: None,
            error: Some(error.into()),
        }
    }
}
