//! Collaborator-facing facade over the sync engine
//!
//! UI shells and the CLI talk to the engine through [`SyncService`], either
//! by calling its methods or by sending serialized [`Request`]s and reading
//! back [`Response`]s.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::storage::{DatasetStore, JsonFileStore, SettingsStore};
use crate::sync::{
    BackupOrchestrator, BackupOutcome, ConflictDetector, RemoteCheck, Scheduler, SyncExecutor,
    SyncOutcome, SyncTrigger, TransportFactory, ValidationCache, ValidationCacheConfig,
    WebDavConnector,
};
use crate::types::{BackupReason, ProbeResult, SnapshotFile, WebDavSettings};

/// Wiring of stores, transport factory and engine components
pub struct SyncService {
    settings: Arc<dyn SettingsStore>,
    dataset: Arc<dyn DatasetStore>,
    transports: Arc<dyn TransportFactory>,
    events: EventBus,
    orchestrator: Arc<BackupOrchestrator>,
    detector: Arc<ConflictDetector>,
    executor: Arc<SyncExecutor>,
}

impl SyncService {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        dataset: Arc<dyn DatasetStore>,
        transports: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventBus::new();
        let orchestrator = Arc::new(BackupOrchestrator::new(
            settings.clone(),
            dataset.clone(),
            transports.clone(),
            events.clone(),
            clock.clone(),
        ));
        let detector = Arc::new(ConflictDetector::new(transports.clone(), clock.clone()));
        let executor = Arc::new(SyncExecutor::new(
            orchestrator.clone(),
            settings.clone(),
            dataset.clone(),
            transports.clone(),
            events.clone(),
            clock,
        ));

        Self {
            settings,
            dataset,
            transports,
            events,
            orchestrator,
            detector,
            executor,
        }
    }

    /// Service over JSON files in `data_dir` talking to real WebDAV servers
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let store = Arc::new(JsonFileStore::open(data_dir));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(ValidationCache::new(
            ValidationCacheConfig::default(),
            clock.clone(),
        ));
        let connector = Arc::new(WebDavConnector::new(cache)?);
        Ok(Self::new(store.clone(), store, connector, clock))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings_store(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    pub fn dataset_store(&self) -> &Arc<dyn DatasetStore> {
        &self.dataset
    }

    pub fn orchestrator(&self) -> &Arc<BackupOrchestrator> {
        &self.orchestrator
    }

    pub fn executor(&self) -> &Arc<SyncExecutor> {
        &self.executor
    }

    /// Scheduler sharing this service's components
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.orchestrator.clone(),
            self.detector.clone(),
            self.settings.clone(),
            self.dataset.clone(),
            self.events.clone(),
        )
    }

    pub async fn backup(&self, source: BackupReason) -> Result<BackupOutcome> {
        self.orchestrator.backup(source).await
    }

    /// Remote snapshots, most recently written first
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotFile>> {
        let settings = self.settings.load()?;
        if !settings.webdav.is_configured() {
            return Err(SyncError::Config("WebDAV URL is not configured".to_string()));
        }
        let transport = self.transports.connect(&settings.webdav)?;
        transport.list().await
    }

    /// Restore a snapshot the user picked
    pub async fn restore(&self, name: &str) -> Result<SyncOutcome> {
        self.executor.sync_from(name, SyncTrigger::Restore).await
    }

    /// `None` when WebDAV is not configured
    pub async fn check_remote(&self) -> Result<Option<RemoteCheck>> {
        let settings = self.settings.load()?;
        let local = self.dataset.load()?;
        self.detector.check_for_newer_remote(&local, &settings).await
    }

    /// Adopt the newer remote snapshot reported by [`Self::check_remote`]
    pub async fn sync_from(&self, name: &str) -> Result<SyncOutcome> {
        self.executor.sync_from(name, SyncTrigger::RemoteNewer).await
    }

    /// Check a candidate configuration before it is saved.
    ///
    /// A malformed URL or an unreachable server yields `success: false` with
    /// the error message; a missing URL is an error.
    pub async fn test_connection(&self, config: &WebDavSettings) -> Result<ProbeResult> {
        if !config.is_configured() {
            return Err(SyncError::Config("WebDAV URL is not configured".to_string()));
        }
        let transport = match self.transports.connect(config) {
            Ok(transport) => transport,
            Err(SyncError::InvalidInput(message)) => return Ok(ProbeResult::failed(message)),
            Err(e) => return Err(e),
        };

        match transport.probe_reachable(true).await {
            Ok(mut result) => {
                result.can_write = Some(transport.probe_writable().await);
                Ok(result)
            }
            Err(e) => Ok(ProbeResult::failed(e.to_string())),
        }
    }

    /// Dispatch a serialized request
    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Backup { source } => match source.as_deref().unwrap_or("user").parse() {
                Ok(reason) => to_value(self.backup(reason).await),
                Err(e) => Err(e),
            },
            Request::ListSnapshots => to_value(self.list_snapshots().await),
            Request::Restore { name } => to_value(self.restore(&name).await),
            Request::CheckRemote => to_value(self.check_remote().await),
            Request::SyncFrom { name } => to_value(self.sync_from(&name).await),
            Request::TestConnection { config } => to_value(self.test_connection(&config).await),
        };

        match result {
            Ok(value) => Response::success(value),
            Err(e) => Response::from_error(&e),
        }
    }
}

fn to_value<T: Serialize>(result: Result<T>) -> Result<Value> {
    Ok(serde_json::to_value(result?)?)
}

/// Request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Backup {
        #[serde(default)]
        source: Option<String>,
    },
    ListSnapshots,
    Restore {
        name: String,
    },
    CheckRemote,
    SyncFrom {
        name: String,
    },
    TestConnection {
        config: WebDavSettings,
    },
}

/// Error object of a failed [`Response`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(err: &SyncError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                status: err.status(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use crate::sync::webdav::memory::MemoryOp;
    use crate::sync::{MemoryConnector, MemoryTransport};
    use crate::types::{BookmarkNode, LocalDataset, Settings};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;

    fn service(configured: bool) -> (SyncService, Arc<MemoryTransport>, Arc<MemoryStore>) {
        let mut settings = Settings::default();
        if configured {
            settings.webdav.url = "https://dav.example.com/".into();
        }
        settings.client.identifier = "cid".into();
        let dataset = LocalDataset {
            bookmarks: vec![BookmarkNode {
                id: "1".into(),
                title: "One".into(),
                ..Default::default()
            }],
            last_modified: T0,
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::with(&dataset, settings).unwrap());
        let remote = Arc::new(MemoryTransport::new());
        let service = SyncService::new(
            store.clone(),
            store.clone(),
            Arc::new(MemoryConnector::new(remote.clone())),
            Arc::new(ManualClock::new(T0 + 60_000)),
        );
        (service, remote, store)
    }

    #[tokio::test]
    async fn test_backup_then_list_via_envelope() {
        let (service, _remote, _store) = service(true);

        let request: Request = serde_json::from_value(json!({"action": "backup"})).unwrap();
        let response = service.handle(request).await;
        assert!(response.success);
        let file = response.result.unwrap()["file"].as_str().unwrap().to_string();
        assert!(file.starts_with("cid_snapshot_user_"));

        let response = service.handle(Request::ListSnapshots).await;
        let listed = response.result.unwrap();
        assert_eq!(listed[0]["name"], json!(file));
    }

    #[tokio::test]
    async fn test_unconfigured_list_is_a_config_error() {
        let (service, _remote, _store) = service(false);
        let response = service.handle(Request::ListSnapshots).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "config_error");
    }

    #[tokio::test]
    async fn test_unknown_backup_source_is_rejected() {
        let (service, remote, _store) = service(true);
        let response = service
            .handle(Request::Backup {
                source: Some("nightly".into()),
            })
            .await;
        assert_eq!(response.error.unwrap().code, "invalid_input");
        assert_eq!(remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_check_remote_then_sync_from() {
        let (service, remote, store) = service(true);
        let name = crate::sync::snapshot_name(
            &crate::types::ClientSettings {
                identifier: "laptop".into(),
            },
            BackupReason::User,
            T0 + 30_000,
            service.orchestrator().codec(),
        );
        remote.insert_raw(name.clone(), br#"{"version":1,"ts":0,"data":{"bookmarks":[]}}"#.to_vec());

        let check = service.check_remote().await.unwrap().unwrap();
        assert!(check.has_newer_data);
        assert_eq!(check.file.as_ref().unwrap().name, name);

        let outcome = service.sync_from(&name).await.unwrap();
        match outcome {
            SyncOutcome::Completed(report) => {
                assert_eq!(report.trigger, SyncTrigger::RemoteNewer);
                assert!(report.safety_backup.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(store.dataset_writes(), 1);
        assert!(!service.check_remote().await.unwrap().unwrap().has_newer_data);
    }

    #[tokio::test]
    async fn test_connection_reports_probe_results() {
        let (service, remote, _store) = service(false);
        let config = WebDavSettings {
            url: "https://dav.example.com/".into(),
            ..Default::default()
        };

        let result = service.test_connection(&config).await.unwrap();
        assert!(result.success);
        assert_eq!(result.can_write, Some(true));

        remote.fail(MemoryOp::Probe);
        let result = service.test_connection(&config).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());

        let response = service
            .handle(Request::TestConnection {
                config: WebDavSettings::default(),
            })
            .await;
        assert_eq!(response.error.unwrap().code, "config_error");
    }

    #[tokio::test]
    async fn test_connection_reports_malformed_url_inline() {
        let (service, _remote, store) = service(false);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(ValidationCache::new(Default::default(), clock.clone()));
        let service = SyncService::new(
            store.clone(),
            store,
            Arc::new(WebDavConnector::new(cache).unwrap()),
            clock,
        );

        for url in ["not a url", "ftp://dav.example.com/"] {
            let config = WebDavSettings {
                url: url.into(),
                ..Default::default()
            };
            let result = service.test_connection(&config).await.unwrap();
            assert!(!result.success);
            assert!(result.error.is_some());
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request =
            serde_json::from_str(r#"{"action":"syncFrom","name":"a.json"}"#).unwrap();
        assert!(matches!(request, Request::SyncFrom { ref name } if name == "a.json"));

        let response = Response::from_error(&SyncError::Auth { status: 401 });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], "auth_error");
        assert_eq!(json["error"]["status"], 401);
        assert!(json.get("result").is_none());
    }
}
