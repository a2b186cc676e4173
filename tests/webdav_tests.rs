//! End-to-end tests against an in-process WebDAV server
//!
//! The fake server keeps objects in memory, enforces Basic auth, answers
//! PROPFIND with a multistatus document and returns 409 for PUTs into a
//! collection that does not exist yet. Every request's method is recorded.
//!
//! Run with: cargo test --test webdav_tests

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use pretty_assertions::assert_eq;

use marksync::clock::SystemClock;
use marksync::storage::{DatasetStore, JsonFileStore, SettingsStore};
use marksync::sync::{
    SnapshotTransport, SyncOutcome, TransportFactory, ValidationCache, WebDavConnector,
};
use marksync::types::*;
use marksync::{SyncError, SyncService};

const USER: &str = "alice";
const PASSWORD: &str = "s3cret";
const COLLECTION: &str = "/dav/marks/";

#[derive(Default)]
struct DavState {
    collection_exists: bool,
    objects: BTreeMap<String, (Vec<u8>, DateTime<Utc>)>,
    methods: Vec<String>,
    forbid_listing: bool,
    forbid_delete: bool,
}

#[derive(Clone, Default)]
struct FakeDav {
    state: Arc<Mutex<DavState>>,
}

impl FakeDav {
    fn with_collection() -> Self {
        let dav = Self::default();
        dav.state.lock().collection_exists = true;
        dav
    }

    fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .methods
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }

    fn names(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }
}

fn multistatus(entries: &[(String, Option<(usize, DateTime<Utc>)>)]) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><d:multistatus xmlns:d="DAV:">"#);
    for (href, file) in entries {
        body.push_str(&format!("<d:response><d:href>{}</d:href><d:propstat><d:prop>", href));
        if let Some((size, modified)) = file {
            body.push_str(&format!(
                "<d:getcontentlength>{}</d:getcontentlength><d:getlastmodified>{}</d:getlastmodified>",
                size,
                modified.to_rfc2822()
            ));
        }
        body.push_str("</d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>");
    }
    body.push_str("</d:multistatus>");
    body
}

async fn dav_handler(
    State(dav): State<FakeDav>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", USER, PASSWORD))
    );
    if headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut state = dav.state.lock();
    state.methods.push(method.as_str().to_string());

    let path = percent_decode_str(uri.path()).decode_utf8_lossy().into_owned();
    let is_collection = path == COLLECTION || format!("{}/", path) == COLLECTION;
    let name = path.strip_prefix(COLLECTION).unwrap_or_default().to_string();

    match (method.as_str(), is_collection) {
        ("PROPFIND", true) => {
            if !state.collection_exists {
                return StatusCode::NOT_FOUND.into_response();
            }
            let depth = headers.get("depth").and_then(|v| v.to_str().ok()).unwrap_or("1");
            if depth != "0" && state.forbid_listing {
                return StatusCode::FORBIDDEN.into_response();
            }
            let mut entries = vec![(COLLECTION.to_string(), None)];
            if depth != "0" {
                for (name, (bytes, modified)) in &state.objects {
                    let href = format!("{}{}", COLLECTION, utf8_percent_encode(name, NON_ALPHANUMERIC));
                    entries.push((href, Some((bytes.len(), *modified))));
                }
            }
            Response::builder()
                .status(StatusCode::MULTI_STATUS)
                .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
                .body(Body::from(multistatus(&entries)))
                .unwrap()
        }
        ("MKCOL", true) => {
            if state.collection_exists {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            state.collection_exists = true;
            StatusCode::CREATED.into_response()
        }
        ("PUT", false) => {
            if !state.collection_exists {
                return StatusCode::CONFLICT.into_response();
            }
            state.objects.insert(name, (body.to_vec(), Utc::now()));
            StatusCode::CREATED.into_response()
        }
        ("GET", false) => match state.objects.get(&name) {
            Some((bytes, _)) => Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(bytes.clone()))
                .unwrap(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        ("DELETE", false) if state.forbid_delete => StatusCode::FORBIDDEN.into_response(),
        ("DELETE", false) => match state.objects.remove(&name) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_dav(dav: FakeDav) -> SocketAddr {
    spawn(Router::new().fallback(dav_handler).with_state(dav)).await
}

fn webdav_settings(addr: SocketAddr) -> WebDavSettings {
    WebDavSettings {
        url: format!("http://{}{}", addr, COLLECTION),
        username: USER.to_string(),
        password: PASSWORD.to_string(),
        relay_url: None,
    }
}

fn connector() -> WebDavConnector {
    let cache = ValidationCache::new(Default::default(), Arc::new(SystemClock));
    WebDavConnector::new(Arc::new(cache)).unwrap()
}

fn payload(title: &str, ts: i64) -> SnapshotPayload {
    let dataset = LocalDataset {
        bookmarks: vec![BookmarkNode {
            id: "1".into(),
            title: title.into(),
            url: Some("https://example.com/".into()),
            ..Default::default()
        }],
        last_modified: ts,
        ..Default::default()
    };
    SnapshotPayload::new(&dataset, ts).unwrap()
}

mod transport {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn probe_results_are_cached_until_forced() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let transport = connector().connect(&webdav_settings(addr)).unwrap();

        assert!(transport.probe_reachable(false).await.unwrap().success);
        assert!(transport.probe_reachable(false).await.unwrap().success);
        assert_eq!(dav.count("PROPFIND"), 1);

        transport.probe_reachable(true).await.unwrap();
        assert_eq!(dav.count("PROPFIND"), 2);
    }

    #[tokio::test]
    async fn wrong_credentials_are_an_auth_error_and_not_cached() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let mut settings = webdav_settings(addr);
        settings.password = "wrong".into();
        let transport = connector().connect(&settings).unwrap();

        for _ in 0..2 {
            let err = transport.probe_reachable(false).await.unwrap_err();
            assert!(matches!(err, SyncError::Auth { status: 401 }));
        }
        assert!(matches!(
            transport.upload("a.json", &payload("x", 1)).await,
            Err(SyncError::Auth { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = connector().connect(&webdav_settings(addr)).unwrap();
        let err = transport.probe_reachable(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn upload_creates_missing_collection_then_round_trips() {
        let dav = FakeDav::default();
        let addr = start_dav(dav.clone()).await;
        let transport = connector().connect(&webdav_settings(addr)).unwrap();
        let name = "cid_snapshot_user_231114_221320_000.json";
        let sent = payload("Home", 1_700_000_000_000);

        transport.upload(name, &sent).await.unwrap();
        assert_eq!(dav.count("PUT"), 2);
        assert_eq!(dav.count("MKCOL"), 1);

        let listed = transport.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, name);
        assert!(listed[0].size > 0);
        assert!(listed[0].lastmod.is_some());

        assert_eq!(transport.download(name).await.unwrap(), sent);

        transport.remove(name).await.unwrap();
        assert!(transport.list().await.unwrap().is_empty());
        assert!(matches!(
            transport.download(name).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn names_with_reserved_characters_survive_listing() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let transport = connector().connect(&webdav_settings(addr)).unwrap();
        let name = "my laptop_snapshot_user_1700000000000.json";

        transport.upload(name, &payload("x", 1)).await.unwrap();
        assert_eq!(dav.names(), vec![name.to_string()]);
        assert_eq!(transport.list().await.unwrap()[0].name, name);
    }

    #[tokio::test]
    async fn forbidden_listing_degrades_to_empty() {
        let dav = FakeDav::with_collection();
        dav.state.lock().forbid_listing = true;
        let addr = start_dav(dav.clone()).await;
        let transport = connector().connect(&webdav_settings(addr)).unwrap();

        transport.upload("a.json", &payload("x", 1)).await.unwrap();
        assert!(transport.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_probe_cleans_up_after_itself() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let transport = connector().connect(&webdav_settings(addr)).unwrap();

        assert!(transport.probe_writable().await);
        assert_eq!(dav.count("PUT"), 1);
        assert_eq!(dav.count("DELETE"), 1);
        assert!(dav.names().is_empty());
    }

    #[tokio::test]
    async fn write_probe_succeeds_when_cleanup_is_refused() {
        let dav = FakeDav::with_collection();
        dav.state.lock().forbid_delete = true;
        let addr = start_dav(dav.clone()).await;
        let settings = webdav_settings(addr);
        let connector = connector();
        let transport = connector.connect(&settings).unwrap();

        assert!(transport.probe_writable().await);
        assert_eq!(dav.count("DELETE"), 1);

        let leftover = dav.names();
        assert_eq!(leftover.len(), 1);
        assert!(leftover[0].ends_with(".tmp"));
        assert!(transport.list().await.unwrap().is_empty());

        let cached = connector.cache().get(&ValidationCache::key_for(&settings)).unwrap();
        assert_eq!(cached.can_write, Some(true));
    }
}

#[cfg(feature = "relay")]
mod relay {
    use super::*;
    use pretty_assertions::assert_eq;
    use marksync::relay::{RelayConfig, RelayServer, RelayState};

    async fn start_relay() -> SocketAddr {
        let state = RelayState::new(RelayConfig::default()).unwrap();
        spawn(RelayServer::router(state)).await
    }

    #[tokio::test]
    async fn transport_works_through_relay() {
        let dav = FakeDav::default();
        let dav_addr = start_dav(dav.clone()).await;
        let relay_addr = start_relay().await;

        let mut settings = webdav_settings(dav_addr);
        settings.relay_url = Some(format!("http://{}/", relay_addr));
        let transport = connector().connect(&settings).unwrap();

        let sent = payload("Relayed", 1_700_000_000_000);
        transport.upload("r.json", &sent).await.unwrap();
        assert!(transport.probe_reachable(true).await.unwrap().success);
        assert_eq!(transport.list().await.unwrap()[0].name, "r.json");
        assert_eq!(transport.download("r.json").await.unwrap(), sent);
        transport.remove("r.json").await.unwrap();

        // The upstream saw the real methods, not the POSTs on the wire
        assert_eq!(dav.count("POST"), 0);
        assert_eq!(dav.count("PUT"), 2);
        assert_eq!(dav.count("MKCOL"), 1);
        assert_eq!(dav.count("PROPFIND"), 2);
        assert_eq!(dav.count("GET"), 1);
        assert_eq!(dav.count("DELETE"), 1);
    }

    #[tokio::test]
    async fn relay_mirrors_upstream_auth_failures() {
        let dav = FakeDav::with_collection();
        let dav_addr = start_dav(dav).await;
        let relay_addr = start_relay().await;

        let mut settings = webdav_settings(dav_addr);
        settings.password = "nope".into();
        settings.relay_url = Some(format!("http://{}/", relay_addr));
        let transport = connector().connect(&settings).unwrap();

        assert!(matches!(
            transport.probe_reachable(true).await,
            Err(SyncError::Auth { status: 401 })
        ));
    }
}

mod service {
    use super::*;
    use pretty_assertions::assert_eq;

    fn service_for(addr: SocketAddr, dir: &std::path::Path, client: &str) -> SyncService {
        let store = Arc::new(JsonFileStore::open(dir));
        let mut settings = Settings::first_run();
        settings.webdav = webdav_settings(addr);
        settings.backup.max_snapshots = 3;
        settings.client.identifier = client.to_string();
        SettingsStore::save(store.as_ref(), &settings).unwrap();

        SyncService::new(
            store.clone(),
            store,
            Arc::new(connector()),
            Arc::new(SystemClock),
        )
    }

    fn write_dataset(dir: &std::path::Path, title: &str, last_modified: i64) {
        let store = JsonFileStore::open(dir);
        store
            .replace(&payload(title, last_modified).dataset().unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn two_clients_hand_data_over_through_the_server() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let laptop_dir = tempfile::tempdir().unwrap();
        let phone_dir = tempfile::tempdir().unwrap();

        write_dataset(laptop_dir.path(), "From laptop", 1_700_000_500_000);
        write_dataset(phone_dir.path(), "From phone", 1_700_000_000_000);
        let laptop = service_for(addr, laptop_dir.path(), "laptop");
        let phone = service_for(addr, phone_dir.path(), "phone");

        let uploaded = laptop.backup(BackupReason::User).await.unwrap();
        let file = uploaded.file().unwrap().to_string();

        let check = phone.check_remote().await.unwrap().unwrap();
        assert!(check.has_newer_data);
        assert_eq!(check.file.as_ref().unwrap().name, file);
        assert_eq!(check.diff_seconds, Some(500.0));

        match phone.sync_from(&file).await.unwrap() {
            SyncOutcome::Completed(report) => {
                let safety = report.safety_backup.unwrap();
                assert!(safety.starts_with("phone_sync_backup_"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let restored = DatasetStore::load(&JsonFileStore::open(phone_dir.path())).unwrap();
        assert_eq!(restored.bookmarks[0].title, "From laptop");
        assert_eq!(restored.last_modified, 1_700_000_500_000);
        assert_eq!(restored.synced_from.as_deref(), Some(file.as_str()));
        assert!(!phone.check_remote().await.unwrap().unwrap().has_newer_data);
    }

    #[tokio::test]
    async fn failed_download_leaves_local_file_untouched() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), "Keep me", 1_700_000_000_000);
        let service = service_for(addr, dir.path(), "cid");
        let before = std::fs::read(dir.path().join("bookmarks.json")).unwrap();

        let result = service.restore("missing_snapshot_user_1700000000000.json").await;

        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert_eq!(std::fs::read(dir.path().join("bookmarks.json")).unwrap(), before);
        let names = dav.names();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("cid_sync_backup_"));
    }

    #[tokio::test]
    async fn retention_keeps_newest_per_client() {
        let dav = FakeDav::with_collection();
        let addr = start_dav(dav.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let service = service_for(addr, dir.path(), "cid");

        let mut uploaded = Vec::new();
        for i in 0..5 {
            write_dataset(dir.path(), "x", 1_700_000_000_000 + i * 60_000);
            let outcome = service.backup(BackupReason::User).await.unwrap();
            uploaded.push(outcome.file().unwrap().to_string());
        }

        let mut remaining = dav.names();
        remaining.sort();
        let mut expected = uploaded[2..].to_vec();
        expected.sort();
        assert_eq!(remaining, expected);
    }
}
