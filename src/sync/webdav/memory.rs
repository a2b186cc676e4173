//! In-memory snapshot store
//!
//! Behaves like a WebDAV collection without a network: uploads overwrite by
//! name, every write bumps a monotonically increasing server mtime, and
//! individual operations can be made to fail. Used by tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use super::{SnapshotTransport, TransportFactory};
use crate::error::{Result, SyncError};
use crate::types::{ProbeResult, SnapshotFile, SnapshotPayload, WebDavSettings, SNAPSHOT_EXTENSION};

const MTIME_ORIGIN_MS: i64 = 1_700_000_000_000;

/// Operation kinds that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Probe,
    List,
    Upload,
    Download,
    Remove,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    mtime_ms: i64,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    writes: i64,
    calls: Vec<MemoryOp>,
    failing: HashSet<MemoryOp>,
    failing_names: HashSet<String>,
}

/// Collection kept in process memory
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail with a 500
    pub fn fail(&self, op: MemoryOp) {
        self.state.lock().failing.insert(op);
    }

    /// Make removal of one specific file fail
    pub fn fail_remove_of(&self, name: impl Into<String>) {
        self.state.lock().failing_names.insert(name.into());
    }

    pub fn recover(&self, op: MemoryOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Store a raw object, as another client or an older version would have
    pub fn insert_raw(&self, name: impl Into<String>, body: Vec<u8>) {
        let mut state = self.state.lock();
        state.writes += 1;
        let mtime_ms = MTIME_ORIGIN_MS + state.writes * 1000;
        state.objects.insert(name.into(), StoredObject { body, mtime_ms });
    }

    pub fn insert_payload(&self, name: impl Into<String>, payload: &SnapshotPayload) {
        let body = serde_json::to_vec(payload).unwrap_or_default();
        self.insert_raw(name, body);
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    pub fn payload(&self, name: &str) -> Option<SnapshotPayload> {
        let state = self.state.lock();
        let object = state.objects.get(name)?;
        serde_json::from_slice(&object.body).ok()
    }

    /// Number of calls of `op` so far (including failed ones)
    pub fn calls(&self, op: MemoryOp) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn enter(&self, op: MemoryOp) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(op);
        if state.failing.contains(&op) {
            return Err(SyncError::protocol(500, format!("{:?} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotTransport for MemoryTransport {
    async fn probe_reachable(&self, _force: bool) -> Result<ProbeResult> {
        self.enter(MemoryOp::Probe)?;
        Ok(ProbeResult::ok())
    }

    async fn probe_writable(&self) -> bool {
        self.enter(MemoryOp::Probe).is_ok() && !self.state.lock().failing.contains(&MemoryOp::Upload)
    }

    async fn list(&self) -> Result<Vec<SnapshotFile>> {
        self.enter(MemoryOp::List)?;
        let state = self.state.lock();
        let mut files: Vec<SnapshotFile> = state
            .objects
            .iter()
            .filter(|(name, _)| name.ends_with(SNAPSHOT_EXTENSION))
            .map(|(name, object)| SnapshotFile {
                name: name.clone(),
                lastmod: Utc.timestamp_millis_opt(object.mtime_ms).single(),
                size: object.body.len() as u64,
            })
            .collect();
        files.sort_by(|a, b| b.lastmod_ms().cmp(&a.lastmod_ms()));
        Ok(files)
    }

    async fn upload(&self, name: &str, payload: &SnapshotPayload) -> Result<()> {
        self.enter(MemoryOp::Upload)?;
        self.insert_raw(name, serde_json::to_vec(payload)?);
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<SnapshotPayload> {
        self.enter(MemoryOp::Download)?;
        let state = self.state.lock();
        let object = state
            .objects
            .get(name)
            .ok_or_else(|| SyncError::NotFound(name.to_string()))?;
        Ok(serde_json::from_slice(&object.body)?)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.enter(MemoryOp::Remove)?;
        let mut state = self.state.lock();
        if state.failing_names.contains(name) {
            return Err(SyncError::protocol(423, format!("{} is locked", name)));
        }
        state
            .objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(name.to_string()))
    }
}

/// Factory handing out one shared [`MemoryTransport`]
#[derive(Clone, Default)]
pub struct MemoryConnector {
    transport: Arc<MemoryTransport>,
}

impl MemoryConnector {
    pub fn new(transport: Arc<MemoryTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }
}

impl TransportFactory for MemoryConnector {
    fn connect(&self, config: &WebDavSettings) -> Result<Arc<dyn SnapshotTransport>> {
        if !config.is_configured() {
            return Err(SyncError::Config("WebDAV URL is not configured".to_string()));
        }
        Ok(self.transport.clone())
    }
}
