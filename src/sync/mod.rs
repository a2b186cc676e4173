//! Cloud backup and sync over WebDAV
//!
//! Snapshots of the local dataset are uploaded as uniquely named JSON files.
//! Their names carry the only timestamp the engine trusts; everything else
//! (retention, newer-remote checks, restore provenance) is derived from it.

pub mod backup;
pub mod conflict;
pub mod executor;
pub mod timestamp;
pub mod webdav;
pub mod worker;

pub use backup::{snapshot_name, BackupOrchestrator, BackupOutcome, SkipReason};
pub use conflict::{ConflictDetector, RemoteCheck, NEWER_THRESHOLD_MS};
pub use executor::{SyncExecutor, SyncOutcome, SyncReport, SyncState, SyncTrigger};
pub use timestamp::{TimestampCodec, TokenFormat};
pub use webdav::{
    MemoryConnector, MemoryTransport, SnapshotTransport, TransportFactory, ValidationCache,
    ValidationCacheConfig, WebDavClient, WebDavConnector,
};
pub use worker::{BackupWorker, Scheduler, TimerRegistry, WorkerCommand};
