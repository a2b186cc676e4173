//! Marksync - bookmark backup & sync engine
//!
//! Versioned snapshots of a local bookmark dataset on any WebDAV server,
//! with per-client retention, newer-remote detection and a restore path
//! that always takes a safety snapshot before overwriting local data.

pub mod clock;
pub mod error;
pub mod events;
#[cfg(feature = "relay")]
pub mod relay;
pub mod service;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Result, SyncError};
pub use events::{EventBus, EventType, SyncEvent};
pub use service::{Request, Response, SyncService};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
