//! WebDAV transport
//!
//! Thin authenticated client over a base collection URL. The engine talks to
//! it through [`SnapshotTransport`] and obtains instances from a
//! [`TransportFactory`], because settings are re-read before every operation
//! and a new URL or password means a new client.

mod cache;
mod client;
pub mod memory;
pub mod multistatus;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::Result;
use crate::types::{ProbeResult, SnapshotFile, SnapshotPayload, WebDavSettings};

pub use cache::{ValidationCache, ValidationCacheConfig, ValidationCacheEntry, ValidationCacheStats};
pub use client::{WebDavClient, WebDavConnector};
pub use memory::{MemoryConnector, MemoryTransport};
pub use multistatus::{MultistatusEntry, MultistatusExtractor, RegexExtractor};

/// Header carrying the real upstream URL on relayed requests
pub const RELAY_TARGET_HEADER: &str = "x-relay-target";

/// Header carrying the real method when the wire method was downgraded
pub const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

/// Operations the engine needs from a remote snapshot store
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    /// Check that the collection answers with the configured credentials.
    ///
    /// Successful results are cached; `force` skips the cache.
    async fn probe_reachable(&self, force: bool) -> Result<ProbeResult>;

    /// Whether a throwaway object can be written (and cleaned up)
    async fn probe_writable(&self) -> bool;

    /// Snapshot files in the collection, newest server mtime first
    async fn list(&self) -> Result<Vec<SnapshotFile>>;

    async fn upload(&self, name: &str, payload: &SnapshotPayload) -> Result<()>;

    async fn download(&self, name: &str) -> Result<SnapshotPayload>;

    async fn remove(&self, name: &str) -> Result<()>;
}

/// Builds a transport for the current connection settings
pub trait TransportFactory: Send + Sync {
    fn connect(&self, config: &WebDavSettings) -> Result<Arc<dyn SnapshotTransport>>;
}

/// Wire method and override header for a request sent through the relay.
///
/// Hosting platforms in front of a relay often only pass GET and POST, so
/// every other method travels as POST with the real one in
/// [`METHOD_OVERRIDE_HEADER`].
pub fn relay_wire_method(method: &Method) -> (Method, Option<Method>) {
    if *method == Method::GET || *method == Method::POST {
        (method.clone(), None)
    } else {
        (Method::POST, Some(method.clone()))
    }
}
