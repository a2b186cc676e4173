//! reqwest-backed WebDAV client

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};

use super::multistatus::{snapshot_files, PROPFIND_BODY};
use super::{
    relay_wire_method, MultistatusExtractor, RegexExtractor, SnapshotTransport, TransportFactory,
    ValidationCache, METHOD_OVERRIDE_HEADER, RELAY_TARGET_HEADER,
};
use crate::error::{Result, SyncError};
use crate::types::{ProbeResult, SnapshotFile, SnapshotPayload, WebDavSettings};

const MAX_ERROR_BODY: usize = 200;

static PROPFIND: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"PROPFIND").unwrap());
static MKCOL: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"MKCOL").unwrap());

/// Where requests physically go
#[derive(Debug, Clone)]
enum Route {
    Direct,
    Relay(Url),
}

fn parse_http_url(raw: &str, what: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| SyncError::InvalidInput(format!("invalid {} '{}': {}", what, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SyncError::InvalidInput(format!(
            "{} must use http or https, got '{}'",
            what, other
        ))),
    }
}

/// Authenticated client for one WebDAV collection
pub struct WebDavClient {
    http: reqwest::Client,
    base: Url,
    config: WebDavSettings,
    route: Route,
    cache: Arc<ValidationCache>,
    extractor: Arc<dyn MultistatusExtractor>,
}

impl WebDavClient {
    /// Create a client; fails if the URL is not an absolute http(s) URL
    pub fn new(
        http: reqwest::Client,
        config: WebDavSettings,
        cache: Arc<ValidationCache>,
    ) -> Result<Self> {
        if !config.is_configured() {
            return Err(SyncError::Config("WebDAV URL is not configured".to_string()));
        }
        let base = parse_http_url(&config.base_url(), "WebDAV URL")?;
        let route = match config.relay_url.as_deref().map(str::trim) {
            Some(relay) if !relay.is_empty() => Route::Relay(parse_http_url(relay, "relay URL")?),
            _ => Route::Direct,
        };

        Ok(Self {
            http,
            base,
            config,
            route,
            cache,
            extractor: Arc::new(RegexExtractor),
        })
    }

    /// Swap the multistatus extractor
    pub fn with_extractor(mut self, extractor: Arc<dyn MultistatusExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `<baseUrl><urlEncodedName>`
    pub fn object_url(&self, name: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidInput(format!("cannot append to {}", self.base)))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    /// Basic credentials; none when both username and password are empty
    fn authorization(&self) -> Option<String> {
        if self.config.username.is_empty() && self.config.password.is_empty() {
            return None;
        }
        let raw = format!("{}:{}", self.config.username, self.config.password);
        Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
        ))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = match &self.route {
            Route::Direct => self.http.request(method, url),
            Route::Relay(endpoint) => {
                let (wire, real) = relay_wire_method(&method);
                let builder = self
                    .http
                    .request(wire, endpoint.clone())
                    .header(RELAY_TARGET_HEADER, url.as_str());
                match real {
                    Some(real) => builder.header(METHOD_OVERRIDE_HEADER, real.as_str()),
                    None => builder,
                }
            }
        };
        match self.authorization() {
            Some(auth) => builder.header(AUTHORIZATION, auth),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| SyncError::Network(e.without_url().to_string()))
    }

    async fn ensure_success(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("unexpected status").to_string()
        } else {
            body
        };
        Err(SyncError::from_status(status.as_u16(), message))
    }

    async fn put(&self, url: Url, body: Vec<u8>) -> Result<Response> {
        self.send(
            self.request(Method::PUT, url)
                .header(CONTENT_TYPE, "application/json")
                .body(body),
        )
        .await
    }

    async fn ensure_collection(&self) -> Result<()> {
        let response = self.send(self.request(MKCOL.clone(), self.base.clone())).await?;
        // 405: the collection already exists
        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        Self::ensure_success(response).await?;
        tracing::info!(collection = %self.base, "Created WebDAV collection");
        Ok(())
    }

    fn cache_key(&self) -> String {
        ValidationCache::key_for(&self.config)
    }
}

#[async_trait]
impl SnapshotTransport for WebDavClient {
    async fn probe_reachable(&self, force: bool) -> Result<ProbeResult> {
        let key = self.cache_key();
        if !force {
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(url = %self.base, "Connection validation served from cache");
                return Ok(hit);
            }
        }

        let outcome: Result<Response> = async {
            let response = self
                .send(
                    self.request(PROPFIND.clone(), self.base.clone())
                        .header("Depth", "0")
                        .header(CONTENT_TYPE, "application/xml; charset=utf-8")
                        .body(PROPFIND_BODY),
                )
                .await?;
            Self::ensure_success(response).await
        }
        .await;

        match outcome {
            Ok(_) => {
                let result = ProbeResult::ok();
                self.cache.put(key, result.clone());
                Ok(result)
            }
            Err(e) => {
                self.cache.invalidate(&key);
                tracing::warn!(url = %self.base, error = %e, "WebDAV reachability check failed");
                Err(e)
            }
        }
    }

    async fn probe_writable(&self) -> bool {
        if let Err(e) = self.probe_reachable(false).await {
            tracing::warn!(error = %e, "Skipping write probe: server unreachable");
            return false;
        }

        let name = format!(".marksync-write-test-{}.tmp", uuid::Uuid::new_v4().simple());
        let url = match self.object_url(&name) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Write probe URL could not be built");
                return false;
            }
        };

        let uploaded = match self.put(url.clone(), b"ok".to_vec()).await {
            Ok(response) => Self::ensure_success(response).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = uploaded {
            tracing::warn!(error = %e, "Write probe upload failed");
            self.cache.set_can_write(&self.cache_key(), false);
            return false;
        }

        let removed = match self.send(self.request(Method::DELETE, url)).await {
            Ok(response) => Self::ensure_success(response).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            tracing::warn!(file = %name, error = %e, "Write probe file could not be deleted");
        }

        self.cache.set_can_write(&self.cache_key(), true);
        true
    }

    async fn list(&self) -> Result<Vec<SnapshotFile>> {
        let response = self
            .send(
                self.request(PROPFIND.clone(), self.base.clone())
                    .header("Depth", "1")
                    .header(CONTENT_TYPE, "application/xml; charset=utf-8")
                    .body(PROPFIND_BODY),
            )
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::METHOD_NOT_ALLOWED {
            tracing::warn!(
                status = status.as_u16(),
                url = %self.base,
                "Listing not permitted, treating collection as empty"
            );
            return Ok(Vec::new());
        }

        let body = Self::ensure_success(response)
            .await?
            .text()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(snapshot_files(self.extractor.extract(&body)))
    }

    async fn upload(&self, name: &str, payload: &SnapshotPayload) -> Result<()> {
        let url = self.object_url(name)?;
        let body = serde_json::to_vec(payload)?;
        let size = body.len();

        let mut response = self.put(url.clone(), body.clone()).await?;
        if response.status() == StatusCode::CONFLICT {
            self.ensure_collection().await?;
            response = self.put(url, body).await?;
        }
        Self::ensure_success(response).await?;

        tracing::info!(file = %name, bytes = size, "Uploaded snapshot");
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<SnapshotPayload> {
        let url = self.object_url(name)?;
        let response = self.send(self.request(Method::GET, url)).await?;
        let bytes = Self::ensure_success(response)
            .await?
            .bytes()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let payload = serde_json::from_slice(&bytes)?;
        tracing::info!(file = %name, bytes = bytes.len(), "Downloaded snapshot");
        Ok(payload)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let url = self.object_url(name)?;
        let response = self.send(self.request(Method::DELETE, url)).await?;
        Self::ensure_success(response).await?;
        tracing::info!(file = %name, "Deleted snapshot");
        Ok(())
    }
}

/// Production [`TransportFactory`]: one shared HTTP client and validation
/// cache for every connection
#[derive(Clone)]
pub struct WebDavConnector {
    http: reqwest::Client,
    cache: Arc<ValidationCache>,
    extractor: Arc<dyn MultistatusExtractor>,
}

impl WebDavConnector {
    pub fn new(cache: Arc<ValidationCache>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marksync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Internal(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            http,
            cache,
            extractor: Arc::new(RegexExtractor),
        })
    }

    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }
}

impl TransportFactory for WebDavConnector {
    fn connect(&self, config: &WebDavSettings) -> Result<Arc<dyn SnapshotTransport>> {
        let client = WebDavClient::new(self.http.clone(), config.clone(), self.cache.clone())?
            .with_extractor(self.extractor.clone());
        Ok(Arc::new(client))
    }
}
