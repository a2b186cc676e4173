//! Same-origin relay for WebDAV requests
//!
//! Clients that cannot reach a WebDAV server directly (browser origins,
//! restrictive proxies) send every request here instead. The upstream URL
//! travels in [`RELAY_TARGET_HEADER`]; methods other than GET and POST arrive
//! as POST with the real method in [`METHOD_OVERRIDE_HEADER`]. The relay
//! restores the method, forwards the request and mirrors the upstream status,
//! content type and body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{Result, SyncError};
use crate::sync::webdav::{METHOD_OVERRIDE_HEADER, RELAY_TARGET_HEADER};

/// Request headers passed on to the upstream server
const FORWARDED_HEADERS: [header::HeaderName; 4] = [
    header::AUTHORIZATION,
    header::CONTENT_TYPE,
    header::ACCEPT,
    header::HeaderName::from_static("depth"),
];

/// Relay settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hosts the relay may forward to; empty allows any
    pub allowed_hosts: Vec<String>,
    /// Largest request body accepted
    pub max_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Shared relay state
#[derive(Clone)]
pub struct RelayState {
    http: reqwest::Client,
    config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("marksync-relay/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SyncError::Internal(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.config.allowed_hosts.is_empty()
            || self
                .config
                .allowed_hosts
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

/// Relay HTTP server
pub struct RelayServer {
    state: RelayState,
    addr: SocketAddr,
}

impl RelayServer {
    pub fn new(state: RelayState, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    /// Build the router
    pub fn router(state: RelayState) -> Router {
        let body_limit = state.config.max_body_bytes;
        Router::new()
            .route("/health", get(health_handler))
            .fallback(relay_handler)
            .with_state(state)
            .layer(DefaultBodyLimit::max(body_limit))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Start the server
    pub async fn start(self) -> std::io::Result<()> {
        let app = Self::router(self.state);

        tracing::info!("Relay listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    })
    .to_string()
}

async fn relay_handler(
    State(state): State<RelayState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match forward(&state, method, &headers, body).await {
        Ok(response) => response,
        Err((status, message)) => {
            tracing::warn!(status = status.as_u16(), error = %message, "Relay request rejected");
            (status, message).into_response()
        }
    }
}

/// Method the client actually meant
fn effective_method(wire: Method, headers: &HeaderMap) -> std::result::Result<Method, (StatusCode, String)> {
    let Some(value) = headers.get(METHOD_OVERRIDE_HEADER) else {
        return Ok(wire);
    };
    if wire != Method::POST {
        return Err((
            StatusCode::BAD_REQUEST,
            "method override is only accepted on POST".to_string(),
        ));
    }
    value
        .to_str()
        .ok()
        .and_then(|s| Method::from_bytes(s.trim().to_ascii_uppercase().as_bytes()).ok())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "invalid method override".to_string()))
}

async fn forward(
    state: &RelayState,
    wire: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, (StatusCode, String)> {
    let target = headers
        .get(RELAY_TARGET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("missing {} header", RELAY_TARGET_HEADER)))?;
    let url = reqwest::Url::parse(target)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid relay target: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err((StatusCode::BAD_REQUEST, "relay target must be http(s)".to_string()));
    }
    let host = url.host_str().unwrap_or_default();
    if !state.host_allowed(host) {
        return Err((StatusCode::FORBIDDEN, format!("host '{}' is not allowed", host)));
    }

    let method = effective_method(wire, headers)?;
    let mut request = state.http.request(method.clone(), url.clone());
    for name in FORWARDED_HEADERS.iter() {
        if let Some(value) = headers.get(name) {
            request = request.header(name, value);
        }
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = request.send().await.map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            format!("upstream request failed: {}", e.without_url()),
        )
    })?;

    let status = upstream.status();
    let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("upstream body failed: {}", e)))?;

    tracing::debug!(
        method = %method,
        host = %url.host_str().unwrap_or_default(),
        status = status.as_u16(),
        bytes = bytes.len(),
        "Relayed request"
    );

    let mut response = Response::builder().status(status);
    if let Some(content_type) = content_type {
        response = response.header(header::CONTENT_TYPE, content_type);
    }
    response
        .body(Body::from(bytes))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
